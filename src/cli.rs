//! Component G: CLI Dispatch. `clap` derive surface; dispatch to the
//! engine lives in `main.rs` so this module stays pure argument
//! parsing, the same separation `ops-cli` draws between its `Cli`
//! struct and its command handlers.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "flow-deploy", version, about = "Rolling, health-checked deploys of Docker Compose stacks")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Project directory containing docker-compose.yml. Defaults to the
    /// current directory.
    #[arg(long, global = true, default_value = ".")]
    pub project_dir: PathBuf,

    /// Emit internal tracing diagnostics at debug level.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Roll out a tag to every app service, one at a time.
    Deploy {
        /// Image tag to deploy. If omitted, DEPLOY_TAG is left unexported
        /// and the manifest's own `${DEPLOY_TAG:-...}` default applies.
        #[arg(long)]
        tag: Option<String>,

        /// Restrict the deploy to specific services; repeatable.
        #[arg(long = "service")]
        service: Vec<String>,

        /// Print the plan without touching the container runtime.
        #[arg(long)]
        dry_run: bool,

        /// Emit the final outcome as a single JSON object on stdout.
        #[arg(long)]
        json: bool,
    },

    /// Roll back to the tag recorded immediately before the current one.
    Rollback {
        #[arg(long = "service")]
        service: Vec<String>,

        #[arg(long)]
        dry_run: bool,

        #[arg(long)]
        json: bool,
    },

    /// Show the current plan, tag history, and per-service health.
    Status {
        /// Group app services by resolved host/user/dir instead of
        /// listing the single-node plan.
        #[arg(long)]
        hosts: bool,
    },

    /// Run a one-off command inside a running service container.
    Exec {
        service: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Tail logs for one or more services.
    Logs {
        #[arg(long = "service")]
        service: Vec<String>,

        #[arg(long)]
        follow: bool,
    },

    /// Not implemented in this build; packaging and self-upgrade
    /// plumbing live outside this crate.
    SelfUpgrade,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_leaves_tag_unset_by_default() {
        let cli = Cli::parse_from(["flow-deploy", "deploy"]);
        match cli.command {
            Command::Deploy { tag, service, dry_run, json } => {
                assert_eq!(tag, None);
                assert!(service.is_empty());
                assert!(!dry_run);
                assert!(!json);
            }
            other => panic!("expected Deploy, got {other:?}"),
        }
    }

    #[test]
    fn deploy_collects_repeated_service_flags() {
        let cli = Cli::parse_from([
            "flow-deploy", "deploy", "--service", "web", "--service", "worker", "--tag", "v3",
        ]);
        match cli.command {
            Command::Deploy { tag, service, .. } => {
                assert_eq!(tag, Some("v3".to_string()));
                assert_eq!(service, vec!["web".to_string(), "worker".to_string()]);
            }
            other => panic!("expected Deploy, got {other:?}"),
        }
    }

    #[test]
    fn rollback_has_no_tag_override() {
        let cli = Cli::parse_from(["flow-deploy", "rollback", "--service", "web"]);
        match cli.command {
            Command::Rollback { service, .. } => assert_eq!(service, vec!["web".to_string()]),
            other => panic!("expected Rollback, got {other:?}"),
        }
    }

    #[test]
    fn status_hosts_flag_parses() {
        let cli = Cli::parse_from(["flow-deploy", "status", "--hosts"]);
        match cli.command {
            Command::Status { hosts } => assert!(hosts),
            other => panic!("expected Status, got {other:?}"),
        }
    }
}
