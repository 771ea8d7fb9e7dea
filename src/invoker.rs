//! Component A: Compose Invoker. Resolves the project's compose wrapper
//! and shells out to it, exactly as `docker-compose-runner`'s own
//! `run_command` helper does, but generalized to the three call shapes
//! the Rolling Deploy Engine needs (`config`, `pull`, `up --scale`).

use crate::error::ConfigError;
use crate::runner::{CommandRunner, RunOutput};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The resolved program + leading args used to invoke the compose
/// wrapper. For the bare-docker fallback this is `docker compose`; for a
/// wrapper script it is just the script path with no leading args.
#[derive(Debug, Clone)]
pub struct ComposeInvoker {
    program: String,
    leading_args: Vec<String>,
    project_dir: PathBuf,
}

impl ComposeInvoker {
    /// Resolution order (spec.md §4.A):
    /// 1. `COMPOSE_COMMAND` env var.
    /// 2. `./script/prod` if present and executable.
    /// 3. the literal `docker compose` invocation.
    pub fn resolve(project_dir: &Path) -> ComposeInvoker {
        if let Ok(cmd) = env::var("COMPOSE_COMMAND") {
            debug!(cmd, "resolved compose wrapper from COMPOSE_COMMAND");
            return ComposeInvoker {
                program: cmd,
                leading_args: Vec::new(),
                project_dir: project_dir.to_path_buf(),
            };
        }

        let script = project_dir.join("script/prod");
        if is_executable(&script) {
            debug!(path = %script.display(), "resolved compose wrapper to script/prod");
            return ComposeInvoker {
                program: script.to_string_lossy().into_owned(),
                leading_args: Vec::new(),
                project_dir: project_dir.to_path_buf(),
            };
        }

        debug!("resolved compose wrapper to bare `docker compose`");
        ComposeInvoker {
            program: "docker".to_string(),
            leading_args: vec!["compose".to_string()],
            project_dir: project_dir.to_path_buf(),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Invokes the wrapper with the given subcommand and arguments, merging
    /// `envs` into the current process environment (notably `DEPLOY_TAG`),
    /// and running it with the project directory as its cwd so the
    /// manifest a bare `docker compose` resolves matches the one the
    /// Deploy Lock and Tag History are keyed on.
    pub fn run(
        &self,
        runner: &dyn CommandRunner,
        subcommand: &str,
        args: &[&str],
        envs: &HashMap<String, String>,
    ) -> Result<RunOutput> {
        let mut full_args: Vec<String> = self.leading_args.clone();
        full_args.push(subcommand.to_string());
        full_args.extend(args.iter().map(|s| s.to_string()));

        runner
            .run(&self.program, &full_args, envs, &self.project_dir)
            .with_context(|| {
                format!(
                    "compose wrapper `{} {}` failed in {}",
                    self.program,
                    full_args.join(" "),
                    self.project_dir.display()
                )
            })
    }

    /// Returns the fully merged manifest as parsed YAML.
    pub fn config(&self, runner: &dyn CommandRunner) -> Result<serde_yaml::Value, ConfigError> {
        let output = self
            .run(runner, "config", &[], &HashMap::new())
            .map_err(|e| ConfigError::Manifest(e.to_string()))?;
        if !output.success {
            return Err(ConfigError::Manifest(output.combined()));
        }
        serde_yaml::from_str(&output.stdout)
            .map_err(|e| ConfigError::Manifest(format!("invalid merged config YAML: {e}")))
    }

    /// `pull <service>`, exporting `DEPLOY_TAG` if set.
    pub fn pull(
        &self,
        runner: &dyn CommandRunner,
        service: &str,
        env_overrides: &HashMap<String, String>,
    ) -> Result<RunOutput> {
        self.run(runner, "pull", &[service], env_overrides)
    }

    /// `up -d --no-deps [--no-recreate] --scale <service>=<n>`.
    pub fn up_scale(
        &self,
        runner: &dyn CommandRunner,
        service: &str,
        n: u32,
        no_recreate: bool,
        env_overrides: &HashMap<String, String>,
    ) -> Result<RunOutput> {
        let scale_arg = format!("{service}={n}");
        let mut args = vec!["-d", "--no-deps"];
        if no_recreate {
            args.push("--no-recreate");
        }
        args.push("--scale");
        args.push(&scale_arg);
        self.run(runner, "up", &args, env_overrides)
    }
}

fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;
    use tempfile::tempdir;

    #[test]
    fn resolves_from_env_var() {
        std::env::set_var("COMPOSE_COMMAND", "my-wrapper");
        let dir = tempdir().unwrap();
        let invoker = ComposeInvoker::resolve(dir.path());
        assert_eq!(invoker.program, "my-wrapper");
        std::env::remove_var("COMPOSE_COMMAND");
    }

    #[test]
    fn falls_back_to_bare_docker_compose() {
        std::env::remove_var("COMPOSE_COMMAND");
        let dir = tempdir().unwrap();
        let invoker = ComposeInvoker::resolve(dir.path());
        assert_eq!(invoker.program, "docker");
        assert_eq!(invoker.leading_args, vec!["compose".to_string()]);
    }

    #[test]
    fn config_parses_merged_yaml() {
        std::env::remove_var("COMPOSE_COMMAND");
        let dir = tempdir().unwrap();
        let invoker = ComposeInvoker::resolve(dir.path());
        let runner = FakeRunner::new();
        runner.push(
            "docker",
            &["compose", "config"],
            FakeRunner::ok("services:\n  web:\n    image: app:latest\n"),
        );
        let value = invoker.config(&runner).unwrap();
        assert!(value.get("services").is_some());
    }

    #[test]
    fn config_failure_is_a_manifest_error() {
        std::env::remove_var("COMPOSE_COMMAND");
        let dir = tempdir().unwrap();
        let invoker = ComposeInvoker::resolve(dir.path());
        let runner = FakeRunner::new();
        runner.push(
            "docker",
            &["compose", "config"],
            FakeRunner::failed("no such file or directory"),
        );
        let err = invoker.config(&runner).unwrap_err();
        assert!(matches!(err, ConfigError::Manifest(_)));
    }
}
