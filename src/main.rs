use anyhow::{Context, Result, anyhow};
use clap::Parser;
use flow_deploy::clock::SystemClock;
use flow_deploy::cli::{Cli, Command};
use flow_deploy::engine::DeployEngine;
use flow_deploy::error::FlowError;
use flow_deploy::history::TagHistory;
use flow_deploy::invoker::ComposeInvoker;
use flow_deploy::lock::DeployLock;
use flow_deploy::logger::Logger;
use flow_deploy::manifest::{Planner, Role};
use flow_deploy::probe::ContainerProbe;
use flow_deploy::runner::{CommandRunner, SubprocessRunner};
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            let flow_err = err.downcast::<FlowError>().unwrap_or_else(FlowError::Other);
            eprintln!("error: {flow_err}");
            ExitCode::from(flow_err.exit_code() as u8)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("flow_deploy={default_level}")));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Registers SIGINT/SIGTERM to set a shared flag, following the same
/// `signal-hook` flag-based pattern used elsewhere in this corpus for
/// synchronous (non-tokio) signal handling.
fn install_interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag))
        .context("registering SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .context("registering SIGTERM handler")?;
    Ok(flag)
}

fn run(cli: Cli) -> Result<i32> {
    let runner: &dyn CommandRunner = &SubprocessRunner;
    let clock = SystemClock;
    let invoker = ComposeInvoker::resolve(&cli.project_dir);

    match cli.command {
        Command::Deploy { tag, service, dry_run, json } => {
            let interrupted = install_interrupt_flag()?;
            run_deploy(&invoker, runner, &clock, &cli.project_dir, tag.as_deref(), &service, dry_run, json, &interrupted)
        }
        Command::Rollback { service, dry_run, json } => {
            let history = TagHistory::at(&cli.project_dir);
            let target = history
                .previous()
                .context("reading tag history")?
                .ok_or_else(|| anyhow!("no previous tag recorded to roll back to"))?;
            let interrupted = install_interrupt_flag()?;
            run_deploy(&invoker, runner, &clock, &cli.project_dir, Some(&target), &service, dry_run, json, &interrupted)
        }
        Command::Status { hosts } => run_status(&invoker, runner, &cli.project_dir, hosts),
        Command::Exec { service, command } => run_exec(&invoker, runner, &service, &command),
        Command::Logs { service, follow } => run_logs(&invoker, runner, &service, follow),
        Command::SelfUpgrade => run_self_upgrade(&invoker, runner),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_deploy(
    invoker: &ComposeInvoker,
    runner: &dyn CommandRunner,
    clock: &SystemClock,
    project_dir: &std::path::Path,
    tag: Option<&str>,
    service_filter: &[String],
    dry_run: bool,
    json: bool,
    interrupted: &AtomicBool,
) -> Result<i32> {
    let config = invoker.config(runner).map_err(FlowError::from)?;
    let planner = Planner::parse(&config).map_err(FlowError::from)?;
    let plan = planner.plan(service_filter).map_err(FlowError::from)?;

    let _lock = if dry_run {
        None
    } else {
        Some(DeployLock::acquire(project_dir).map_err(FlowError::from)?)
    };

    let engine = DeployEngine::new(invoker, runner, clock, project_dir).with_interrupt_flag(interrupted);
    let outcome = engine.deploy(&plan, tag, dry_run);

    Logger::new().report(&outcome);
    if json {
        println!("{}", serde_json::to_string(&outcome).context("serializing outcome")?);
    }

    Ok(if outcome.interrupted {
        130
    } else if outcome.success() {
        0
    } else {
        1
    })
}

fn run_status(
    invoker: &ComposeInvoker,
    runner: &dyn CommandRunner,
    project_dir: &std::path::Path,
    hosts: bool,
) -> Result<i32> {
    let config = invoker.config(runner).map_err(FlowError::from)?;
    let planner = Planner::parse(&config).map_err(FlowError::from)?;

    if hosts {
        let groups = planner.host_groups().map_err(FlowError::from)?;
        println!("{}", serde_json::to_string_pretty(&groups).context("serializing host groups")?);
        return Ok(0);
    }

    let clock = SystemClock;
    let probe = ContainerProbe::new(runner, &clock, project_dir);
    for service in &planner.all_services {
        let health = match service.role {
            Role::App => current_health(&probe, &service.name),
            Role::Accessory | Role::None => "not health-checked".to_string(),
        };
        println!(
            "{:<20} role={:<10} order={:<5} {}",
            service.name,
            format!("{:?}", service.role).to_lowercase(),
            service.order,
            health,
        );
    }
    Ok(0)
}

/// Reports the health of the currently running container for an app
/// service, or "not deployed" if none exists yet (spec.md §8).
fn current_health(probe: &ContainerProbe<'_>, service: &str) -> String {
    let ids = match probe.list(service) {
        Ok(ids) => ids,
        Err(_) => return "unknown".to_string(),
    };
    let Some(id) = ids.last() else {
        return "not deployed".to_string();
    };
    match probe.inspect(id) {
        Ok(info) => format!("{:?}", info.health).to_lowercase(),
        Err(_) => "unknown".to_string(),
    }
}

fn run_exec(
    invoker: &ComposeInvoker,
    runner: &dyn CommandRunner,
    service: &str,
    command: &[String],
) -> Result<i32> {
    let args: Vec<&str> = std::iter::once(service)
        .chain(command.iter().map(String::as_str))
        .collect();
    let output = invoker
        .run(runner, "exec", &args, &HashMap::new())
        .context("exec failed")?;
    print!("{}", output.combined());
    Ok(if output.success { 0 } else { 1 })
}

fn run_logs(
    invoker: &ComposeInvoker,
    runner: &dyn CommandRunner,
    service: &[String],
    follow: bool,
) -> Result<i32> {
    let mut args: Vec<&str> = Vec::new();
    if follow {
        args.push("--follow");
    }
    let service_refs: Vec<&str> = service.iter().map(String::as_str).collect();
    args.extend(service_refs);
    let output = invoker.run(runner, "logs", &args, &HashMap::new()).context("logs failed")?;
    print!("{}", output.combined());
    Ok(if output.success { 0 } else { 1 })
}

/// Packaging/self-upgrade plumbing is out of scope for this build; the
/// stub reports that honestly instead of silently doing nothing.
fn run_self_upgrade(_invoker: &ComposeInvoker, _runner: &dyn CommandRunner) -> Result<i32> {
    eprintln!("self-upgrade is not implemented in this build");
    Ok(1)
}
