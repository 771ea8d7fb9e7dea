//! Component E: Rolling Deploy Engine. Drives each app service through
//! the one-at-a-time rolling sequence: pull the new tag, scale up by
//! one alongside the running containers, wait for the new container to
//! report healthy, drain and remove the old containers, then reconcile
//! the compose-managed scale back to its original size. A failure at
//! any step before the new container is healthy rolls that service back
//! and skips every service still queued behind it.

use crate::clock::Clock;
use crate::history::TagHistory;
use crate::invoker::ComposeInvoker;
use crate::manifest::{DeployPlan, Service};
use crate::probe::{ContainerProbe, Health};
use crate::runner::CommandRunner;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceOutcome {
    Succeeded,
    Failed(String),
    /// Not attempted because an earlier service in the plan failed.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceResult {
    pub name: String,
    pub outcome: ServiceOutcome,
    pub elapsed_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployOutcome {
    /// `None` when no explicit tag was requested, i.e. every service's
    /// manifest `${DEPLOY_TAG:-...}` default was left to resolve on its own.
    pub tag: Option<String>,
    pub dry_run: bool,
    pub results: Vec<ServiceResult>,
    pub elapsed_secs: u64,
    /// Set if a SIGINT/SIGTERM arrived during the run; the caller should
    /// exit 130 rather than the usual 0/1.
    pub interrupted: bool,
}

impl DeployOutcome {
    pub fn success(&self) -> bool {
        !self.interrupted
            && self
                .results
                .iter()
                .all(|r| matches!(r.outcome, ServiceOutcome::Succeeded))
    }
}

pub struct DeployEngine<'a> {
    invoker: &'a ComposeInvoker,
    runner: &'a dyn CommandRunner,
    clock: &'a dyn Clock,
    project_dir: &'a Path,
    /// Set by a SIGINT/SIGTERM handler; checked between health polls so a
    /// signal arriving mid-wait still drives the in-progress service
    /// through RollingBack instead of leaving it half-started.
    interrupted: Option<&'a AtomicBool>,
}

impl<'a> DeployEngine<'a> {
    pub fn new(
        invoker: &'a ComposeInvoker,
        runner: &'a dyn CommandRunner,
        clock: &'a dyn Clock,
        project_dir: &'a Path,
    ) -> Self {
        DeployEngine { invoker, runner, clock, project_dir, interrupted: None }
    }

    /// Attaches a cancellation flag; `deploy`/`rollback` will roll back the
    /// in-progress service and stop as soon as it observes the flag set.
    pub fn with_interrupt_flag(mut self, flag: &'a AtomicBool) -> Self {
        self.interrupted = Some(flag);
        self
    }

    /// Runs the full rolling deploy for `plan`. When `tag` is `Some`, it is
    /// exported as `DEPLOY_TAG` to every subprocess and, on total success,
    /// recorded in the tag history; when `None`, `DEPLOY_TAG` is left
    /// unexported so each service's manifest default applies, and the tag
    /// history is left untouched since the engine never learns which tag
    /// was actually resolved. A dry run never touches the container
    /// runtime or the history file.
    pub fn deploy(&self, plan: &DeployPlan, tag: Option<&str>, dry_run: bool) -> DeployOutcome {
        let run_start = self.clock.now();
        let mut results = Vec::with_capacity(plan.services.len());
        let mut aborted = false;

        for service in &plan.services {
            if aborted || self.is_interrupted() {
                results.push(ServiceResult {
                    name: service.name.clone(),
                    outcome: ServiceOutcome::Skipped,
                    elapsed_secs: 0,
                });
                continue;
            }

            if dry_run {
                info!(service = %service.name, ?tag, "dry run: would deploy");
                results.push(ServiceResult {
                    name: service.name.clone(),
                    outcome: ServiceOutcome::Succeeded,
                    elapsed_secs: 0,
                });
                continue;
            }

            let service_start = self.clock.now();
            match self.deploy_one(service, tag) {
                Ok(()) => {
                    info!(service = %service.name, "deploy succeeded");
                    results.push(ServiceResult {
                        name: service.name.clone(),
                        outcome: ServiceOutcome::Succeeded,
                        elapsed_secs: elapsed(self.clock.now(), service_start).as_secs(),
                    });
                }
                Err(message) => {
                    error!(service = %service.name, error = %message, "deploy failed, rolling back");
                    results.push(ServiceResult {
                        name: service.name.clone(),
                        outcome: ServiceOutcome::Failed(message),
                        elapsed_secs: elapsed(self.clock.now(), service_start).as_secs(),
                    });
                    aborted = true;
                }
            }
        }

        let interrupted = self.is_interrupted();
        let outcome = DeployOutcome {
            tag: tag.map(str::to_string),
            dry_run,
            results,
            elapsed_secs: elapsed(self.clock.now(), run_start).as_secs(),
            interrupted,
        };
        if !dry_run && outcome.success() {
            if let Some(t) = tag {
                if let Err(e) = TagHistory::at(self.project_dir).record(t) {
                    warn!(error = %e, "deploy succeeded but failed to record tag history");
                }
            }
        }
        outcome
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Rolls the fleet back to `tag` by re-running the same rolling
    /// sequence against it; the engine does not distinguish "forward"
    /// deploys from rollbacks, a rollback is just a deploy of an older
    /// tag (spec.md §4.E).
    pub fn rollback(&self, plan: &DeployPlan, tag: Option<&str>) -> DeployOutcome {
        self.deploy(plan, tag, false)
    }

    fn deploy_one(&self, service: &Service, tag: Option<&str>) -> Result<(), String> {
        let probe = ContainerProbe::new(self.runner, self.clock, self.project_dir);
        let mut envs = HashMap::new();
        if let Some(t) = tag {
            envs.insert("DEPLOY_TAG".to_string(), t.to_string());
        }

        let before: HashSet<String> = probe
            .list(&service.name)
            .map_err(|e| format!("listing existing containers: {e}"))?
            .into_iter()
            .collect();
        let target_count = before.len().max(1) as u32;

        let pull = self
            .invoker
            .pull(self.runner, &service.name, &envs)
            .map_err(|e| format!("pull: {e}"))?;
        if !pull.success {
            return Err(format!("pull failed: {}", pull.combined()));
        }

        let scale_up = self
            .invoker
            .up_scale(self.runner, &service.name, target_count + 1, true, &envs)
            .map_err(|e| format!("scale up: {e}"))?;
        if !scale_up.success {
            return Err(format!("scale up failed: {}", scale_up.combined()));
        }

        let after = probe
            .list(&service.name)
            .map_err(|e| format!("listing containers after scale up: {e}"))?;
        let mut new_ids = after.iter().filter(|id| !before.contains(*id));
        let new_id = new_ids
            .next()
            .ok_or_else(|| "scale up did not produce a new container".to_string())?
            .clone();
        if new_ids.next().is_some() {
            return Err(format!(
                "scale up produced more than one new container for {}",
                service.name
            ));
        }

        if let Err(e) = self.wait_healthy(&probe, &new_id, service) {
            self.rollback_one(&probe, &new_id, service, target_count, &envs);
            return Err(e);
        }

        for old_id in &before {
            if let Err(e) = probe.stop(old_id, service.drain) {
                warn!(service = %service.name, container = old_id, error = %e, "failed to stop old container");
            }
            if let Err(e) = probe.remove(old_id) {
                warn!(service = %service.name, container = old_id, error = %e, "failed to remove old container");
            }
        }

        let scale_down = self
            .invoker
            .up_scale(self.runner, &service.name, target_count, false, &envs)
            .map_err(|e| format!("scale down: {e}"))?;
        if !scale_down.success {
            warn!(service = %service.name, "reconciling scale after drain failed: {}", scale_down.combined());
        }

        Ok(())
    }

    /// RollingBack branch: stop and remove the unhealthy candidate, then
    /// reconcile the compose-managed scale back down. Old containers are
    /// never touched here. Failures in this branch are logged, not
    /// propagated — the pre-existing containers remain the serving set
    /// regardless of how this cleanup goes.
    fn rollback_one(
        &self,
        probe: &ContainerProbe<'_>,
        new_id: &str,
        service: &Service,
        target_count: u32,
        envs: &HashMap<String, String>,
    ) {
        if let Err(e) = probe.stop(new_id, service.drain) {
            warn!(service = %service.name, container = new_id, error = %e, "failed to stop candidate during rollback");
        }
        if let Err(e) = probe.remove(new_id) {
            warn!(service = %service.name, container = new_id, error = %e, "failed to remove candidate during rollback");
        }
        match self.invoker.up_scale(self.runner, &service.name, target_count, false, envs) {
            Ok(output) if !output.success => {
                warn!(service = %service.name, "reconciling scale after rollback failed: {}", output.combined());
            }
            Err(e) => warn!(service = %service.name, error = %e, "reconciling scale after rollback failed"),
            Ok(_) => {}
        }
    }

    fn wait_healthy(
        &self,
        probe: &ContainerProbe<'_>,
        container_id: &str,
        service: &Service,
    ) -> Result<(), String> {
        let start = self.clock.now();
        loop {
            let info = probe
                .inspect(container_id)
                .map_err(|e| format!("inspecting new container: {e}"))?;

            if !info.running {
                return Err(format!("container {container_id} is no longer running"));
            }
            match info.health {
                Health::Healthy => return Ok(()),
                Health::Unhealthy => {
                    return Err(format!("container {container_id} reported unhealthy"))
                }
                Health::Starting | Health::None => {}
            }

            if elapsed(self.clock.now(), start) >= service.healthcheck_timeout {
                return Err(format!(
                    "health check timed out after {:?}",
                    service.healthcheck_timeout
                ));
            }
            if self.is_interrupted() {
                return Err("interrupted while waiting for health check".to_string());
            }
            self.clock.sleep(service.healthcheck_poll);
        }
    }
}

fn elapsed(now: Instant, start: Instant) -> std::time::Duration {
    now.saturating_duration_since(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::manifest::Role;
    use crate::runner::fake::FakeRunner;
    use std::time::Duration;
    use tempfile::tempdir;

    fn service(name: &str) -> Service {
        Service {
            name: name.to_string(),
            role: Role::App,
            order: 0,
            drain: Duration::from_secs(5),
            healthcheck_timeout: Duration::from_secs(10),
            healthcheck_poll: Duration::from_secs(1),
            host: None,
            user: None,
            dir: None,
            has_healthcheck: true,
            image_reference: Some("app:latest".to_string()),
            manifest_position: 0,
        }
    }

    #[test]
    fn successful_rolling_deploy_records_tag_history() {
        let dir = tempdir().unwrap();
        std::env::remove_var("COMPOSE_COMMAND");
        let invoker = ComposeInvoker::resolve(dir.path());
        let runner = FakeRunner::new();
        let clock = FakeClock::new();

        // list before scale up: no containers yet.
        runner.push(
            "docker",
            &["ps", "-a", "--filter", "label=com.docker.compose.service=web", "--format", "{{.ID}}\t{{.CreatedAt}}"],
            FakeRunner::ok(""),
        );
        runner.push("docker", &["compose", "pull", "web"], FakeRunner::ok(""));
        runner.push(
            "docker",
            &["compose", "up", "-d", "--no-deps", "--no-recreate", "--scale", "web=2"],
            FakeRunner::ok(""),
        );
        runner.push(
            "docker",
            &["ps", "-a", "--filter", "label=com.docker.compose.service=web", "--format", "{{.ID}}\t{{.CreatedAt}}"],
            FakeRunner::ok("new1\t2024-01-01\n"),
        );
        runner.push(
            "docker",
            &["inspect", "new1"],
            FakeRunner::ok(r#"[{"Id":"new1","Image":"app:v2","State":{"Running":true,"Health":{"Status":"healthy"}}}]"#),
        );
        runner.push(
            "docker",
            &["compose", "up", "-d", "--no-deps", "--scale", "web=1"],
            FakeRunner::ok(""),
        );

        let engine = DeployEngine::new(&invoker, &runner, &clock, dir.path());
        let plan = DeployPlan { services: vec![service("web")] };
        let outcome = engine.deploy(&plan, Some("v2"), false);

        assert!(outcome.success());
        let history = TagHistory::at(dir.path());
        assert_eq!(history.current().unwrap(), Some("v2".to_string()));
    }

    #[test]
    fn unhealthy_new_container_fails_and_removes_it() {
        let dir = tempdir().unwrap();
        std::env::remove_var("COMPOSE_COMMAND");
        let invoker = ComposeInvoker::resolve(dir.path());
        let runner = FakeRunner::new();
        let clock = FakeClock::new();

        runner.push(
            "docker",
            &["ps", "-a", "--filter", "label=com.docker.compose.service=web", "--format", "{{.ID}}\t{{.CreatedAt}}"],
            FakeRunner::ok(""),
        );
        runner.push("docker", &["compose", "pull", "web"], FakeRunner::ok(""));
        runner.push(
            "docker",
            &["compose", "up", "-d", "--no-deps", "--no-recreate", "--scale", "web=2"],
            FakeRunner::ok(""),
        );
        runner.push(
            "docker",
            &["ps", "-a", "--filter", "label=com.docker.compose.service=web", "--format", "{{.ID}}\t{{.CreatedAt}}"],
            FakeRunner::ok("new1\t2024-01-01\n"),
        );
        runner.push(
            "docker",
            &["inspect", "new1"],
            FakeRunner::ok(r#"[{"Id":"new1","Image":"app:v2","State":{"Running":true,"Health":{"Status":"unhealthy"}}}]"#),
        );
        runner.push("docker", &["stop", "-t", "5", "new1"], FakeRunner::ok(""));
        runner.push("docker", &["rm", "-f", "new1"], FakeRunner::ok(""));
        runner.push(
            "docker",
            &["compose", "up", "-d", "--no-deps", "--scale", "web=1"],
            FakeRunner::ok(""),
        );

        let engine = DeployEngine::new(&invoker, &runner, &clock, dir.path());
        let plan = DeployPlan { services: vec![service("web"), service("worker")] };
        let outcome = engine.deploy(&plan, Some("v2"), false);

        assert!(!outcome.success());
        assert!(matches!(outcome.results[0].outcome, ServiceOutcome::Failed(_)));
        assert!(matches!(outcome.results[1].outcome, ServiceOutcome::Skipped));
        assert_eq!(TagHistory::at(dir.path()).current().unwrap(), None);
    }

    #[test]
    fn dry_run_never_touches_the_runner() {
        let dir = tempdir().unwrap();
        std::env::remove_var("COMPOSE_COMMAND");
        let invoker = ComposeInvoker::resolve(dir.path());
        let runner = FakeRunner::new();
        let clock = FakeClock::new();
        let engine = DeployEngine::new(&invoker, &runner, &clock, dir.path());
        let plan = DeployPlan { services: vec![service("web")] };

        let outcome = engine.deploy(&plan, Some("v2"), true);

        assert!(outcome.success());
        assert!(runner.calls().is_empty());
        assert_eq!(TagHistory::at(dir.path()).current().unwrap(), None);
    }

    #[test]
    fn omitted_tag_leaves_deploy_tag_unset_and_history_untouched() {
        let dir = tempdir().unwrap();
        std::env::remove_var("COMPOSE_COMMAND");
        let invoker = ComposeInvoker::resolve(dir.path());
        let runner = FakeRunner::new();
        let clock = FakeClock::new();

        runner.push(
            "docker",
            &["ps", "-a", "--filter", "label=com.docker.compose.service=web", "--format", "{{.ID}}\t{{.CreatedAt}}"],
            FakeRunner::ok(""),
        );
        runner.push("docker", &["compose", "pull", "web"], FakeRunner::ok(""));
        runner.push(
            "docker",
            &["compose", "up", "-d", "--no-deps", "--no-recreate", "--scale", "web=2"],
            FakeRunner::ok(""),
        );
        runner.push(
            "docker",
            &["ps", "-a", "--filter", "label=com.docker.compose.service=web", "--format", "{{.ID}}\t{{.CreatedAt}}"],
            FakeRunner::ok("new1\t2024-01-01\n"),
        );
        runner.push(
            "docker",
            &["inspect", "new1"],
            FakeRunner::ok(r#"[{"Id":"new1","Image":"app:latest","State":{"Running":true,"Health":{"Status":"healthy"}}}]"#),
        );
        runner.push(
            "docker",
            &["compose", "up", "-d", "--no-deps", "--scale", "web=1"],
            FakeRunner::ok(""),
        );

        let engine = DeployEngine::new(&invoker, &runner, &clock, dir.path());
        let plan = DeployPlan { services: vec![service("web")] };
        let outcome = engine.deploy(&plan, None, false);

        assert!(outcome.success());
        assert_eq!(outcome.tag, None);
        assert_eq!(TagHistory::at(dir.path()).current().unwrap(), None);

        let calls = runner.calls();
        let pull_call = calls.iter().find(|(p, a)| p == "docker" && a.first().map(String::as_str) == Some("compose") && a.get(1).map(String::as_str) == Some("pull"));
        assert!(pull_call.is_some());
    }
}
