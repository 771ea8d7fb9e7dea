//! Component B: Container Probe. Queries the container runtime directly
//! (not via the compose wrapper), parsing `docker ps`/`docker inspect`
//! JSON output the same ad hoc way the teacher parses compose YAML with
//! `serde_yaml::Value` rather than a full typed schema.

use crate::clock::Clock;
use crate::runner::CommandRunner;
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{trace, warn};

/// Health status reported by the container runtime's healthcheck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Starting,
    Healthy,
    Unhealthy,
    /// No healthcheck is defined on the container.
    None,
}

impl Health {
    fn parse(raw: &str) -> Health {
        match raw {
            "starting" => Health::Starting,
            "healthy" => Health::Healthy,
            "unhealthy" => Health::Unhealthy,
            _ => Health::None,
        }
    }
}

/// Inspection result for a single container.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub health: Health,
    pub running: bool,
    pub image: String,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "Health")]
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
struct InspectHealth {
    #[serde(rename = "Status")]
    status: String,
}

#[derive(Debug, Deserialize)]
struct InspectRecord {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "State")]
    state: InspectState,
}

pub struct ContainerProbe<'a> {
    runner: &'a dyn CommandRunner,
    clock: &'a dyn Clock,
    project_dir: &'a Path,
}

impl<'a> ContainerProbe<'a> {
    pub fn new(runner: &'a dyn CommandRunner, clock: &'a dyn Clock, project_dir: &'a Path) -> Self {
        ContainerProbe { runner, clock, project_dir }
    }

    /// Lists container ids for a compose service, oldest first.
    pub fn list(&self, service: &str) -> Result<Vec<String>> {
        let args = vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("label=com.docker.compose.service={service}"),
            "--format".to_string(),
            "{{.ID}}\t{{.CreatedAt}}".to_string(),
        ];
        let output = self
            .runner
            .run("docker", &args, &HashMap::new(), self.project_dir)
            .context("docker ps failed")?;
        if !output.success {
            return Err(anyhow!("docker ps failed: {}", output.combined()));
        }

        let mut rows: Vec<(String, String)> = output
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| {
                let mut parts = l.splitn(2, '\t');
                let id = parts.next()?.to_string();
                let created = parts.next().unwrap_or_default().to_string();
                Some((id, created))
            })
            .collect();
        // `docker ps` lists newest first; reverse to get creation order.
        rows.reverse();
        Ok(rows.into_iter().map(|(id, _)| id).collect())
    }

    /// Inspects a single container by id.
    pub fn inspect(&self, container_id: &str) -> Result<ContainerInfo> {
        let args = vec!["inspect".to_string(), container_id.to_string()];
        let output = self
            .runner
            .run("docker", &args, &HashMap::new(), self.project_dir)
            .context("docker inspect failed")?;
        if !output.success {
            return Err(anyhow!("docker inspect failed: {}", output.combined()));
        }

        let records: Vec<InspectRecord> = serde_json::from_str(&output.stdout)
            .with_context(|| format!("unparseable docker inspect output for {container_id}"))?;
        let record = records
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("docker inspect returned no records for {container_id}"))?;

        let health = record
            .state
            .health
            .map(|h| Health::parse(&h.status))
            .unwrap_or(Health::None);

        Ok(ContainerInfo {
            id: record.id,
            health,
            running: record.state.running,
            image: record.image,
        })
    }

    /// Sends SIGTERM, waits up to `timeout`, then SIGKILL; returns only
    /// once the container is no longer running.
    pub fn stop(&self, container_id: &str, timeout: Duration) -> Result<()> {
        let timeout_secs = timeout.as_secs().to_string();
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            timeout_secs,
            container_id.to_string(),
        ];
        let output = self
            .runner
            .run("docker", &args, &HashMap::new(), self.project_dir)
            .context("docker stop failed")?;
        if !output.success {
            warn!(container_id, "docker stop reported failure: {}", output.combined());
        }
        // docker stop blocks until the container has exited (or been
        // killed), so no extra poll is required here; the clock is still
        // threaded through for logging/testability of the drain window.
        trace!(container_id, ?timeout, "container stopped");
        let _ = self.clock.now();
        Ok(())
    }

    /// Idempotent remove.
    pub fn remove(&self, container_id: &str) -> Result<()> {
        let args = vec!["rm".to_string(), "-f".to_string(), container_id.to_string()];
        let output = self
            .runner
            .run("docker", &args, &HashMap::new(), self.project_dir)
            .context("docker rm failed")?;
        if !output.success && !output.combined().contains("No such container") {
            return Err(anyhow!("docker rm failed: {}", output.combined()));
        }
        Ok(())
    }
}
