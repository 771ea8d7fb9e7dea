//! Component D: Deploy Lock. A file-based mutual exclusion lock so two
//! deploys never race the same project directory. The lock file holds
//! the holder's pid and start time; a holder whose pid is no longer a
//! live process is considered stale and may be stolen once.

use crate::error::LockHeldError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, System};
use tracing::{info, warn};

const LOCK_FILE_NAME: &str = ".deploy-lock";

struct LockContents {
    pid: u32,
    started_at: String,
}

impl LockContents {
    fn parse(raw: &str) -> Option<LockContents> {
        let mut lines = raw.lines();
        let pid = lines.next()?.trim().parse::<u32>().ok()?;
        let started_at = lines.next()?.trim().to_string();
        Some(LockContents { pid, started_at })
    }

    fn render(pid: u32, started_at: &str) -> String {
        format!("{pid}\n{started_at}\n")
    }
}

/// RAII guard. Releases the lock (deletes the file) on drop, provided the
/// file still names this process — a second acquisition after a steal
/// must never have its lock yanked out from under it by the original
/// holder's stale guard.
#[derive(Debug)]
pub struct DeployLock {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl DeployLock {
    /// Acquires the lock at `<project_dir>/.deploy-lock`, stealing a
    /// stale holder's lock exactly once before giving up.
    pub fn acquire(project_dir: &Path) -> Result<DeployLock, LockHeldError> {
        let path = project_dir.join(LOCK_FILE_NAME);
        let pid = std::process::id();

        match try_create(&path, pid) {
            Ok(()) => return Ok(DeployLock { path, pid, released: false }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unexpected error creating lock file");
            }
        }

        let existing = read_holder(&path)?;
        if is_alive(existing.pid) {
            return Err(LockHeldError {
                path,
                holder_pid: existing.pid,
                started_at: existing.started_at,
            });
        }

        info!(
            stale_pid = existing.pid,
            started_at = %existing.started_at,
            "stealing lock held by dead process"
        );
        fs::remove_file(&path).ok();
        try_create(&path, pid).map_err(|_| LockHeldError {
            path: path.clone(),
            holder_pid: existing.pid,
            started_at: existing.started_at,
        })?;

        Ok(DeployLock { path, pid, released: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Explicit release; idempotent, also run by `Drop`.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        if let Ok(raw) = fs::read_to_string(&self.path) {
            if let Some(contents) = LockContents::parse(&raw) {
                if contents.pid != self.pid {
                    // Someone else's lock now occupies this path; do not
                    // touch it.
                    self.released = true;
                    return;
                }
            }
        }
        fs::remove_file(&self.path).ok();
        self.released = true;
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn try_create(path: &Path, pid: u32) -> std::io::Result<()> {
    let started_at: DateTime<Utc> = Utc::now();
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(LockContents::render(pid, &started_at.to_rfc3339()).as_bytes())?;
    Ok(())
}

fn read_holder(path: &Path) -> Result<LockContents, LockHeldError> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()));
    match raw.ok().and_then(|r| LockContents::parse(&r)) {
        Some(contents) => Ok(contents),
        None => Err(LockHeldError {
            path: path.to_path_buf(),
            holder_pid: 0,
            started_at: "unknown".to_string(),
        }),
    }
}

fn is_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    system.process(Pid::from_u32(pid)).is_some()
}
