//! The "execute and tee" abstraction (spec.md §9's design note): every
//! subprocess invocation in this crate goes through [`CommandRunner`] so
//! the Compose Invoker and Container Probe can be driven against a fake
//! in tests instead of shelling out to a real container runtime.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use subprocess::{Exec, Redirection};
use tracing::trace;

/// Captured result of a single subprocess invocation.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Runs external commands. Implemented for real subprocess execution and,
/// in tests, by a scriptable fake keyed on the invoked program+args.
pub trait CommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        envs: &HashMap<String, String>,
        cwd: &Path,
    ) -> Result<RunOutput>;
}

/// Runs commands via the `subprocess` crate, merging stderr into stdout
/// the way the teacher's own `run_command` helper does.
#[derive(Debug, Default, Clone, Copy)]
pub struct SubprocessRunner;

impl CommandRunner for SubprocessRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        envs: &HashMap<String, String>,
        cwd: &Path,
    ) -> Result<RunOutput> {
        trace!(program, ?args, cwd = %cwd.display(), "executing");

        let mut exec = Exec::cmd(program)
            .args(args)
            .cwd(cwd)
            .stdout(Redirection::Pipe)
            .stderr(Redirection::Pipe);
        for (key, value) in envs {
            exec = exec.env(key, value);
        }

        let data = exec
            .capture()
            .with_context(|| format!("failed to spawn {program} {args:?} in {}", cwd.display()))?;

        Ok(RunOutput {
            success: data.exit_status.success(),
            stdout: data.stdout_str(),
            stderr: data.stderr_str(),
        })
    }
}
