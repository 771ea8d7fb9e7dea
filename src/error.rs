//! Typed error taxonomy. Each top-level variant maps to one of the exit
//! codes in the CLI contract; per-service step failures are *not*
//! represented here, they live in [`crate::engine::ServiceOutcome`].

use std::path::PathBuf;
use thiserror::Error;

/// A configuration error detected before any mutation has occurred.
/// Always maps to exit code 3.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("service '{service}' has role=app but no healthcheck defined")]
    MissingHealthcheck { service: String },

    #[error(
        "service '{service}' label 'deploy.{label}' is not a valid integer: {value}"
    )]
    BadLabel {
        service: String,
        label: String,
        value: String,
    },

    #[error(
        "no host/user/dir resolved for service '{service}': set x-deploy defaults or per-service deploy.host/user/dir labels"
    )]
    MissingHostGroup { service: String },

    #[error("--service '{name}' does not name a known app service")]
    UnknownService { name: String },

    #[error("--service '{name}' names an accessory or unlabeled service, not an app service")]
    NotAnAppService { name: String },

    #[error("failed to read merged compose configuration: {0}")]
    Manifest(String),
}

/// Raised when the deploy lock cannot be acquired. Maps to exit code 2.
#[derive(Debug, Error)]
#[error("deploy lock at {path} is held by live process {holder_pid} (started {started_at})")]
pub struct LockHeldError {
    pub path: PathBuf,
    pub holder_pid: u32,
    pub started_at: String,
}

/// Top-level error returned from the binary's fallible paths.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    LockHeld(#[from] LockHeldError),

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    /// The process exit code this error maps to, per the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            FlowError::Config(_) => 3,
            FlowError::LockHeld(_) => 2,
            FlowError::Interrupted => 130,
            FlowError::Other(_) => 1,
        }
    }
}
