//! Error taxonomy for environment readiness.

use serde::{Deserialize, Serialize};

use crate::pool::PoolHealth;

/// Steps to suggest when the on-host ZFS build fails.
pub const SOURCE_BUILD_REMEDIATION: [&str; 3] = [
    "Ensure the container runtime is using a supported kernel version",
    "Try a different container runtime version",
    "Install ZFS manually on your system",
];

/// How a failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Host cannot be supported; abort without retry
    EnvironmentUnsupported,
    /// Artifact is not published; a fallback path exists
    MissingArtifact,
    /// Expected to clear with time; bounded retry or poll
    TransientInfrastructure,
    /// Anything else that stops the run
    Fatal,
}

/// Environment readiness errors.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("unsupported host: {0}")]
    UnsupportedHost(String),

    #[error("invalid kernel image reference: {0}")]
    InvalidKernelTag(String),

    #[error("prebuilt ZFS module {image} could not be installed: {output}")]
    ModuleInstallFailed { image: String, output: String },

    #[error("failed to build ZFS from source: {output}")]
    SourceBuildFailed { output: String },

    #[error("no loop device found for {file} (pool {pool})")]
    LoopDeviceNotFound { pool: String, file: String },

    #[error("pool command `{command}` failed: {output}")]
    PoolCommandFailed { command: String, output: String },

    #[error("pools not online after {polls} checks: {pending:?}")]
    PoolsUnstable { polls: u32, pending: Vec<String> },

    #[error("pool {pool} could not be re-imported: {output}")]
    HostIdMismatchUnresolved { pool: String, output: String },

    #[error("pool {pool} cannot move from {from} to {to}")]
    InvalidPoolTransition {
        pool: String,
        from: PoolHealth,
        to: PoolHealth,
    },
}

impl EnvError {
    /// Map the error onto the failure taxonomy.
    pub fn class(&self) -> FailureClass {
        match self {
            EnvError::UnsupportedHost(_) | EnvError::InvalidKernelTag(_) => {
                FailureClass::EnvironmentUnsupported
            }
            EnvError::PoolsUnstable { .. } | EnvError::HostIdMismatchUnresolved { .. } => {
                FailureClass::TransientInfrastructure
            }
            EnvError::ModuleInstallFailed { .. }
            | EnvError::SourceBuildFailed { .. }
            | EnvError::LoopDeviceNotFound { .. }
            | EnvError::PoolCommandFailed { .. }
            | EnvError::InvalidPoolTransition { .. } => FailureClass::Fatal,
        }
    }

    /// Operator guidance to print alongside the error, if any.
    pub fn remediation(&self) -> Option<&'static [&'static str]> {
        match self {
            EnvError::SourceBuildFailed { .. } => Some(&SOURCE_BUILD_REMEDIATION),
            _ => None,
        }
    }
}

/// Result type for environment operations.
pub type Result<T> = std::result::Result<T, EnvError>;
