//! Installation pipeline errors.

use titan_env_core::EnvError;

use crate::stage::Stage;

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("stage {stage} aborted: {reason}")]
    StageAborted { stage: Stage, reason: String },

    #[error("service did not become stable after {attempts} install attempt(s)")]
    ServiceUnstable { attempts: u32 },

    #[error(transparent)]
    Env(#[from] EnvError),
}

impl InstallError {
    pub fn aborted(stage: Stage, reason: impl Into<String>) -> Self {
        InstallError::StageAborted {
            stage,
            reason: reason.into(),
        }
    }

    /// Whether another install attempt may clear the error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InstallError::ServiceUnstable { .. })
    }
}

pub type Result<T> = std::result::Result<T, InstallError>;
