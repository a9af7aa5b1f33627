//! Error types for titan-exec

use thiserror::Error;

/// Errors raised while spawning or collecting a child process.
///
/// These never escape [`crate::CommandExecutor::execute`]; the executor folds
/// them into a failed [`crate::CommandOutput`] so callers see one shape.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The program could not be started at all
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The child started but waiting on it failed
    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
