//! The command execution primitive.

use crate::error::ExecError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Programs the bootstrap is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Program {
    /// The container-engine CLI
    Docker,
    /// The guest-OS namespace entry tool
    Nsenter,
    /// The Titan CLI, which owns `install`/`uninstall` and repository commands
    Titan,
}

impl Program {
    pub fn name(&self) -> &'static str {
        match self {
            Program::Docker => "docker",
            Program::Nsenter => "nsenter",
            Program::Titan => "titan",
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Binary locations for each allowed program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramPaths {
    pub docker: PathBuf,
    pub nsenter: PathBuf,
    pub titan: PathBuf,
}

impl Default for ProgramPaths {
    fn default() -> Self {
        Self {
            docker: std::env::var("TITAN_DOCKER_BIN")
                .unwrap_or_else(|_| "docker".to_string())
                .into(),
            nsenter: std::env::var("TITAN_NSENTER_BIN")
                .unwrap_or_else(|_| "nsenter".to_string())
                .into(),
            titan: std::env::var("TITAN_BIN")
                .unwrap_or_else(|_| "titan".to_string())
                .into(),
        }
    }
}

impl ProgramPaths {
    /// Resolve paths from `TITAN_DOCKER_BIN`, `TITAN_NSENTER_BIN` and `TITAN_BIN`
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn path(&self, program: Program) -> &PathBuf {
        match program {
            Program::Docker => &self.docker,
            Program::Nsenter => &self.nsenter,
            Program::Titan => &self.titan,
        }
    }
}

/// Combined output and status of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// stdout followed by stderr
    pub output: String,

    /// Exit code, `None` when the process never ran or was killed by a signal
    pub exit_code: Option<i32>,

    /// Whether the process exited with status 0
    pub success: bool,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: Some(0),
            success: true,
        }
    }

    pub fn failed(output: impl Into<String>, exit_code: i32) -> Self {
        Self {
            output: output.into(),
            exit_code: Some(exit_code),
            success: false,
        }
    }

    /// Output trimmed of surrounding whitespace
    pub fn trimmed(&self) -> &str {
        self.output.trim()
    }

    /// Non-empty output lines
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.output.lines().filter(|l| !l.trim().is_empty())
    }
}

impl From<ExecError> for CommandOutput {
    fn from(err: ExecError) -> Self {
        Self {
            output: err.to_string(),
            exit_code: None,
            success: false,
        }
    }
}

/// Runs an external command and reports what happened.
///
/// Implementations must not fail on a non-zero exit status: callers inspect
/// [`CommandOutput::output`] to decide what a failure means.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, program: Program, args: &[&str]) -> CommandOutput;
}

/// Executor backed by real child processes.
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor {
    paths: ProgramPaths,
}

impl SystemExecutor {
    pub fn new(paths: ProgramPaths) -> Self {
        Self { paths }
    }

    async fn run(&self, program: Program, args: &[&str]) -> crate::Result<CommandOutput> {
        let exe = self.paths.path(program);

        let child = Command::new(exe)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: exe.display().to_string(),
                source,
            })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| ExecError::Wait {
                program: exe.display().to_string(),
                source,
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CommandOutput {
            output: text,
            exit_code: output.status.code(),
            success: output.status.success(),
        })
    }
}

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn execute(&self, program: Program, args: &[&str]) -> CommandOutput {
        debug!(program = %program, args = ?args, "Executing command");

        match self.run(program, args).await {
            Ok(out) => {
                if !out.success {
                    debug!(program = %program, exit_code = ?out.exit_code, "Command exited non-zero");
                }
                out
            }
            Err(e) => {
                warn!(program = %program, error = %e, "Command could not be run");
                e.into()
            }
        }
    }
}
