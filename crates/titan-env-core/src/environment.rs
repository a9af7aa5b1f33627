//! The explicit handle to everything outside the process.
//!
//! Pools, images and containers are host-global singletons. Components never
//! reach them through ambient lookups; they go through an [`Environment`],
//! which owns the executor and knows how to get a command into the host's
//! namespaces.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use titan_exec::{CommandExecutor, CommandOutput, Program};

/// Arguments that make `nsenter` join every namespace of host PID 1.
pub const NSENTER_HOST_ARGS: [&str; 6] = ["-t", "1", "-m", "-u", "-n", "-i"];

/// How host-level commands (`zpool`, `losetup`, file operations) are reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HostAccess {
    /// Privileged `--pid=host` container that enters PID 1's namespaces.
    /// Needed when the engine runs inside a VM the tool cannot reach directly.
    HelperContainer { image: String },
    /// Run `nsenter` locally; the tool is already on the host as root.
    Nsenter,
}

impl HostAccess {
    /// Build the invocation for a command to run inside the host namespaces.
    pub fn wrap<'a>(&'a self, command: &[&'a str]) -> (Program, Vec<&'a str>) {
        match self {
            HostAccess::HelperContainer { image } => {
                let mut args = vec![
                    "run",
                    "--rm",
                    "-i",
                    "--privileged",
                    "--pid=host",
                    image.as_str(),
                    "nsenter",
                ];
                args.extend(NSENTER_HOST_ARGS);
                args.extend_from_slice(command);
                (Program::Docker, args)
            }
            HostAccess::Nsenter => {
                let mut args: Vec<&str> = NSENTER_HOST_ARGS.to_vec();
                args.extend_from_slice(command);
                (Program::Nsenter, args)
            }
        }
    }
}

/// Shared handle to the executor and host access mode.
#[derive(Clone)]
pub struct Environment {
    executor: Arc<dyn CommandExecutor>,
    host_access: HostAccess,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("host_access", &self.host_access)
            .finish_non_exhaustive()
    }
}

impl Environment {
    pub fn new(executor: Arc<dyn CommandExecutor>, host_access: HostAccess) -> Self {
        Self {
            executor,
            host_access,
        }
    }

    pub fn host_access(&self) -> &HostAccess {
        &self.host_access
    }

    /// Run an allowed program directly.
    pub async fn run(&self, program: Program, args: &[&str]) -> CommandOutput {
        self.executor.execute(program, args).await
    }

    /// Run a command inside the host's namespaces.
    pub async fn host(&self, command: &[&str]) -> CommandOutput {
        let (program, args) = self.host_access.wrap(command);
        self.executor.execute(program, &args).await
    }
}
