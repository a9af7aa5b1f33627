//! Titan environment core
//!
//! Gets a container host ready for the ZFS-backed Titan storage service:
//!
//! - [`module`]: provisions a ZFS kernel module matching the running kernel,
//!   falling back to an on-host build when no prebuilt image is published
//! - [`pool`]: creates, verifies, recovers and destroys the two storage pools
//! - [`retry`]: the bounded retry and polling combinators every stage uses
//! - [`environment`]: the explicit handle through which all host state is reached

pub mod checkpoint;
pub mod config;
pub mod environment;
pub mod error;
pub mod fakes;
pub mod kernel;
pub mod module;
pub mod pool;
pub mod retry;
pub mod telemetry;

pub use checkpoint::{is_valid_checkpoint, CheckpointId};
pub use config::{env_or, env_parse, ModuleConfig, PoolConfig};
pub use environment::{Environment, HostAccess};
pub use error::{EnvError, FailureClass, Result, SOURCE_BUILD_REMEDIATION};
pub use kernel::{extract_version, find_kernel_image, kernel_tag_from_file, KernelTag, ModuleImageRef};
pub use module::{ModuleProvisioner, PrebuiltAttempt, ProvisionOutcome};
pub use pool::{Pool, PoolHealth, PoolManager, PoolStatusReport};
pub use retry::{poll_until, with_retry, Backoff, PollPolicy, RetryFailure, RetryOutcome, RetryPolicy};
pub use telemetry::{default_level, init_tracing};

pub use titan_exec::{CommandExecutor, CommandOutput, Program, ProgramPaths, SystemExecutor};
