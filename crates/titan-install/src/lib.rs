//! Titan install - staged installation of the Titan storage service
//!
//! Provides an installation pipeline that:
//! - Tears down prior state and brings both storage pools online
//! - Builds the service images and installs the service with bounded retries
//! - Verifies the install end to end and reports a success/partial/failure verdict

pub mod config;
pub mod error;
pub mod gate;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod stage;

// Re-export key types
pub use config::{ImageSpec, InstallConfig, ProbeConfig};
pub use error::{InstallError, Result};
pub use gate::{GateVerdict, InstallGate, Verdict};
pub use pipeline::InstallPipeline;
pub use report::{render_summary, Diagnostic, InstallReport};
pub use runner::{StageResult, StageRunner, StageStatus, Verification};
pub use stage::{Stage, StagePolicy};
