//! Titan-Exec: command execution for the Titan environment bootstrap
//!
//! This crate is the leaf of the bootstrap workspace. It runs external
//! programs from a small allow-list and hands back their combined output
//! and exit status without ever treating a non-zero exit as an error.
//!
//! ## Layer 0 - Collaborator boundary
//!
//! Focus: a single execution primitive, plus one output classifier per
//! collaborator CLI so that substring matching lives in exactly one place.

pub mod collaborator;
pub mod error;
pub mod executor;

pub use collaborator::{docker, titan, zpool, ErrorKind};
pub use error::ExecError;
pub use executor::{CommandExecutor, CommandOutput, Program, ProgramPaths, SystemExecutor};

/// Result type for executor internals
pub type Result<T> = std::result::Result<T, ExecError>;
