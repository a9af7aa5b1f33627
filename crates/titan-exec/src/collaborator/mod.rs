//! Output classification for collaborator CLIs.
//!
//! None of the collaborators expose structured error codes for the
//! conditions the bootstrap cares about, so each gets a `classify` function
//! that maps raw output onto an [`ErrorKind`]. Callers decide what a kind
//! means for their stage.

pub mod docker;
pub mod titan;
pub mod zpool;

use serde::{Deserialize, Serialize};

/// Failure kinds recognised in collaborator output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Registry has no manifest for the requested image tag
    RegistryMiss,
    ContainerNotFound,
    ImageNotFound,
    PoolNotFound,
    /// `zpool import` found nothing to import
    NoPoolsAvailable,
    /// Pool was last imported by a host with a different host id
    HostIdMismatch,
    PoolExists,
    RepositoryNotFound,
    RepositoryExists,
    /// Titan daemon is not reachable yet
    ServiceUnavailable,
    Unknown,
}

/// Case-insensitive substring test shared by the classifiers.
pub(crate) fn contains_any(output: &str, needles: &[&str]) -> bool {
    let lower = output.to_lowercase();
    needles.iter().any(|n| lower.contains(n))
}
