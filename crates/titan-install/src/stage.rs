//! Installation stages and their failure policies.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What the pipeline does when a stage does not succeed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StagePolicy {
    /// Log and continue; the stage still counts as ok
    Ignore,
    /// Stop the run
    Abort,
    /// Retry the whole stage up to the attempt ceiling, then abort
    Retry,
    /// Never stop; deviations lower the verdict to partial
    Degrade,
}

/// Installation stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Remove repositories, uninstall the service, prune runtime resources
    Teardown,

    /// Optionally clean, then bring both pools online and wait for stability
    PoolSetup,

    /// Build the service and module-builder images
    ImageBuild,

    /// Run the install entry point and wait for the service to settle
    ServiceInstall,

    /// Probe workload, checkpoint and history query
    Verification,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Teardown,
        Stage::PoolSetup,
        Stage::ImageBuild,
        Stage::ServiceInstall,
        Stage::Verification,
    ];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Teardown => "teardown",
            Stage::PoolSetup => "pool_setup",
            Stage::ImageBuild => "image_build",
            Stage::ServiceInstall => "service_install",
            Stage::Verification => "verification",
        }
    }

    pub fn policy(&self) -> StagePolicy {
        match self {
            Stage::Teardown => StagePolicy::Ignore,
            Stage::PoolSetup | Stage::ImageBuild => StagePolicy::Abort,
            Stage::ServiceInstall => StagePolicy::Retry,
            Stage::Verification => StagePolicy::Degrade,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
