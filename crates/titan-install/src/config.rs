//! Installation configuration.
//!
//! Defaults come from `TITAN_*` environment variables; the CLI overrides
//! individual fields from its flags.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use titan_env_core::{env_or, env_parse, Backoff, PollPolicy, RetryPolicy};

/// An image and the directory it is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub image: String,
    pub context: PathBuf,
}

impl ImageSpec {
    pub fn new(image: impl Into<String>, context: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            context: context.into(),
        }
    }
}

/// Workloads used to verify a fresh install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Repository created by the primary probe
    pub repository: String,
    /// Image run detached by the primary probe
    pub image: String,
    /// Repository created by the fallback probe
    pub fallback_repository: String,
    /// Simpler image run in the foreground by the fallback probe
    pub fallback_image: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            repository: env_or("TITAN_PROBE_REPO", "titan-probe"),
            image: env_or("TITAN_PROBE_IMAGE", "nginx:alpine"),
            fallback_repository: env_or("TITAN_FALLBACK_PROBE_REPO", "titan-probe-simple"),
            fallback_image: env_or("TITAN_FALLBACK_PROBE_IMAGE", "hello-world"),
        }
    }
}

/// Installation pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Passed to the install entry point as `--registry=<name>`
    pub registry: Option<String>,

    /// Destroy and recreate both pools before installing
    pub clean_slate: bool,

    /// Rebuild the module-builder image even if it exists
    pub force_builder: bool,

    pub service_image: ImageSpec,
    pub builder_image: ImageSpec,

    /// Install attempts including the first
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,

    /// Wait after the install entry point returns, before polling status
    pub settle_secs: u64,
    pub status_polls: u32,
    pub status_interval_secs: u64,

    /// Containers that must be up for the service to count as stable
    pub expected_containers: Vec<String>,

    /// Log lines captured per container when escalating to diagnostics
    pub diagnostics_tail: u32,

    pub probe: ProbeConfig,
    pub checkpoint_message: String,
}

impl Default for InstallConfig {
    fn default() -> Self {
        let registry = env_or("TITAN_REGISTRY", "");
        let expected_containers = env_or("TITAN_EXPECTED_CONTAINERS", "titan-docker-server")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Self {
            registry: (!registry.is_empty()).then_some(registry),
            clean_slate: env_parse("TITAN_CLEAN_SLATE", false),
            force_builder: env_parse("TITAN_FORCE_BUILDER", false),
            service_image: ImageSpec::new(
                env_or("TITAN_SERVICE_IMAGE", "titan:latest"),
                env_or("TITAN_SERVICE_CONTEXT", "."),
            ),
            builder_image: ImageSpec::new(
                env_or("TITAN_ZFS_BUILDER_IMAGE", "titandata/zfs-builder:latest"),
                env_or("TITAN_BUILDER_CONTEXT", "zfs-builder"),
            ),
            max_attempts: env_parse("TITAN_INSTALL_ATTEMPTS", 3),
            backoff_base_secs: env_parse("TITAN_BACKOFF_BASE", 5),
            backoff_max_secs: env_parse("TITAN_BACKOFF_MAX", 30),
            settle_secs: env_parse("TITAN_SETTLE_SECS", 10),
            status_polls: env_parse("TITAN_STATUS_POLLS", 12),
            status_interval_secs: env_parse("TITAN_STATUS_INTERVAL", 5),
            expected_containers,
            diagnostics_tail: 50,
            probe: ProbeConfig::default(),
            checkpoint_message: env_or("TITAN_CHECKPOINT_MESSAGE", "titan install verification"),
        }
    }
}

impl InstallConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(self.backoff_base_secs),
                max: Duration::from_secs(self.backoff_max_secs),
            },
        }
    }

    pub fn status_poll(&self) -> PollPolicy {
        PollPolicy {
            max_polls: self.status_polls,
            interval: Duration::from_secs(self.status_interval_secs),
        }
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_from_config() {
        let config = InstallConfig {
            max_attempts: 4,
            backoff_base_secs: 2,
            backoff_max_secs: 8,
            ..InstallConfig::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.backoff.delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff.delay(5), Duration::from_secs(8));
    }

    #[test]
    fn test_status_poll_from_config() {
        let config = InstallConfig {
            status_polls: 6,
            status_interval_secs: 1,
            ..InstallConfig::default()
        };
        assert_eq!(
            config.status_poll(),
            PollPolicy {
                max_polls: 6,
                interval: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = InstallConfig {
            registry: Some("titan-registry".to_string()),
            ..InstallConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: InstallConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
