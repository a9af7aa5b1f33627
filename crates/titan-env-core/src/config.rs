//! Configuration for module provisioning and pool setup.
//!
//! Defaults come from `TITAN_*` environment variables, falling back to the
//! values the Titan images are published with.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::PollPolicy;

/// Value of `key`, or `default` when unset.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parsed value of `key`, or `default` when unset or unparsable.
pub fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Kernel module provisioning configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Small image used for host introspection (`lsmod`, namespace entry)
    pub helper_image: String,
    /// Host file holding the `kernel:`/`image:` keys
    pub kernel_config_path: String,
    /// Repository of prebuilt module images, tagged by kernel version
    pub prebuilt_repository: String,
    /// Image that compiles ZFS against the running kernel
    pub builder_image: String,
    /// ZFS release the builder checks out
    pub zfs_version: String,
    /// ZFS `--with-config` target for the builder
    pub zfs_config: String,
    /// Container-engine socket bind-mounted into the builder
    pub engine_socket: String,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        ModuleConfig {
            helper_image: env_or("TITAN_HELPER_IMAGE", "alpine:latest"),
            kernel_config_path: env_or("TITAN_KERNEL_CONFIG", "/etc/linuxkit.yml"),
            prebuilt_repository: env_or(
                "TITAN_ZFS_MODULE_REPO",
                "titandata/docker-desktop-zfs-kernel",
            ),
            builder_image: env_or("TITAN_ZFS_BUILDER_IMAGE", "titandata/zfs-builder:latest"),
            zfs_version: env_or("TITAN_ZFS_VERSION", "zfs-0.8.2"),
            zfs_config: env_or("TITAN_ZFS_CONFIG", "kernel"),
            engine_socket: env_or("TITAN_ENGINE_SOCKET", "/var/run/docker.sock"),
        }
    }
}

impl ModuleConfig {
    pub fn from_env() -> Self {
        Self::default()
    }
}

/// Storage pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool holding Titan's own repositories
    pub system_pool: String,
    /// Pool backing the container engine's volumes
    pub docker_pool: String,
    /// Host directory for sparse backing files
    pub pool_dir: PathBuf,
    /// Size of each backing file in MiB
    pub image_size_mb: u64,
    /// Stability checks before giving up on the pools
    pub stability_polls: u32,
    /// Seconds between stability checks
    pub poll_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            system_pool: env_or("TITAN_POOL", "titan"),
            docker_pool: env_or("TITAN_DOCKER_POOL", "titan-docker"),
            pool_dir: env_or("TITAN_POOL_DIR", "/var/lib/titan/pools").into(),
            image_size_mb: env_parse("TITAN_POOL_SIZE_MB", 4096),
            stability_polls: env_parse("TITAN_POOL_POLLS", 10),
            poll_interval_secs: env_parse("TITAN_POOL_POLL_INTERVAL", 3),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Both pool names, system pool first
    pub fn pool_names(&self) -> [&str; 2] {
        [self.system_pool.as_str(), self.docker_pool.as_str()]
    }

    /// Sparse backing file for a pool
    pub fn image_file(&self, pool: &str) -> PathBuf {
        self.pool_dir.join(format!("{pool}.img"))
    }

    pub fn stability_poll(&self) -> PollPolicy {
        PollPolicy {
            max_polls: self.stability_polls,
            interval: Duration::from_secs(self.poll_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_file_is_named_after_pool() {
        let config = PoolConfig {
            pool_dir: PathBuf::from("/var/lib/titan/pools"),
            ..PoolConfig::default()
        };
        assert_eq!(
            config.image_file("titan-docker"),
            PathBuf::from("/var/lib/titan/pools/titan-docker.img")
        );
    }

    #[test]
    fn test_stability_poll_uses_configured_bound() {
        let config = PoolConfig {
            stability_polls: 4,
            poll_interval_secs: 2,
            ..PoolConfig::default()
        };
        let poll = config.stability_poll();
        assert_eq!(poll.max_polls, 4);
        assert_eq!(poll.interval, Duration::from_secs(2));
    }

    #[test]
    fn test_pool_names_order() {
        let config = PoolConfig {
            system_pool: "titan".to_string(),
            docker_pool: "titan-docker".to_string(),
            ..PoolConfig::default()
        };
        assert_eq!(config.pool_names(), ["titan", "titan-docker"]);
    }
}
