//! ZFS kernel module provisioning.
//!
//! Order of operations:
//! 1. Read the host kernel tag (fatal if the host config has none)
//! 2. Skip everything if `zfs` is already in the module list
//! 3. Run the prebuilt module image tagged with the kernel version
//! 4. On a registry miss only, build the module on the host from source

use serde::{Deserialize, Serialize};
use titan_exec::{docker, Program};
use tracing::{error, info, warn};

use crate::config::ModuleConfig;
use crate::environment::Environment;
use crate::error::{EnvError, Result};
use crate::kernel::{KernelTag, ModuleImageRef};

/// How the module ended up available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProvisionOutcome {
    AlreadyLoaded { kernel: KernelTag },
    Prebuilt { kernel: KernelTag, image: ModuleImageRef },
    BuiltFromSource { kernel: KernelTag },
}

impl ProvisionOutcome {
    pub fn kernel(&self) -> &KernelTag {
        match self {
            ProvisionOutcome::AlreadyLoaded { kernel }
            | ProvisionOutcome::Prebuilt { kernel, .. }
            | ProvisionOutcome::BuiltFromSource { kernel } => kernel,
        }
    }
}

/// Result of trying the prebuilt image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrebuiltAttempt {
    Installed,
    /// Registry has no image for this kernel
    NotPublished,
}

/// Whether `lsmod` output lists the zfs module.
pub fn lsmod_has_zfs(output: &str) -> bool {
    output
        .lines()
        .any(|line| line.split(' ').next() == Some("zfs"))
}

/// Provisions a ZFS kernel module matching the running kernel.
pub struct ModuleProvisioner {
    env: Environment,
    config: ModuleConfig,
}

impl ModuleProvisioner {
    pub fn new(env: Environment, config: ModuleConfig) -> Self {
        Self { env, config }
    }

    /// Read the kernel tag from the host configuration file.
    pub async fn detect_kernel(&self) -> Result<KernelTag> {
        let out = self
            .env
            .host(&["cat", self.config.kernel_config_path.as_str()])
            .await;
        if !out.success {
            return Err(EnvError::UnsupportedHost(format!(
                "unable to read {}: {}",
                self.config.kernel_config_path,
                out.trimmed()
            )));
        }

        let kernel = KernelTag::from_config(&out.output)?;
        info!(kernel = %kernel, version = kernel.version(), "Detected host kernel");
        Ok(kernel)
    }

    /// Check the module list from a throwaway container.
    pub async fn is_zfs_loaded(&self) -> bool {
        let out = self
            .env
            .run(
                Program::Docker,
                &["run", "--rm", self.config.helper_image.as_str(), "lsmod"],
            )
            .await;
        if !out.success {
            warn!(output = out.trimmed(), "Unable to list kernel modules");
            return false;
        }
        lsmod_has_zfs(&out.output)
    }

    /// Run the prebuilt module image once.
    pub async fn install_prebuilt(&self, image: &ModuleImageRef) -> Result<PrebuiltAttempt> {
        info!(image = %image, "Installing prebuilt ZFS module");
        let image_ref = image.to_string();
        let out = self
            .env
            .run(
                Program::Docker,
                &["run", "--privileged", "--rm", image_ref.as_str()],
            )
            .await;

        if out.success {
            return Ok(PrebuiltAttempt::Installed);
        }
        if docker::is_registry_miss(&out.output) {
            warn!(image = %image, "Prebuilt ZFS module not published for this kernel");
            return Ok(PrebuiltAttempt::NotPublished);
        }

        error!(image = %image, output = out.trimmed(), "Unable to install prebuilt ZFS module");
        Err(EnvError::ModuleInstallFailed {
            image: image_ref,
            output: out.output,
        })
    }

    /// Compile the module on the host. Long-running and never retried.
    pub async fn build_from_source(&self) -> Result<()> {
        info!(
            builder = %self.config.builder_image,
            zfs_version = %self.config.zfs_version,
            "Building ZFS kernel modules from source (this may take 10-30 minutes)"
        );

        let socket_mount = format!(
            "{socket}:{socket}",
            socket = self.config.engine_socket
        );
        let version_env = format!("ZFS_VERSION={}", self.config.zfs_version);
        let config_env = format!("ZFS_CONFIG={}", self.config.zfs_config);

        let out = self
            .env
            .run(
                Program::Docker,
                &[
                    "run",
                    "--rm",
                    "--privileged",
                    "-v",
                    socket_mount.as_str(),
                    "-e",
                    version_env.as_str(),
                    "-e",
                    config_env.as_str(),
                    self.config.builder_image.as_str(),
                ],
            )
            .await;

        if !out.success {
            error!(output = out.trimmed(), "Failed to build ZFS from source");
            return Err(EnvError::SourceBuildFailed { output: out.output });
        }

        info!("ZFS kernel modules built successfully");
        Ok(())
    }

    /// Make a ZFS module available for the running kernel.
    pub async fn provision(&self) -> Result<ProvisionOutcome> {
        let kernel = self.detect_kernel().await?;

        if self.is_zfs_loaded().await {
            info!(kernel = %kernel, "ZFS module already loaded");
            return Ok(ProvisionOutcome::AlreadyLoaded { kernel });
        }

        let image = ModuleImageRef::for_kernel(&self.config.prebuilt_repository, &kernel);
        match self.install_prebuilt(&image).await? {
            PrebuiltAttempt::Installed => {
                info!(image = %image, "Prebuilt ZFS module installed");
                Ok(ProvisionOutcome::Prebuilt { kernel, image })
            }
            PrebuiltAttempt::NotPublished => {
                info!(version = kernel.version(), "Falling back to building ZFS from source");
                self.build_from_source().await?;
                Ok(ProvisionOutcome::BuiltFromSource { kernel })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsmod_detects_zfs() {
        let out = "Module                  Size  Used by\nzfs                  3801088  0\nzunicode              331776  1 zfs\n";
        assert!(lsmod_has_zfs(out));
    }

    #[test]
    fn test_lsmod_ignores_dependent_modules() {
        let out = "Module                  Size  Used by\nzunicode              331776  1 zfs\nzfs_test 1 0\n";
        assert!(!lsmod_has_zfs(out));
    }
}
