//! Kernel identification.
//!
//! The host's kernel is named by the `image:` entry of the `kernel:` section
//! in its LinuxKit configuration, e.g.
//!
//! ```text
//! kernel:
//!   image: linuxkit/kernel:5.10.104-linuxkit
//!   cmdline: "console=ttyS0"
//! ```
//!
//! The tag of that image (`5.10.104-linuxkit`) is the [`KernelTag`]; only
//! its version segment (`5.10.104`) matters when looking up module images.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EnvError, Result};

const KERNEL_KEY: &str = "kernel:";
const IMAGE_KEY: &str = "image:";

/// Find the kernel image reference in a LinuxKit-style config.
///
/// Single pass: a line starting with `kernel:` arms the scan and the first
/// `image:` line after it wins. Any later `kernel:` sections are never read.
pub fn find_kernel_image(config: &str) -> Option<&str> {
    let mut in_kernel = false;
    for line in config.lines() {
        let mut fields = line.split_whitespace();
        let Some(key) = fields.next() else {
            continue;
        };
        if key == KERNEL_KEY {
            in_kernel = true;
            continue;
        }
        if in_kernel && key == IMAGE_KEY {
            return fields.next();
        }
    }
    None
}

/// Version segment of a kernel tag: everything before the first `-`.
pub fn extract_version(tag: &str) -> &str {
    tag.split('-').next().unwrap_or(tag)
}

/// Read a local kernel config file and locate the kernel tag in it.
pub fn kernel_tag_from_file(path: &Path) -> Result<KernelTag> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        EnvError::UnsupportedHost(format!("cannot read {}: {e}", path.display()))
    })?;
    KernelTag::from_config(&text)
}

/// Identifying tag of the running kernel, `<version>-<distro-suffix>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelTag(String);

impl KernelTag {
    /// Take the tag from an image reference such as `linuxkit/kernel:5.10.104-linuxkit`.
    pub fn from_image_ref(image: &str) -> Result<Self> {
        let (_, tag) = image
            .rsplit_once(':')
            .ok_or_else(|| EnvError::InvalidKernelTag(image.to_string()))?;
        // A ':' belonging to a registry port leaves a path behind, not a tag.
        if tag.is_empty() || tag.contains('/') {
            return Err(EnvError::InvalidKernelTag(image.to_string()));
        }
        Ok(Self(tag.to_string()))
    }

    /// Locate the kernel image in config text and take its tag.
    pub fn from_config(config: &str) -> Result<Self> {
        let image = find_kernel_image(config).ok_or_else(|| {
            EnvError::UnsupportedHost("no kernel image found in host configuration".to_string())
        })?;
        Self::from_image_ref(image)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The version segment used to select module images
    pub fn version(&self) -> &str {
        extract_version(&self.0)
    }
}

impl fmt::Display for KernelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Prebuilt module image for one kernel version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleImageRef {
    pub repository: String,
    pub tag: String,
}

impl ModuleImageRef {
    pub fn for_kernel(repository: &str, kernel: &KernelTag) -> Self {
        Self {
            repository: repository.to_string(),
            tag: kernel.version().to_string(),
        }
    }
}

impl fmt::Display for ModuleImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}
