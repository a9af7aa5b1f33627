//! Container-engine CLI output signatures.

use super::{contains_any, ErrorKind};

const REGISTRY_MISS: &[&str] = &["manifest unknown", "pull access denied"];
const NO_SUCH_CONTAINER: &[&str] = &["no such container"];
const NO_SUCH_IMAGE: &[&str] = &["no such image", "image not known"];

/// Classify docker output.
pub fn classify(output: &str) -> ErrorKind {
    if contains_any(output, REGISTRY_MISS) || is_manifest_not_found(output) {
        return ErrorKind::RegistryMiss;
    }
    if contains_any(output, NO_SUCH_CONTAINER) {
        return ErrorKind::ContainerNotFound;
    }
    if contains_any(output, NO_SUCH_IMAGE) {
        return ErrorKind::ImageNotFound;
    }
    ErrorKind::Unknown
}

/// Whether the output reports a registry miss for the requested tag.
pub fn is_registry_miss(output: &str) -> bool {
    classify(output) == ErrorKind::RegistryMiss
}

// "manifest for titandata/x:5.10 not found: manifest unknown" is the common
// form, but older engines drop the suffix.
fn is_manifest_not_found(output: &str) -> bool {
    output.lines().any(|line| {
        let line = line.to_lowercase();
        match line.find("manifest for ") {
            Some(start) => line[start..].contains(" not found"),
            None => false,
        }
    })
}
