//! Titan CLI output signatures.

use super::{contains_any, ErrorKind};

const UNAVAILABLE: &[&str] = &["connection refused", "not running", "failed to connect"];
const NOT_FOUND: &[&str] = &["does not exist", "not found", "no such repository"];
const EXISTS: &[&str] = &["already exists"];

/// Classify titan CLI output.
pub fn classify(output: &str) -> ErrorKind {
    if contains_any(output, UNAVAILABLE) {
        return ErrorKind::ServiceUnavailable;
    }
    if contains_any(output, EXISTS) {
        return ErrorKind::RepositoryExists;
    }
    if contains_any(output, NOT_FOUND) {
        return ErrorKind::RepositoryNotFound;
    }
    ErrorKind::Unknown
}
