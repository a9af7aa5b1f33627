//! Storage-pool CLI output signatures.

use super::{contains_any, ErrorKind};

const HOST_ID_MISMATCH: &[&str] = &["was previously in use from another system", "hostid"];
const NO_POOLS: &[&str] = &["no pools available"];
const NO_SUCH_POOL: &[&str] = &["no such pool"];
const POOL_EXISTS: &[&str] = &["pool already exists", "already exists"];

/// Classify zpool output.
pub fn classify(output: &str) -> ErrorKind {
    // Checked first: import failures on a foreign host also say "cannot import".
    if contains_any(output, HOST_ID_MISMATCH) {
        return ErrorKind::HostIdMismatch;
    }
    if contains_any(output, NO_POOLS) {
        return ErrorKind::NoPoolsAvailable;
    }
    if contains_any(output, NO_SUCH_POOL) {
        return ErrorKind::PoolNotFound;
    }
    if contains_any(output, POOL_EXISTS) {
        return ErrorKind::PoolExists;
    }
    ErrorKind::Unknown
}

/// Whether the output means the pool is simply not there.
pub fn is_absent(output: &str) -> bool {
    matches!(
        classify(output),
        ErrorKind::PoolNotFound | ErrorKind::NoPoolsAvailable
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_such_pool() {
        assert_eq!(
            classify("cannot open 'titan': no such pool"),
            ErrorKind::PoolNotFound
        );
        assert!(is_absent("cannot open 'titan': no such pool"));
    }

    #[test]
    fn test_no_pools_available() {
        assert_eq!(classify("no pools available to import"), ErrorKind::NoPoolsAvailable);
        assert!(is_absent("no pools available"));
    }

    #[test]
    fn test_host_id_mismatch() {
        let out = "cannot import 'titan': pool was previously in use from another system.\n\
                   Last accessed by <unknown> (hostid=7f0101) at Tue Mar  3 12:00:00 2020";
        assert_eq!(classify(out), ErrorKind::HostIdMismatch);
        assert!(!is_absent(out));
    }

    #[test]
    fn test_pool_exists() {
        assert_eq!(
            classify("cannot create 'titan': pool already exists"),
            ErrorKind::PoolExists
        );
    }

    #[test]
    fn test_other_errors_unknown() {
        assert_eq!(classify("cannot create 'titan': I/O error"), ErrorKind::Unknown);
    }
}
