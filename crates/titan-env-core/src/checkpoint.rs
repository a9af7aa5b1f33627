//! Checkpoint identifiers returned by `titan commit`.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

const CHECKPOINT_PATTERN: &str = r"^Commit ([0-9a-f]{32})$";

fn checkpoint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(CHECKPOINT_PATTERN).expect("checkpoint pattern is valid"))
}

/// A 32-character lowercase hex checkpoint id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId(String);

impl CheckpointId {
    /// Parse checkpoint command output of exactly `Commit <32 lowercase hex>`.
    ///
    /// Surrounding whitespace is ignored; any other shape is rejected.
    pub fn parse(output: &str) -> Option<Self> {
        checkpoint_regex()
            .captures(output.trim())
            .and_then(|caps| caps.get(1))
            .map(|m| Self(m.as_str().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether `output` is a well-formed checkpoint line.
pub fn is_valid_checkpoint(output: &str) -> bool {
    CheckpointId::parse(output).is_some()
}
