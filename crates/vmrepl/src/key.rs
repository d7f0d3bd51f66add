//! Instance keys.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::error::{SupervisorError, SupervisorResult};

/// A validated, case-normalized instance key (e.g. a target architecture).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InstanceKey(String);

impl InstanceKey {
    /// Normalize `raw` (trim, lowercase) and check it against `valid`.
    pub fn parse(raw: &str, valid: &BTreeSet<String>) -> SupervisorResult<Self> {
        let normalized = raw.trim().to_lowercase();
        if valid.contains(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(SupervisorError::InvalidKey {
                key: normalized,
                valid: valid.iter().map(String::as_str).collect::<Vec<_>>().join(", "),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for InstanceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> BTreeSet<String> {
        ["aarch64", "x86_64"].iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_normalizes_case_and_whitespace() {
        let key = InstanceKey::parse("  AArch64 \n", &valid()).unwrap();
        assert_eq!(key.as_str(), "aarch64");
        assert_eq!(key.to_string(), "aarch64");
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let err = InstanceKey::parse("riscv64", &valid()).unwrap_err();
        match err {
            SupervisorError::InvalidKey { key, valid } => {
                assert_eq!(key, "riscv64");
                assert_eq!(valid, "aarch64, x86_64");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let key = InstanceKey::parse("x86_64", &valid()).unwrap();
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"x86_64\"");
    }
}
