//! Validated SQL identifiers.
//!
//! Schema names are written into statement text verbatim, so they are
//! checked against a conservative allow-list before use.

use crate::error::HarnessError;
use std::fmt;
use std::str::FromStr;

/// PostgreSQL truncates identifiers longer than NAMEDATALEN - 1 bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// A schema name that is safe to interpolate unquoted into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaName(String);

impl SchemaName {
    pub fn new(name: &str) -> Result<Self, HarnessError> {
        if is_plain_identifier(name) {
            Ok(Self(name.to_string()))
        } else {
            Err(HarnessError::InvalidIdentifier(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl FromStr for SchemaName {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for SchemaName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_identifiers() {
        for name in ["myschema", "_staging", "tenant_42", "A"] {
            assert_eq!(SchemaName::new(name).unwrap().as_str(), name);
        }
    }

    #[test]
    fn test_rejects_injection_and_odd_names() {
        for name in [
            "",
            "1abc",
            "my schema",
            "public; DROP TABLE test",
            "my-schema",
            "\"quoted\"",
            "schéma",
        ] {
            assert!(
                matches!(SchemaName::new(name), Err(HarnessError::InvalidIdentifier(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_length_limit() {
        let longest = "s".repeat(MAX_IDENTIFIER_LEN);
        assert!(SchemaName::new(&longest).is_ok());
        assert!(SchemaName::new(&format!("{longest}s")).is_err());
    }
}
