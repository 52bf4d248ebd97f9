//! Transaction session identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, server-generated identifier for a session-held transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(String);

impl TxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an id received from a client. No validation: unknown ids simply
    /// do not resolve.
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TxId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TxId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for TxId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_uuids() {
        let a = TxId::new();
        let b = TxId::new();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_ref()).is_ok());
    }

    #[test]
    fn client_ids_round_trip_as_plain_strings() -> anyhow::Result<()> {
        let id = TxId::from("abc");
        assert_eq!(id.to_string(), "abc");
        assert_eq!(serde_json::to_string(&id)?, "\"abc\"");
        Ok(())
    }
}
