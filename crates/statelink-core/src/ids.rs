//! Client connection identifiers.
//!
//! A [`ClientId`] is opaque to clients. New ids are `client_` followed by a
//! UUID v7 so that ids sort by admission time in logs.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix for generated client ids.
const CLIENT_PREFIX: &str = "client_";

/// Identity of one admitted client connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Generate a fresh id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("{CLIENT_PREFIX}{}", Uuid::now_v7()))
    }

    /// Wrap an existing id (e.g. one supplied by a resuming client).
    #[must_use]
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix_and_v7_uuid() {
        let id = ClientId::generate();
        let raw = id.as_str().strip_prefix(CLIENT_PREFIX).unwrap();
        let parsed = Uuid::parse_str(raw).unwrap();
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(ClientId::generate(), ClientId::generate());
    }

    #[test]
    fn display_is_raw_string() {
        let id = ClientId::from("client_abc");
        assert_eq!(id.to_string(), "client_abc");
    }

    #[test]
    fn serializes_transparently() {
        let id = ClientId::from("client_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"client_1\"");
        let back: ClientId = serde_json::from_str("\"client_1\"").unwrap();
        assert_eq!(back, id);
    }
}
