//! Session identifier newtype.
//!
//! Identifiers only need to be unique among the sessions registered at any
//! instant. Generated ids are UUID v7 (time-ordered) with a short prefix.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const PREFIX: &str = "sse";

/// Opaque identifier binding one push channel to one session.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(format!("{PREFIX}_{}", Uuid::now_v7().simple()))
    }

    /// Wrap an existing string without validation.
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unwrap into the owned string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Lets maps keyed by `SessionId` be queried with a plain `&str`.
impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    #[test]
    fn generated_ids_have_prefix() {
        let id = SessionId::generate();
        assert!(id.as_str().starts_with("sse_"));
        assert_eq!(id.as_str().len(), "sse_".len() + 32);
    }

    #[test]
    fn generated_ids_are_distinct() {
        let ids: HashSet<SessionId> = (0..1000).map(|_| SessionId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn lookup_by_str() {
        let mut map = HashMap::new();
        let _ = map.insert(SessionId::from_raw("abc"), 1);
        assert_eq!(map.get("abc"), Some(&1));
        assert_eq!(map.get("abd"), None);
    }

    #[test]
    fn serde_is_transparent() {
        let id = SessionId::from_raw("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        let back: SessionId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn display_and_parse() {
        let id: SessionId = "xyz".parse().unwrap();
        assert_eq!(id.to_string(), "xyz");
        assert_eq!(id.into_inner(), "xyz");
    }
}
