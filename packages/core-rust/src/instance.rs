//! Per-process instance identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix used when the host name is unavailable or unusable.
const DEFAULT_PREFIX: &str = "keel";

/// Maximum number of host-name characters kept in a generated identity.
const MAX_PREFIX_LEN: usize = 24;

/// Opaque per-process identity, attached to health and metrics responses so
/// horizontally scaled instances can be told apart.
///
/// Generated once at startup and never changed for the lifetime of the
/// process. Cloning is cheap enough for handlers to hold their own copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generates a fresh identity of the form `<host>-<8 hex chars>`.
    ///
    /// The host part comes from the `HOSTNAME` environment variable, reduced
    /// to `[a-z0-9-]`. Falls back to `keel` when absent.
    #[must_use]
    pub fn generate() -> Self {
        let prefix = std::env::var("HOSTNAME")
            .ok()
            .map(|h| sanitize(&h))
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string());
        Self::with_prefix(&prefix)
    }

    /// Generates an identity with an explicit prefix.
    #[must_use]
    pub fn with_prefix(prefix: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{prefix}-{}", &suffix[..8]))
    }

    /// Uses an operator-supplied identity verbatim.
    ///
    /// Returns `None` for blank input so a misconfigured override falls back
    /// to a generated id instead of publishing an empty one.
    #[must_use]
    pub fn from_override(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(MAX_PREFIX_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_prefix_appends_eight_hex_chars() {
        let id = InstanceId::with_prefix("api");
        let (prefix, suffix) = id.as_str().split_once('-').unwrap();
        assert_eq!(prefix, "api");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(InstanceId::with_prefix("a"), InstanceId::with_prefix("a"));
    }

    #[test]
    fn blank_override_is_rejected() {
        assert!(InstanceId::from_override("   ").is_none());
        assert_eq!(
            InstanceId::from_override(" pod-7 ").unwrap().as_str(),
            "pod-7"
        );
    }

    #[test]
    fn sanitize_strips_unusual_characters() {
        assert_eq!(sanitize("Web_01.Prod"), "web01prod");
        assert_eq!(sanitize("node-a"), "node-a");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = InstanceId::from_override("pod-1").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"pod-1\"");
    }
}
