//! Singular-to-plural path prefix rewriting.
//!
//! Clients are inconsistent about `/v1/thread/…` versus `/v1/threads/…`.
//! Rather than duplicating route tables, requests are normalized onto the
//! canonical plural prefix before route matching.

use std::borrow::Cow;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A single prefix rewrite rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRewrite {
    from: String,
    to: String,
}

/// Rejected rewrite rules.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathRuleError {
    #[error("path rule prefixes must start with '/': {0:?}")]
    NotAbsolute(String),
    #[error("path rule {from:?} -> {to:?} would match its own output")]
    SelfMatching { from: String, to: String },
    #[error("path rule must be written as FROM=TO, got {0:?}")]
    Malformed(String),
    #[error("output of path rule {to:?} is rewritten again by rule {from:?}")]
    Chained { from: String, to: String },
}

impl PathRewrite {
    /// Creates a rule rewriting paths starting with `from` to start with `to`.
    ///
    /// # Errors
    ///
    /// Returns an error if either prefix is not absolute, or if `to` itself
    /// starts with `from` (which would break idempotence).
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Result<Self, PathRuleError> {
        let from = from.into();
        let to = to.into();
        for prefix in [&from, &to] {
            if !prefix.starts_with('/') {
                return Err(PathRuleError::NotAbsolute(prefix.clone()));
            }
        }
        if to.starts_with(&from) {
            return Err(PathRuleError::SelfMatching { from, to });
        }
        Ok(Self { from, to })
    }

    #[must_use]
    pub fn from_prefix(&self) -> &str {
        &self.from
    }

    #[must_use]
    pub fn to_prefix(&self) -> &str {
        &self.to
    }

    fn apply<'a>(&self, path: &'a str) -> Option<Cow<'a, str>> {
        path.strip_prefix(self.from.as_str())
            .map(|rest| Cow::Owned(format!("{}{rest}", self.to)))
    }
}

impl FromStr for PathRewrite {
    type Err = PathRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (from, to) = s
            .split_once('=')
            .ok_or_else(|| PathRuleError::Malformed(s.to_string()))?;
        Self::new(from.trim(), to.trim())
    }
}

/// Ordered set of rewrite rules. The first matching rule wins and at most
/// one rule is applied per path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathNormalizer {
    rules: Vec<PathRewrite>,
}

impl PathNormalizer {
    /// Builds a normalizer from an ordered rule list.
    ///
    /// # Errors
    ///
    /// Returns [`PathRuleError::Chained`] if any rule's output prefix would
    /// be matched by another rule, since normalizing twice must be a no-op.
    pub fn new(rules: Vec<PathRewrite>) -> Result<Self, PathRuleError> {
        for produced in &rules {
            if let Some(other) = rules.iter().find(|r| produced.to.starts_with(&r.from)) {
                return Err(PathRuleError::Chained {
                    from: other.from.clone(),
                    to: produced.to.clone(),
                });
            }
        }
        Ok(Self { rules })
    }

    /// A normalizer that never rewrites.
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    #[must_use]
    pub fn rules(&self) -> &[PathRewrite] {
        &self.rules
    }

    /// Rewrites `path` onto its canonical prefix. Paths matching no rule are
    /// returned borrowed and unchanged.
    #[must_use]
    pub fn normalize<'a>(&self, path: &'a str) -> Cow<'a, str> {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(path))
            .unwrap_or(Cow::Borrowed(path))
    }
}

impl Default for PathNormalizer {
    /// The agent-run and thread singular prefixes used by older clients.
    fn default() -> Self {
        Self {
            rules: vec![
                PathRewrite {
                    from: "/v1/agent-run/".to_string(),
                    to: "/v1/agent-runs/".to_string(),
                },
                PathRewrite {
                    from: "/v1/thread/".to_string(),
                    to: "/v1/threads/".to_string(),
                },
            ],
        }
    }
}
