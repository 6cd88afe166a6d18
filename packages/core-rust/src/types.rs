//! Shared enums: init criticality and deployment mode.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a failing initialization step affects startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Failure aborts startup; the process never serves traffic.
    Required,
    /// Failure is logged and startup continues in a degraded mode.
    BestEffort,
}

impl Criticality {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::BestEffort => "best_effort",
        }
    }
}

/// Deployment environment the process runs in.
///
/// Selects which conditional background tasks are started. Read once at
/// startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    #[default]
    Development,
    Staging,
    Production,
}

impl DeploymentMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    #[must_use]
    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a deployment mode string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown deployment mode: {0:?} (expected development, staging or production)")]
pub struct ParseModeError(pub String);

impl FromStr for DeploymentMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" => Ok(Self::Development),
            "staging" | "stage" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modes_and_aliases_case_insensitively() {
        assert_eq!("PRODUCTION".parse(), Ok(DeploymentMode::Production));
        assert_eq!("prod".parse(), Ok(DeploymentMode::Production));
        assert_eq!(" Stage ".parse(), Ok(DeploymentMode::Staging));
        assert_eq!("local".parse(), Ok(DeploymentMode::Development));
    }

    #[test]
    fn rejects_unknown_mode() {
        let err = "qa".parse::<DeploymentMode>().unwrap_err();
        assert_eq!(err, ParseModeError("qa".to_string()));
    }

    #[test]
    fn default_mode_is_development() {
        assert_eq!(DeploymentMode::default(), DeploymentMode::Development);
        assert!(!DeploymentMode::default().is_production());
    }

    #[test]
    fn criticality_names() {
        assert_eq!(Criticality::Required.as_str(), "required");
        assert_eq!(Criticality::BestEffort.as_str(), "best_effort");
    }
}
