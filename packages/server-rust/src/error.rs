//! Error taxonomy for the lifecycle core.
//!
//! Only [`LifecycleError`] crosses the orchestrator boundary. Degraded,
//! request-scoped and shutdown-time failures are logged where they happen.

use keel_core::LifecyclePhase;

/// Fatal errors: startup is aborted and the process must not serve traffic.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("failed to acquire {resource}: {source}")]
    ResourceAcquisition {
        resource: &'static str,
        source: ResourceError,
    },

    #[error("required subsystem {subsystem:?} failed to initialize: {source}")]
    RequiredInit {
        subsystem: &'static str,
        source: anyhow::Error,
    },

    #[error("subsystem initialization already ran in this process")]
    AlreadyInitialized,

    #[error("invalid lifecycle transition {} -> {}", from.as_str(), to.as_str())]
    InvalidTransition {
        from: LifecyclePhase,
        to: LifecyclePhase,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("http server failed: {0}")]
    Serve(#[source] anyhow::Error),

    #[error("routes of subsystem {subsystem:?} conflict: {reason}")]
    RouteConflict {
        subsystem: &'static str,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Failures of an individual resource handle.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("unsupported {kind} url {url:?}")]
    UnsupportedScheme { kind: &'static str, url: String },

    #[error("{kind} connect failed: {source}")]
    Connect {
        kind: &'static str,
        source: anyhow::Error,
    },

    #[error("{kind} connect timed out after {timeout:?}")]
    ConnectTimeout {
        kind: &'static str,
        timeout: std::time::Duration,
    },

    #[error("{kind} close failed: {source}")]
    Close {
        kind: &'static str,
        source: anyhow::Error,
    },

    #[error("{kind} close timed out")]
    CloseTimeout { kind: &'static str },

    #[error("{kind} is not connected")]
    NotConnected { kind: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_names_both_phases() {
        let err = LifecycleError::InvalidTransition {
            from: LifecyclePhase::Stopped,
            to: LifecyclePhase::Running,
        };
        assert_eq!(err.to_string(), "invalid lifecycle transition stopped -> running");
    }

    #[test]
    fn required_init_keeps_the_cause() {
        let err = LifecycleError::RequiredInit {
            subsystem: "triggers",
            source: anyhow::anyhow!("db down"),
        };
        assert!(err.to_string().contains("\"triggers\""));
        assert!(err.to_string().contains("db down"));
    }

    #[test]
    fn resource_error_converts_into_lifecycle_error() {
        let err: LifecycleError = ResourceError::UnsupportedScheme {
            kind: "cache",
            url: "redis://x".to_string(),
        }
        .into();
        assert!(matches!(err, LifecycleError::Resource(_)));
    }
}
