//! Network configuration types.

use std::path::PathBuf;
use std::time::Duration;

use keel_core::PathNormalizer;

use super::middleware::RequestLogConfig;

/// HTTP listener and request-pipeline configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
    /// Prefix subsystem routes are nested under.
    pub api_prefix: String,
    /// Singular-to-plural prefix rewrites applied before routing.
    pub path_rules: PathNormalizer,
    pub request_log: RequestLogConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            tls: None,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            api_prefix: "/v1".to_string(),
            path_rules: PathNormalizer::default(),
            request_log: RequestLogConfig::default(),
        }
    }
}

impl NetworkConfig {
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// TLS certificate configuration.
///
/// No `Default` impl because certificate paths have no sensible defaults.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file.
    pub cert_path: PathBuf,
    /// Path to the TLS private key file.
    pub key_path: PathBuf,
}
