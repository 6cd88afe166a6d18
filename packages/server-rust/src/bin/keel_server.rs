//! Keel server binary: reads configuration from flags and `KEEL_*`
//! environment variables, serves until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use keel_core::{DeploymentMode, PathNormalizer, PathRewrite};
use keel_server::lifecycle::{signal_stream, LifecycleConfig, Orchestrator};
use keel_server::network::middleware::RequestLogConfig;
use keel_server::network::{NetworkConfig, NetworkModule, TlsConfig};
use keel_server::tasks::TaskConfig;
use keel_server::telemetry::{init_tracing, install_prometheus, LogFormat};

#[derive(Parser, Debug)]
#[command(name = "keel-server", version, about = "Service lifecycle backbone")]
struct Args {
    /// Deployment mode: development, staging or production.
    #[arg(long, env = "KEEL_MODE", default_value = "development")]
    mode: DeploymentMode,

    /// Fixed instance id instead of a generated one.
    #[arg(long, env = "KEEL_INSTANCE_ID")]
    instance_id: Option<String>,

    #[arg(long, env = "KEEL_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "KEEL_PORT", default_value_t = 7860)]
    port: u16,

    /// Prefix subsystem routes are nested under.
    #[arg(long, env = "KEEL_API_PREFIX", default_value = "/v1")]
    api_prefix: String,

    /// Path prefix rewrites as `FROM=TO`, comma-separated. Replaces the
    /// built-in singular-to-plural rules.
    #[arg(long = "path-rule", env = "KEEL_PATH_RULES", value_delimiter = ',')]
    path_rules: Vec<PathRewrite>,

    #[arg(long, env = "KEEL_DATABASE_URL", default_value = "memory://")]
    database_url: String,

    #[arg(long, env = "KEEL_DB_MAX_CONNECTIONS", default_value_t = 10)]
    db_max_connections: u32,

    #[arg(long, env = "KEEL_CACHE_URL", default_value = "memory://")]
    cache_url: String,

    #[arg(long, env = "KEEL_CACHE_CAPACITY", default_value_t = 10_000)]
    cache_capacity: usize,

    /// How long to hold in Draining for in-flight requests.
    #[arg(long, env = "KEEL_DRAIN_GRACE_MS", default_value_t = 2_000)]
    drain_grace_ms: u64,

    #[arg(long, env = "KEEL_TASK_BUDGET_SECS", default_value_t = 5)]
    task_budget_secs: u64,

    #[arg(long, env = "KEEL_SHUTDOWN_BUDGET_SECS", default_value_t = 10)]
    shutdown_budget_secs: u64,

    /// Requests slower than this are logged as warnings.
    #[arg(long, env = "KEEL_SLOW_REQUEST_MS", default_value_t = 1_000)]
    slow_request_ms: u64,

    #[arg(long, env = "KEEL_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,

    /// Comma-separated allowed origins; `*` allows any.
    #[arg(long, env = "KEEL_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,

    #[arg(long, env = "KEEL_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Starts a Prometheus scrape listener on this address.
    #[arg(long, env = "KEEL_PROMETHEUS_ADDR")]
    prometheus_addr: Option<SocketAddr>,

    #[arg(long, env = "KEEL_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, env = "KEEL_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

impl Args {
    fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            mode: self.mode,
            instance_id: self.instance_id.clone(),
            database_url: self.database_url.clone(),
            db_max_connections: self.db_max_connections,
            cache_url: self.cache_url.clone(),
            cache_capacity: self.cache_capacity,
            drain_grace: Duration::from_millis(self.drain_grace_ms),
            task_budget: Duration::from_secs(self.task_budget_secs),
            shutdown_budget: Duration::from_secs(self.shutdown_budget_secs),
            tasks: TaskConfig::default(),
            ..LifecycleConfig::default()
        }
    }

    fn network_config(&self) -> anyhow::Result<NetworkConfig> {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            }),
            _ => None,
        };
        let path_rules = if self.path_rules.is_empty() {
            PathNormalizer::default()
        } else {
            PathNormalizer::new(self.path_rules.clone())?
        };
        Ok(NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            tls,
            cors_origins: self.cors_origins.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            api_prefix: self.api_prefix.clone(),
            request_log: RequestLogConfig {
                slow_threshold: Duration::from_millis(self.slow_request_ms),
            },
            path_rules,
            ..NetworkConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format)?;

    if let Some(addr) = args.prometheus_addr {
        install_prometheus(addr)?;
    }

    let orchestrator = Orchestrator::from_config(args.lifecycle_config());
    let network = NetworkModule::new(args.network_config()?);
    let signals = signal_stream()?;

    let report = orchestrator.run(network, signals).await?;
    if let Some(error) = report.server_error {
        anyhow::bail!("http server failed: {error}");
    }
    Ok(())
}
