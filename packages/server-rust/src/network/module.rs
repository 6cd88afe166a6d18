//! Network module with deferred startup lifecycle.
//!
//! `new()` holds configuration, `start()` binds the TCP listener, and
//! `serve()` starts accepting connections. The listener is bound before
//! resources are acquired so a port conflict fails fast, while accepting
//! only begins once the orchestrator reports Running.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Request;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tracing::info;

use super::config::{NetworkConfig, TlsConfig};
use super::handlers::{
    health_handler, liveness_handler, metrics_handler, readiness_handler, AppState,
};
use super::middleware::{
    build_http_layers, NormalizePath, NormalizePathLayer, RequestLog, RequestLogLayer,
    TrackInFlight, TrackInFlightLayer,
};
use crate::error::LifecycleError;

/// The complete request pipeline: normalization, logging and in-flight
/// tracking wrapped around the router.
pub type HttpApp = NormalizePath<RequestLog<TrackInFlight<Router>>>;

/// Owns the HTTP listener.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            listener: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Address of the bound listener, once `start()` succeeded.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Bind`] if the address cannot be bound
    /// (e.g., port in use).
    pub async fn start(&mut self) -> Result<u16, LifecycleError> {
        if let Some(bound) = self.local_addr() {
            return Ok(bound.port());
        }

        let addr = self.config.bind_addr();
        let bind_err = |source| LifecycleError::Bind {
            addr: addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&addr).await.map_err(bind_err)?;
        let port = listener.local_addr().map_err(bind_err)?.port();

        info!(host = %self.config.host, port, "TCP listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves `app` until `shutdown` completes, then waits for open
    /// connections to finish.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Serve`] if `start()` was not called, if
    /// TLS material cannot be loaded, or on a fatal I/O error.
    pub async fn serve(
        self,
        app: HttpApp,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), LifecycleError> {
        let Some(listener) = self.listener else {
            return Err(LifecycleError::Serve(anyhow::anyhow!(
                "start() must be called before serve()"
            )));
        };

        match self.config.tls {
            Some(ref tls) => serve_tls(listener, app, tls, shutdown).await,
            None => serve_plain(listener, app, shutdown).await,
        }
    }
}

/// Assembles the request pipeline.
///
/// Routes:
/// - `GET /health`, `GET /health/live`, `GET /health/ready`, `GET /metrics`,
///   mounted at the root and again under the API prefix
/// - every subsystem route, nested under the API prefix
///
/// Path normalization wraps the router rather than being a router layer,
/// so rewritten paths are routed by their plural form.
#[must_use]
pub fn build_app(config: &NetworkConfig, state: AppState, subsystem_routes: Router) -> HttpApp {
    let controller = Arc::clone(&state.ctx.lifecycle);
    let counters = Arc::clone(&state.ctx.requests);

    let system = system_routes().with_state(state);
    let router = match api_prefix(&config.api_prefix) {
        Some(prefix) => system.clone().nest(&prefix, system.merge(subsystem_routes)),
        None => system.merge(subsystem_routes),
    };
    let router = router.layer(build_http_layers(config));

    ServiceBuilder::new()
        .layer(NormalizePathLayer::new(config.path_rules.clone()))
        .layer(RequestLogLayer::new(counters, &config.request_log))
        .layer(TrackInFlightLayer::new(controller))
        .service(router)
}

/// Paths served by the service itself, at the root and under the prefix.
pub const SYSTEM_PATHS: [&str; 4] = ["/health", "/health/live", "/health/ready", "/metrics"];

fn system_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
}

/// `"/v1/"` and `"v1"` both become `"/v1"`; an empty or root prefix means
/// no nesting.
fn api_prefix(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("/{trimmed}"))
    }
}

/// Serves plain HTTP connections using axum's built-in server.
async fn serve_plain(
    listener: TcpListener,
    app: HttpApp,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), LifecycleError> {
    info!("Serving plain HTTP connections");

    axum::serve(listener, axum::ServiceExt::<Request>::into_make_service(app))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| LifecycleError::Serve(e.into()))?;

    info!("HTTP server stopped");
    Ok(())
}

/// Serves TLS connections using `axum-server` with rustls.
///
/// Reuses the pre-bound TCP listener by converting it to a `std::net::TcpListener`.
async fn serve_tls(
    listener: TcpListener,
    app: HttpApp,
    tls_config: &TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), LifecycleError> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls_config.cert_path, &tls_config.key_path)
        .await
        .map_err(|e| {
            LifecycleError::Serve(anyhow::anyhow!("Failed to load TLS certificates: {e}"))
        })?;

    let io_err = |e: std::io::Error| LifecycleError::Serve(e.into());
    let addr = listener.local_addr().map_err(io_err)?;
    let std_listener = listener.into_std().map_err(io_err)?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    let trigger = tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!(%addr, "Serving TLS connections");

    let served = axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(axum::ServiceExt::<Request>::into_make_service(app))
        .await;
    trigger.abort();
    served.map_err(io_err)?;

    info!("HTTPS server stopped");
    Ok(())
}
