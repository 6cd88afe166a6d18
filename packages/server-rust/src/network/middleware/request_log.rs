//! Request logging with timing.
//!
//! Every request gets a fresh UUID v4 correlation id, carried as the
//! `x-request-id` header in both directions and recorded on a per-request
//! span. Only failures and slow requests are logged: a fast successful
//! request produces no log line at all.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use keel_core::RequestStats;
use tower::{Layer, Service};
use tracing::{error, info_span, warn, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Request logging settings.
#[derive(Debug, Clone)]
pub struct RequestLogConfig {
    /// Successful requests slower than this are logged at `warn`.
    pub slow_threshold: Duration,
}

impl Default for RequestLogConfig {
    fn default() -> Self {
        Self {
            slow_threshold: Duration::from_secs(1),
        }
    }
}

/// Correlation id of the current request, available as a request
/// extension to every handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub Uuid);

/// How a finished request is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestVerdict {
    /// Fast success: nothing is logged.
    Quiet,
    /// Success slower than the threshold.
    Slow,
    ClientError,
    ServerError,
}

impl RequestVerdict {
    #[must_use]
    pub fn classify(status: StatusCode, elapsed: Duration, slow_threshold: Duration) -> Self {
        if status.is_server_error() {
            Self::ServerError
        } else if status.as_u16() >= 400 {
            Self::ClientError
        } else if elapsed > slow_threshold {
            Self::Slow
        } else {
            Self::Quiet
        }
    }
}

/// Process-wide request counters read by the metrics endpoint.
#[derive(Debug, Default)]
pub struct RequestCounters {
    total: AtomicU64,
    client_errors: AtomicU64,
    server_errors: AtomicU64,
    slow: AtomicU64,
    failed: AtomicU64,
}

impl RequestCounters {
    fn record(&self, verdict: RequestVerdict) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let counter = match verdict {
            RequestVerdict::Quiet => return,
            RequestVerdict::Slow => &self.slow,
            RequestVerdict::ClientError => &self.client_errors,
            RequestVerdict::ServerError => &self.server_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failed(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stats(&self, in_flight: u64) -> RequestStats {
        RequestStats {
            total: self.total.load(Ordering::Relaxed),
            client_errors: self.client_errors.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
            slow: self.slow.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestLogLayer {
    counters: Arc<RequestCounters>,
    slow_threshold: Duration,
}

impl RequestLogLayer {
    #[must_use]
    pub fn new(counters: Arc<RequestCounters>, config: &RequestLogConfig) -> Self {
        Self {
            counters,
            slow_threshold: config.slow_threshold,
        }
    }
}

impl<S> Layer<S> for RequestLogLayer {
    type Service = RequestLog<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLog {
            inner,
            counters: Arc::clone(&self.counters),
            slow_threshold: self.slow_threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestLog<S> {
    inner: S,
    counters: Arc<RequestCounters>,
    slow_threshold: Duration,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RequestLog<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Error: Display + Send + 'static,
    S::Future: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let id = Uuid::new_v4();
        let header = HeaderValue::from_str(&id.to_string()).ok();
        if let Some(value) = &header {
            req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
        }
        req.extensions_mut().insert(RequestId(id));

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let span = info_span!("request", request_id = %id, method = %method, path = %path);

        let counters = Arc::clone(&self.counters);
        let slow_threshold = self.slow_threshold;
        let started = Instant::now();
        let future = span.in_scope(|| self.inner.call(req));

        Box::pin(
            async move {
                let result = future.await;
                let elapsed = started.elapsed();
                let duration_ms = elapsed.as_secs_f64() * 1000.0;
                metrics::histogram!("keel_http_request_duration_seconds")
                    .record(elapsed.as_secs_f64());

                match result {
                    Ok(mut response) => {
                        let status = response.status();
                        let verdict = RequestVerdict::classify(status, elapsed, slow_threshold);
                        counters.record(verdict);
                        metrics::counter!("keel_http_requests_total", "status" => status.as_u16().to_string())
                            .increment(1);

                        match verdict {
                            RequestVerdict::ClientError | RequestVerdict::ServerError => error!(
                                method = %method,
                                path = %path,
                                status = status.as_u16(),
                                duration_ms,
                                "request failed"
                            ),
                            RequestVerdict::Slow => warn!(
                                method = %method,
                                path = %path,
                                status = status.as_u16(),
                                duration_ms,
                                "slow request"
                            ),
                            RequestVerdict::Quiet => {}
                        }

                        if let Some(value) = header {
                            response.headers_mut().insert(REQUEST_ID_HEADER, value);
                        }
                        Ok(response)
                    }
                    Err(e) => {
                        counters.record_failed();
                        metrics::counter!("keel_http_requests_total", "status" => "error").increment(1);
                        error!(method = %method, path = %path, duration_ms, error = %e, "request errored");
                        Err(e)
                    }
                }
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use axum::body::Body;
    use parking_lot::Mutex;
    use tower::{service_fn, ServiceBuilder, ServiceExt};
    use tracing::field::{Field, Visit};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
    use tracing_subscriber::Layer as _;

    use super::*;

    /// One captured event: level plus rendered fields.
    #[derive(Debug, Clone)]
    struct Captured {
        level: Level,
        fields: Vec<(String, String)>,
    }

    impl Captured {
        fn field(&self, name: &str) -> Option<&str> {
            self.fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        }
    }

    #[derive(Clone, Default)]
    struct CaptureLayer {
        events: Arc<Mutex<Vec<Captured>>>,
    }

    struct FieldVisitor<'a>(&'a mut Vec<(String, String)>);

    impl Visit for FieldVisitor<'_> {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            self.0.push((field.name().to_string(), format!("{value:?}")));
        }
    }

    impl<S: Subscriber> tracing_subscriber::Layer<S> for CaptureLayer {
        fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
            let mut fields = Vec::new();
            event.record(&mut FieldVisitor(&mut fields));
            self.events.lock().push(Captured {
                level: *event.metadata().level(),
                fields,
            });
        }
    }

    async fn run_request(status: StatusCode, delay: Duration) -> (Vec<Captured>, Response<Body>, Arc<RequestCounters>) {
        let capture = CaptureLayer::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone().with_filter(
            tracing_subscriber::filter::Targets::new()
                .with_target("keel_server::network::middleware::request_log", Level::TRACE),
        ));
        let _guard = tracing::subscriber::set_default(subscriber);

        let counters = Arc::new(RequestCounters::default());
        let service = ServiceBuilder::new()
            .layer(RequestLogLayer::new(
                Arc::clone(&counters),
                &RequestLogConfig {
                    slow_threshold: Duration::from_millis(20),
                },
            ))
            .service(service_fn(move |req: Request<Body>| async move {
                assert!(req.headers().contains_key(REQUEST_ID_HEADER));
                assert!(req.extensions().get::<RequestId>().is_some());
                tokio::time::sleep(delay).await;
                Ok::<_, Infallible>(
                    Response::builder().status(status).body(Body::empty()).unwrap(),
                )
            }));

        let req = Request::builder()
            .method("POST")
            .uri("/v1/threads/7")
            .body(Body::empty())
            .unwrap();
        let response = service.oneshot(req).await.unwrap();
        let events = capture.events.lock().clone();
        (events, response, counters)
    }

    #[tokio::test]
    async fn fast_success_logs_nothing() {
        let (events, response, counters) = run_request(StatusCode::OK, Duration::ZERO).await;
        assert!(events.is_empty(), "unexpected events: {events:?}");
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        assert_eq!(counters.stats(0).total, 1);
    }

    #[tokio::test]
    async fn server_error_logs_exactly_one_error() {
        let (events, _response, counters) =
            run_request(StatusCode::INTERNAL_SERVER_ERROR, Duration::ZERO).await;

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.level, Level::ERROR);
        assert_eq!(event.field("method"), Some("POST"));
        assert_eq!(event.field("path"), Some("/v1/threads/7"));
        assert_eq!(event.field("status"), Some("500"));
        assert!(event.field("duration_ms").is_some());
        assert_eq!(counters.stats(0).server_errors, 1);
    }

    #[tokio::test]
    async fn client_error_is_logged_at_error() {
        let (events, _response, counters) = run_request(StatusCode::NOT_FOUND, Duration::ZERO).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, Level::ERROR);
        assert_eq!(counters.stats(0).client_errors, 1);
    }

    #[tokio::test]
    async fn slow_success_logs_a_warning() {
        let (events, _response, counters) =
            run_request(StatusCode::OK, Duration::from_millis(40)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].level, Level::WARN);
        assert_eq!(counters.stats(0).slow, 1);
    }

    #[tokio::test]
    async fn response_echoes_the_request_id() {
        let seen = Arc::new(Mutex::new(None));
        let seen_in_handler = Arc::clone(&seen);
        let service = ServiceBuilder::new()
            .layer(RequestLogLayer::new(
                Arc::new(RequestCounters::default()),
                &RequestLogConfig::default(),
            ))
            .service(service_fn(move |req: Request<Body>| {
                let seen = Arc::clone(&seen_in_handler);
                async move {
                    *seen.lock() = req.extensions().get::<RequestId>().copied();
                    Ok::<_, Infallible>(Response::new(Body::empty()))
                }
            }));

        let response = service
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let header = response.headers()[REQUEST_ID_HEADER].to_str().unwrap().to_string();
        let RequestId(id) = (*seen.lock()).expect("request id extension set");
        assert_eq!(header, id.to_string());
    }

    #[tokio::test]
    async fn inner_error_is_logged_and_returned_unchanged() {
        let counters = Arc::new(RequestCounters::default());
        let service = ServiceBuilder::new()
            .layer(RequestLogLayer::new(Arc::clone(&counters), &RequestLogConfig::default()))
            .service(service_fn(|_req: Request<Body>| async {
                Err::<Response<Body>, _>("connection reset".to_string())
            }));

        let err = service
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap_err();

        assert_eq!(err, "connection reset");
        assert_eq!(counters.stats(0).failed, 1);
    }

    #[test]
    fn classify_boundaries() {
        let slow = Duration::from_secs(1);
        assert_eq!(
            RequestVerdict::classify(StatusCode::OK, Duration::from_millis(999), slow),
            RequestVerdict::Quiet
        );
        assert_eq!(
            RequestVerdict::classify(StatusCode::OK, Duration::from_millis(1001), slow),
            RequestVerdict::Slow
        );
        assert_eq!(
            RequestVerdict::classify(StatusCode::BAD_REQUEST, Duration::ZERO, slow),
            RequestVerdict::ClientError
        );
        assert_eq!(
            RequestVerdict::classify(StatusCode::BAD_GATEWAY, Duration::from_secs(5), slow),
            RequestVerdict::ServerError
        );
    }

    proptest::proptest! {
        #[test]
        fn fast_success_is_never_logged(code in 100u16..400, elapsed_ms in 0u64..=1000) {
            let status = StatusCode::from_u16(code).unwrap();
            let verdict = RequestVerdict::classify(
                status,
                Duration::from_millis(elapsed_ms),
                Duration::from_secs(1),
            );
            proptest::prop_assert_eq!(verdict, RequestVerdict::Quiet);
        }

        #[test]
        fn server_errors_win_over_slowness(code in 500u16..600, elapsed_ms in 0u64..10_000) {
            let status = StatusCode::from_u16(code).unwrap();
            let verdict = RequestVerdict::classify(
                status,
                Duration::from_millis(elapsed_ms),
                Duration::from_secs(1),
            );
            proptest::prop_assert_eq!(verdict, RequestVerdict::ServerError);
        }
    }
}
