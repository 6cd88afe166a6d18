//! Tower layer counting requests in flight for the drain phase.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::Request;
use tower::{Layer, Service};

use crate::lifecycle::LifecycleController;

/// Holds an in-flight guard for the lifetime of each request so the drain
/// can wait for it.
#[derive(Debug, Clone)]
pub struct TrackInFlightLayer {
    controller: Arc<LifecycleController>,
}

impl TrackInFlightLayer {
    #[must_use]
    pub fn new(controller: Arc<LifecycleController>) -> Self {
        Self { controller }
    }
}

impl<S> Layer<S> for TrackInFlightLayer {
    type Service = TrackInFlight<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TrackInFlight {
            inner,
            controller: Arc::clone(&self.controller),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackInFlight<S> {
    inner: S,
    controller: Arc<LifecycleController>,
}

impl<S, B> Service<Request<B>> for TrackInFlight<S>
where
    S: Service<Request<B>>,
    S::Future: Send + 'static,
    S::Response: 'static,
    S::Error: 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let guard = self.controller.in_flight_guard();
        let future = self.inner.call(req);
        Box::pin(async move {
            let _guard = guard;
            future.await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::time::Duration;

    use axum::body::Body;
    use tokio::sync::oneshot;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    use super::*;

    #[tokio::test]
    async fn counts_requests_until_they_complete() {
        let controller = Arc::new(LifecycleController::new());
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(parking_lot::Mutex::new(Some(release_rx)));

        let service = ServiceBuilder::new()
            .layer(TrackInFlightLayer::new(Arc::clone(&controller)))
            .service(service_fn(move |_req: Request<Body>| {
                let release_rx = release_rx.lock().take();
                async move {
                    if let Some(rx) = release_rx {
                        let _ = rx.await;
                    }
                    Ok::<_, Infallible>(())
                }
            }));

        let pending = tokio::spawn(
            service.oneshot(Request::builder().uri("/").body(Body::empty()).unwrap()),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(controller.in_flight_count(), 1);

        release_tx.send(()).unwrap();
        pending.await.unwrap().unwrap();
        assert_eq!(controller.in_flight_count(), 0);
        assert!(controller.wait_for_drain(Duration::from_millis(10)).await);
    }
}
