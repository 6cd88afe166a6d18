//! Path normalization layer.
//!
//! Rewrites known singular route prefixes to their plural form before the
//! router sees the request. The query string is kept as is.

use std::borrow::Cow;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::uri::PathAndQuery;
use axum::http::{Request, Uri};
use keel_core::PathNormalizer;
use tower::{Layer, Service};
use tracing::trace;

/// Applies a [`PathNormalizer`] to every request URI.
#[derive(Debug, Clone)]
pub struct NormalizePathLayer {
    normalizer: Arc<PathNormalizer>,
}

impl NormalizePathLayer {
    #[must_use]
    pub fn new(normalizer: PathNormalizer) -> Self {
        Self {
            normalizer: Arc::new(normalizer),
        }
    }
}

impl<S> Layer<S> for NormalizePathLayer {
    type Service = NormalizePath<S>;

    fn layer(&self, inner: S) -> Self::Service {
        NormalizePath {
            inner,
            normalizer: Arc::clone(&self.normalizer),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizePath<S> {
    inner: S,
    normalizer: Arc<PathNormalizer>,
}

impl<S, B> Service<Request<B>> for NormalizePath<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        rewrite_uri(&self.normalizer, req.uri_mut());
        self.inner.call(req)
    }
}

fn rewrite_uri(normalizer: &PathNormalizer, uri: &mut Uri) {
    let Cow::Owned(path) = normalizer.normalize(uri.path()) else {
        return;
    };
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let Ok(path_and_query) = PathAndQuery::try_from(path_and_query) else {
        return;
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    if let Ok(rewritten) = Uri::from_parts(parts) {
        trace!(from = %uri.path(), to = %rewritten.path(), "path normalized");
        *uri = rewritten;
    }
}
