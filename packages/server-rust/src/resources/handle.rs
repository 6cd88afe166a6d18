//! Typed handles the orchestrator opens and closes on behalf of every
//! consumer.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use keel_core::{ResourceSnapshot, ResourceState};
use parking_lot::Mutex;
use tracing::{info, warn};

use super::{Cache, Database, PoolStats, Resource};
use crate::error::ResourceError;

#[derive(Debug, Clone, Copy)]
struct HandleStatus {
    state: ResourceState,
    acquired_at: Option<SystemTime>,
}

/// Typed handle to one external resource.
///
/// Tracks `Uninitialized -> Ready -> Closed`. Consumers get the data
/// operations of the resource, which fail with
/// [`ResourceError::NotConnected`] unless the handle is `Ready`. Opening
/// and closing are crate-private and stay with the orchestrator; the
/// backend itself is never handed out.
pub struct ResourceHandle<T: ?Sized> {
    inner: Arc<T>,
    status: Mutex<HandleStatus>,
}

impl<T: Resource + ?Sized> ResourceHandle<T> {
    #[must_use]
    pub fn new(inner: Arc<T>) -> Self {
        Self {
            inner,
            status: Mutex::new(HandleStatus {
                state: ResourceState::Uninitialized,
                acquired_at: None,
            }),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    #[must_use]
    pub fn state(&self) -> ResourceState {
        self.status.lock().state
    }

    #[must_use]
    pub fn acquired_at(&self) -> Option<SystemTime> {
        self.status.lock().acquired_at
    }

    fn ready(&self) -> Result<&T, ResourceError> {
        if self.state() == ResourceState::Ready {
            Ok(&*self.inner)
        } else {
            Err(ResourceError::NotConnected { kind: self.kind() })
        }
    }

    /// Round-trips a ping to the backend.
    ///
    /// # Errors
    ///
    /// Fails if the handle is not `Ready` or the backend does not answer.
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.ready()?.ping().await
    }

    /// Opens the resource, giving up after `timeout`.
    pub(crate) async fn acquire(&self, timeout: Duration) -> Result<(), ResourceError> {
        let kind = self.kind();
        match tokio::time::timeout(timeout, self.inner.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(source)) => return Err(ResourceError::Connect { kind, source }),
            Err(_elapsed) => return Err(ResourceError::ConnectTimeout { kind, timeout }),
        }

        let mut status = self.status.lock();
        status.state = ResourceState::Ready;
        status.acquired_at = Some(SystemTime::now());
        info!(resource = kind, "resource ready");
        Ok(())
    }

    /// Closes the resource if it was opened. The handle ends up `Closed`
    /// whatever the outcome; a failed close is reported, never retried.
    pub(crate) async fn release(&self, timeout: Duration) -> Result<(), ResourceError> {
        let kind = self.kind();
        let previous = {
            let mut status = self.status.lock();
            std::mem::replace(&mut status.state, ResourceState::Closed)
        };
        if previous != ResourceState::Ready {
            return Ok(());
        }

        let result = match tokio::time::timeout(timeout, self.inner.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(ResourceError::Close { kind, source }),
            Err(_elapsed) => Err(ResourceError::CloseTimeout { kind }),
        };
        match &result {
            Ok(()) => info!(resource = kind, "resource closed"),
            Err(e) => warn!(resource = kind, error = %e, "resource close failed"),
        }
        result
    }

    #[must_use]
    pub fn snapshot(&self) -> ResourceSnapshot {
        let status = *self.status.lock();
        ResourceSnapshot {
            name: self.kind().to_string(),
            state: status.state,
            acquired_at_ms: status.acquired_at.and_then(epoch_millis),
            stats: self.inner.stats(),
        }
    }
}

impl ResourceHandle<dyn Database> {
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool_stats()
    }
}

impl ResourceHandle<dyn Cache> {
    /// # Errors
    ///
    /// Fails if the handle is not `Ready` or the backend errors.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        self.ready()?.get(key).await
    }

    /// Stores `value`; `ttl` of `None` keeps it until evicted.
    ///
    /// # Errors
    ///
    /// Fails if the handle is not `Ready` or the backend errors.
    pub async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> anyhow::Result<()> {
        self.ready()?.set(key, value, ttl).await
    }

    /// Returns `true` if the key existed.
    ///
    /// # Errors
    ///
    /// Fails if the handle is not `Ready` or the backend errors.
    pub async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        self.ready()?.delete(key).await
    }

    /// Drops expired entries, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Fails if the handle is not `Ready` or the backend errors.
    pub async fn purge_expired(&self) -> anyhow::Result<usize> {
        self.ready()?.purge_expired().await
    }
}

pub(crate) fn epoch_millis(at: SystemTime) -> Option<u64> {
    at.duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| u64::try_from(d.as_millis()).ok())
}
