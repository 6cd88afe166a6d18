//! Cache client backends.
//!
//! `memory://` and `local://` select the in-process `quick_cache` backend.
//! `redis://` and `rediss://` select a shared Redis cache when the `redis`
//! feature is enabled. Any other scheme is rejected at startup so a typo
//! never silently degrades into a cache-less deployment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use quick_cache::sync::Cache as QuickCache;

use super::{redact, Cache, Resource};
use crate::error::ResourceError;

const KIND: &str = "cache";

/// Builds a cache backend from a URL. `memory://` and `local://` select
/// [`LocalCache`] holding at most `capacity` entries.
///
/// # Errors
///
/// Returns [`ResourceError::UnsupportedScheme`], with credentials redacted,
/// for schemes this build cannot serve (including `redis://` without the
/// `redis` feature).
pub fn cache_from_url(url: &str, capacity: usize) -> Result<Arc<dyn Cache>, ResourceError> {
    match url.split_once("://").map_or("", |(scheme, _)| scheme) {
        "memory" | "local" => Ok(Arc::new(LocalCache::new(capacity))),
        #[cfg(feature = "redis")]
        "redis" | "rediss" => Ok(Arc::new(RedisCache::new(url))),
        _ => Err(ResourceError::UnsupportedScheme {
            kind: KIND,
            url: redact(url),
        }),
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Bounded in-process cache with per-entry TTL.
pub struct LocalCache {
    entries: QuickCache<String, Entry>,
    capacity: usize,
    open: AtomicBool,
}

impl LocalCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: QuickCache::new(capacity.max(1)),
            capacity,
            open: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), ResourceError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ResourceError::NotConnected { kind: KIND })
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Resource for LocalCache {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(self.ensure_open()?)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.open.store(false, Ordering::Release);
        self.entries.clear();
        Ok(())
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "backend": "local",
            "entries": self.entries.len(),
            "capacity": self.capacity,
        })
    }
}

#[async_trait]
impl Cache for LocalCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        self.ensure_open()?;
        match self.entries.get(key) {
            Some(entry) if entry.is_expired(Instant::now()) => {
                self.entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> anyhow::Result<()> {
        self.ensure_open()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        self.ensure_open()?;
        Ok(self.entries.remove(key).is_some())
    }

    async fn purge_expired(&self) -> anyhow::Result<usize> {
        self.ensure_open()?;
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key)
            .collect();
        for key in &expired {
            self.entries.remove(key.as_str());
        }
        Ok(expired.len())
    }
}

#[cfg(feature = "redis")]
pub use remote::RedisCache;

#[cfg(feature = "redis")]
mod remote {
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::RwLock;
    use redis::aio::ConnectionManager;
    use tracing::info;

    use super::{redact, Cache, Resource, ResourceError, KIND};

    /// Redis cache shared by every instance, over a multiplexed
    /// `ConnectionManager` that reconnects on its own.
    pub struct RedisCache {
        url: String,
        connection: RwLock<Option<ConnectionManager>>,
    }

    impl RedisCache {
        #[must_use]
        pub fn new(url: &str) -> Self {
            Self {
                url: url.to_string(),
                connection: RwLock::new(None),
            }
        }

        fn connection(&self) -> Result<ConnectionManager, ResourceError> {
            self.connection
                .read()
                .clone()
                .ok_or(ResourceError::NotConnected { kind: KIND })
        }
    }

    async fn send_ping(conn: &mut ConnectionManager) -> anyhow::Result<()> {
        let pong: String = redis::cmd("PING").query_async(conn).await?;
        anyhow::ensure!(pong == "PONG", "unexpected PING reply {pong:?}");
        Ok(())
    }

    #[async_trait]
    impl Resource for RedisCache {
        fn kind(&self) -> &'static str {
            KIND
        }

        async fn connect(&self) -> anyhow::Result<()> {
            let client = redis::Client::open(self.url.as_str())?;
            let mut conn = ConnectionManager::new(client).await?;
            send_ping(&mut conn).await?;
            info!(url = %redact(&self.url), "redis cache connected");
            *self.connection.write() = Some(conn);
            Ok(())
        }

        async fn ping(&self) -> anyhow::Result<()> {
            send_ping(&mut self.connection()?).await
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.connection.write().take();
            Ok(())
        }

        fn stats(&self) -> serde_json::Value {
            serde_json::json!({
                "backend": "redis",
                "connected": self.connection.read().is_some(),
            })
        }
    }

    #[async_trait]
    impl Cache for RedisCache {
        async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
            let mut conn = self.connection()?;
            let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
            Ok(value.map(Bytes::from))
        }

        async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> anyhow::Result<()> {
            let mut conn = self.connection()?;
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(&value[..]);
            if let Some(ttl) = ttl {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                cmd.arg("PX").arg(millis);
            }
            cmd.query_async::<()>(&mut conn).await?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> anyhow::Result<bool> {
            let mut conn = self.connection()?;
            let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
            Ok(removed > 0)
        }

        /// Redis expires keys itself.
        async fn purge_expired(&self) -> anyhow::Result<usize> {
            self.connection()?;
            Ok(0)
        }
    }
}
