//! Shared connection substrate: database pool, cache client, instance id.
//!
//! Resources are opened once by the orchestrator, shared read-only with
//! every subsystem and background task, and closed by the orchestrator in
//! reverse acquisition order. Consumers reach a resource only through its
//! [`ResourceHandle`], which exposes the data operations and keeps
//! `connect`/`close` crate-private.

pub mod cache;
pub mod database;
pub mod handle;
pub mod set;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

pub use cache::{cache_from_url, LocalCache};
#[cfg(feature = "redis")]
pub use cache::RedisCache;
pub use database::{database_from_url, MemoryDatabase};
#[cfg(feature = "postgres")]
pub use database::PostgresDatabase;
pub use handle::ResourceHandle;
pub use set::ResourceSet;

/// Lifecycle operations every external resource supports.
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    /// Short stable name used in logs and metrics (e.g. `"database"`).
    fn kind(&self) -> &'static str;

    /// Open connections. Called exactly once by the orchestrator.
    async fn connect(&self) -> anyhow::Result<()>;

    /// Cheap liveness probe.
    async fn ping(&self) -> anyhow::Result<()>;

    /// Release connections. Called once, during shutdown.
    async fn close(&self) -> anyhow::Result<()>;

    /// Backend-specific statistics for the metrics endpoint.
    fn stats(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Strips credentials so connection URLs can be logged.
pub(crate) fn redact(url: &str) -> String {
    match (url.split_once("://"), url.rsplit_once('@')) {
        (Some((scheme, _)), Some((_, host))) => format!("{scheme}://***@{host}"),
        _ => url.to_string(),
    }
}

/// Connection pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
    pub max: u32,
}

/// Relational database pool.
pub trait Database: Resource {
    fn pool_stats(&self) -> PoolStats;
}

/// Key/value cache client.
#[async_trait]
pub trait Cache: Resource {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>>;

    /// Stores `value`; `ttl` of `None` keeps it until evicted.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> anyhow::Result<()>;

    /// Returns `true` if the key existed.
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    /// Drops expired entries, returning how many were removed.
    async fn purge_expired(&self) -> anyhow::Result<usize>;
}
