//! Database pool backends.
//!
//! `memory://` selects an in-process stand-in used for development and
//! tests. `postgres://` selects a `sqlx` pool when the `postgres` feature is
//! enabled.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{redact, Database, PoolStats, Resource};
use crate::error::ResourceError;

const KIND: &str = "database";

const DISCONNECTED: u8 = 0;
const CONNECTED: u8 = 1;
const CLOSED: u8 = 2;

/// Builds a database backend from a connection URL.
///
/// # Errors
///
/// Returns [`ResourceError::UnsupportedScheme`] for schemes this build
/// cannot serve (including `postgres://` without the `postgres` feature).
#[cfg_attr(not(feature = "postgres"), allow(unused_variables))]
pub fn database_from_url(url: &str, max_connections: u32) -> Result<Arc<dyn Database>, ResourceError> {
    let scheme = url.split_once("://").map_or("", |(scheme, _)| scheme);
    match scheme {
        "memory" => Ok(Arc::new(MemoryDatabase::new())),
        #[cfg(feature = "postgres")]
        "postgres" | "postgresql" => Ok(Arc::new(PostgresDatabase::new(url, max_connections))),
        _ => Err(ResourceError::UnsupportedScheme {
            kind: KIND,
            url: redact(url),
        }),
    }
}

/// In-process database stand-in with no storage behind it.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    state: AtomicU8,
}

impl MemoryDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Resource for MemoryDatabase {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.state.store(CONNECTED, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        if self.state.load(Ordering::SeqCst) == CONNECTED {
            Ok(())
        } else {
            Err(ResourceError::NotConnected { kind: KIND }.into())
        }
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.state.store(CLOSED, Ordering::SeqCst);
        Ok(())
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::json!({ "backend": "memory", "pool": self.pool_stats() })
    }
}

impl Database for MemoryDatabase {
    fn pool_stats(&self) -> PoolStats {
        let open = u32::from(self.state.load(Ordering::SeqCst) == CONNECTED);
        PoolStats {
            size: open,
            idle: open,
            max: 1,
        }
    }
}

#[cfg(feature = "postgres")]
pub use postgres::PostgresDatabase;

#[cfg(feature = "postgres")]
mod postgres {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::RwLock;
    use sqlx::postgres::{PgPool, PgPoolOptions};

    use super::{redact, Database, PoolStats, Resource, ResourceError, KIND};

    /// `PostgreSQL` pool backed by `sqlx`.
    pub struct PostgresDatabase {
        url: String,
        max_connections: u32,
        pool: RwLock<Option<PgPool>>,
    }

    impl PostgresDatabase {
        #[must_use]
        pub fn new(url: &str, max_connections: u32) -> Self {
            Self {
                url: url.to_string(),
                max_connections,
                pool: RwLock::new(None),
            }
        }

        fn pool(&self) -> Result<PgPool, ResourceError> {
            self.pool
                .read()
                .clone()
                .ok_or(ResourceError::NotConnected { kind: KIND })
        }
    }

    #[async_trait]
    impl Resource for PostgresDatabase {
        fn kind(&self) -> &'static str {
            KIND
        }

        async fn connect(&self) -> anyhow::Result<()> {
            let pool = PgPoolOptions::new()
                .max_connections(self.max_connections)
                .acquire_timeout(Duration::from_secs(5))
                .connect(&self.url)
                .await?;
            tracing::info!(url = %redact(&self.url), "postgres pool connected");
            *self.pool.write() = Some(pool);
            Ok(())
        }

        async fn ping(&self) -> anyhow::Result<()> {
            let pool = self.pool()?;
            sqlx::query("SELECT 1").execute(&pool).await?;
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            let pool = self.pool.write().take();
            if let Some(pool) = pool {
                pool.close().await;
            }
            Ok(())
        }

        fn stats(&self) -> serde_json::Value {
            serde_json::json!({ "backend": "postgres", "pool": self.pool_stats() })
        }
    }

    impl Database for PostgresDatabase {
        fn pool_stats(&self) -> PoolStats {
            match self.pool.read().as_ref() {
                Some(pool) => PoolStats {
                    size: pool.size(),
                    idle: u32::try_from(pool.num_idle()).unwrap_or(u32::MAX),
                    max: self.max_connections,
                },
                None => PoolStats {
                    max: self.max_connections,
                    ..PoolStats::default()
                },
            }
        }
    }
}
