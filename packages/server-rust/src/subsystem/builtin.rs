//! Subsystems every deployment runs before feature subsystems.

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::Bytes;
use keel_core::Criticality;
use tracing::debug;

use super::{ServiceContext, Subsystem, SubsystemRegistry};

/// Cache key holding the static runtime configuration of an instance.
#[must_use]
pub fn runtime_config_key(ctx: &ServiceContext) -> String {
    format!("keel:runtime:{}", ctx.instance_id())
}

/// Registers the built-in subsystems, both best-effort.
pub fn register_builtins(registry: &SubsystemRegistry) {
    registry.register(DatabaseProbe, Criticality::BestEffort);
    registry.register(CacheWarmup::default(), Criticality::BestEffort);
}

/// Issues a connectivity probe against the database pool.
pub struct DatabaseProbe;

#[async_trait]
impl Subsystem for DatabaseProbe {
    fn name(&self) -> &'static str {
        "database-probe"
    }

    async fn initialize(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let database = ctx.resources.database();
        database.ping().await.context("database probe failed")?;
        let pool = database.pool_stats();
        debug!(size = pool.size, idle = pool.idle, max = pool.max, "database probe ok");
        Ok(())
    }
}

/// Writes the instance's static runtime configuration into the cache.
#[derive(Default)]
pub struct CacheWarmup {
    ttl: Option<Duration>,
}

impl CacheWarmup {
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

#[async_trait]
impl Subsystem for CacheWarmup {
    fn name(&self) -> &'static str {
        "cache-warmup"
    }

    async fn initialize(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let payload = serde_json::json!({
            "instance_id": ctx.instance_id(),
            "mode": ctx.mode().as_str(),
            "started_at_ms": ctx.started_at_ms(),
            "version": env!("CARGO_PKG_VERSION"),
        });
        let value = Bytes::from(serde_json::to_vec(&payload)?);
        ctx.resources
            .cache()
            .set(&runtime_config_key(ctx), value, self.ttl)
            .await
            .context("cache warmup write failed")
    }
}
