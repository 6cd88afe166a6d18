//! Periodic database ping and pool statistics.

use std::time::Duration;

use async_trait::async_trait;
use metrics::gauge;
use tracing::{debug, warn};

use crate::supervisor::{BackgroundTask, Cadence, TaskContext};

/// Pings the database and records pool statistics.
///
/// A failed ping is logged and retried on the next tick; the pool
/// reconnects on its own.
pub struct PoolMaintenance {
    cadence: Cadence,
}

impl PoolMaintenance {
    #[must_use]
    pub fn new(interval: Duration, max_jitter: Duration) -> Self {
        Self {
            cadence: Cadence::every(interval).with_jitter(max_jitter),
        }
    }
}

#[async_trait]
impl BackgroundTask for PoolMaintenance {
    fn name(&self) -> &'static str {
        "pool-maintenance"
    }

    fn cadence(&self) -> Cadence {
        self.cadence
    }

    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let database = ctx.service.resources.database();

        if let Err(e) = database.ping().await {
            metrics::counter!("keel_database_ping_failures_total").increment(1);
            warn!(error = %format!("{e:#}"), "database ping failed");
        }

        let pool = database.pool_stats();
        gauge!("keel_db_pool_size").set(f64::from(pool.size));
        gauge!("keel_db_pool_idle").set(f64::from(pool.idle));
        gauge!("keel_db_pool_max").set(f64::from(pool.max));
        debug!(size = pool.size, idle = pool.idle, max = pool.max, "pool stats");
        Ok(())
    }
}
