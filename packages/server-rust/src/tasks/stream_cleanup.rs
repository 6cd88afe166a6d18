//! Periodic purge of expired cache entries.

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::supervisor::{BackgroundTask, Cadence, TaskContext};

/// Purges expired stream entries from the cache.
pub struct StreamCleanup {
    cadence: Cadence,
}

impl StreamCleanup {
    #[must_use]
    pub fn new(interval: Duration, max_jitter: Duration) -> Self {
        Self {
            cadence: Cadence::every(interval).with_jitter(max_jitter),
        }
    }
}

#[async_trait]
impl BackgroundTask for StreamCleanup {
    fn name(&self) -> &'static str {
        "stream-cleanup"
    }

    fn cadence(&self) -> Cadence {
        self.cadence
    }

    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let removed = ctx
            .service
            .resources
            .cache()
            .purge_expired()
            .await
            .context("cache purge failed")?;

        metrics::counter!("keel_cache_purged_total").increment(removed as u64);
        if removed > 0 {
            info!(removed, "expired cache entries purged");
        } else {
            debug!("no expired cache entries");
        }
        Ok(())
    }
}
