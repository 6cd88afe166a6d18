//! Resident memory sampling with a warning threshold.

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::supervisor::{BackgroundTask, Cadence, TaskContext};

const STATM_PATH: &str = "/proc/self/statm";
const PAGE_SIZE: u64 = 4096;

/// Samples the process resident set size and warns above a threshold.
pub struct MemoryWatchdog {
    cadence: Cadence,
    warn_bytes: u64,
}

impl MemoryWatchdog {
    #[must_use]
    pub fn new(interval: Duration, max_jitter: Duration, warn_bytes: u64) -> Self {
        Self {
            cadence: Cadence::every(interval).with_jitter(max_jitter),
            warn_bytes,
        }
    }
}

/// Resident pages (second field of `statm`) in bytes.
fn parse_statm(statm: &str) -> anyhow::Result<u64> {
    let pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .context("statm has no resident field")?
        .parse()
        .context("statm resident field is not a number")?;
    Ok(pages.saturating_mul(PAGE_SIZE))
}

/// Reads the current resident set size.
///
/// # Errors
///
/// Fails where `/proc/self/statm` is unavailable or malformed.
pub async fn resident_bytes() -> anyhow::Result<u64> {
    let statm = tokio::fs::read_to_string(STATM_PATH)
        .await
        .with_context(|| format!("reading {STATM_PATH}"))?;
    parse_statm(&statm)
}

#[async_trait]
impl BackgroundTask for MemoryWatchdog {
    fn name(&self) -> &'static str {
        "memory-watchdog"
    }

    fn cadence(&self) -> Cadence {
        self.cadence
    }

    #[allow(clippy::cast_precision_loss)]
    async fn run(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
        let rss = resident_bytes().await?;
        metrics::gauge!("keel_process_rss_bytes").set(rss as f64);

        if rss > self.warn_bytes {
            warn!(rss_bytes = rss, threshold_bytes = self.warn_bytes, "resident memory above threshold");
        } else {
            debug!(rss_bytes = rss, "memory sample");
        }
        Ok(())
    }
}
