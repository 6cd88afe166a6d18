//! Built-in background tasks.

pub mod memory_watchdog;
pub mod metrics_publisher;
pub mod pool_maintenance;
pub mod stream_cleanup;

use std::time::Duration;

pub use memory_watchdog::MemoryWatchdog;
pub use metrics_publisher::MetricsPublisher;
pub use pool_maintenance::PoolMaintenance;
pub use stream_cleanup::StreamCleanup;

use crate::supervisor::{production_only, TaskSpec};

/// Cadences and thresholds for the built-in tasks.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub metrics_interval: Duration,
    pub stream_cleanup_interval: Duration,
    pub memory_watchdog_interval: Duration,
    /// Resident set size above which the watchdog warns.
    pub memory_warn_bytes: u64,
    pub pool_maintenance_interval: Duration,
    /// Upper bound of the random delay added to each task's first run, so
    /// replicas started together do not tick in lockstep.
    pub max_jitter: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            metrics_interval: Duration::from_secs(60),
            stream_cleanup_interval: Duration::from_secs(300),
            memory_watchdog_interval: Duration::from_secs(60),
            memory_warn_bytes: 1024 * 1024 * 1024,
            pool_maintenance_interval: Duration::from_secs(30),
            max_jitter: Duration::from_secs(5),
        }
    }
}

/// The built-in task set. The metrics publisher only runs in production and
/// the memory watchdog only where `/proc` exists.
#[must_use]
pub fn builtin_specs(config: &TaskConfig) -> Vec<TaskSpec> {
    vec![
        TaskSpec::new(MetricsPublisher::new(config.metrics_interval, config.max_jitter))
            .when(production_only),
        TaskSpec::new(StreamCleanup::new(
            config.stream_cleanup_interval,
            config.max_jitter,
        )),
        TaskSpec::new(MemoryWatchdog::new(
            config.memory_watchdog_interval,
            config.max_jitter,
            config.memory_warn_bytes,
        ))
        .when(|_| cfg!(target_os = "linux")),
        TaskSpec::new(PoolMaintenance::new(
            config.pool_maintenance_interval,
            config.max_jitter,
        )),
    ]
}
