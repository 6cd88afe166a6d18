//! Shared service context handed to subsystems, handlers and tasks.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use keel_core::{DegradedSubsystem, DeploymentMode, InstanceId, MetricsSnapshot};

use crate::lifecycle::{LifecycleConfig, LifecycleController};
use crate::network::middleware::RequestCounters;
use crate::resources::handle::epoch_millis;
use crate::resources::ResourceSet;
use crate::supervisor::TaskTable;

/// Everything a subsystem, handler or background task may depend on.
///
/// Cheap to clone: every field is shared by `Arc`. Holding a context does
/// not allow closing resources or moving the lifecycle phase; both stay
/// with the orchestrator.
///
/// Resource handles expose data operations only:
///
/// ```compile_fail
/// # async fn misuse(ctx: keel_server::subsystem::ServiceContext) {
/// ctx.resources.database().close().await;
/// # }
/// ```
///
/// and the lifecycle phase is read-only:
///
/// ```compile_fail
/// # fn misuse(ctx: keel_server::subsystem::ServiceContext) {
/// let _ = ctx.lifecycle.advance(keel_core::LifecyclePhase::Draining);
/// # }
/// ```
#[derive(Clone)]
pub struct ServiceContext {
    pub config: Arc<LifecycleConfig>,
    pub resources: Arc<ResourceSet>,
    pub lifecycle: Arc<LifecycleController>,
    pub requests: Arc<RequestCounters>,
    pub tasks: TaskTable,
    started_at: Instant,
    started_at_wall: SystemTime,
}

impl ServiceContext {
    #[must_use]
    pub fn new(
        config: Arc<LifecycleConfig>,
        resources: Arc<ResourceSet>,
        lifecycle: Arc<LifecycleController>,
        requests: Arc<RequestCounters>,
    ) -> Self {
        Self {
            config,
            resources,
            lifecycle,
            requests,
            tasks: TaskTable::default(),
            started_at: Instant::now(),
            started_at_wall: SystemTime::now(),
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        self.resources.instance_id()
    }

    #[must_use]
    pub fn mode(&self) -> DeploymentMode {
        self.config.mode
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Process start as milliseconds since the Unix epoch.
    #[must_use]
    pub fn started_at_ms(&self) -> Option<u64> {
        epoch_millis(self.started_at_wall)
    }

    /// Point-in-time view of the whole service for the metrics endpoint.
    #[must_use]
    pub fn metrics_snapshot(&self, degraded: &[DegradedSubsystem]) -> MetricsSnapshot {
        MetricsSnapshot {
            instance_id: self.instance_id().clone(),
            phase: self.lifecycle.phase(),
            uptime_secs: self.uptime().as_secs(),
            requests: self.requests.stats(self.lifecycle.in_flight_count()),
            tasks: self.tasks.snapshots(),
            resources: self.resources.snapshots(),
            degraded_subsystems: degraded.to_vec(),
        }
    }
}


#[cfg(test)]
mod tests {
    use keel_core::{LifecyclePhase, ResourceState};

    use super::testing::memory_context;
    use super::*;

    #[tokio::test]
    async fn snapshot_reflects_phase_resources_and_degraded() {
        let ctx = memory_context().await;
        ctx.lifecycle.advance(LifecyclePhase::Initializing).unwrap();

        let degraded = vec![DegradedSubsystem {
            name: "cache-warmup".to_string(),
            error: "timeout".to_string(),
        }];
        let snapshot = ctx.metrics_snapshot(&degraded);

        assert_eq!(&snapshot.instance_id, ctx.instance_id());
        assert_eq!(snapshot.phase, LifecyclePhase::Initializing);
        assert_eq!(snapshot.resources.len(), 2);
        assert!(snapshot
            .resources
            .iter()
            .all(|r| r.state == ResourceState::Ready));
        assert_eq!(snapshot.degraded_subsystems, degraded);
        assert!(snapshot.tasks.is_empty());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let ctx = memory_context().await;
        let clone = ctx.clone();
        assert!(Arc::ptr_eq(&ctx.lifecycle, &clone.lifecycle));
        assert_eq!(ctx.instance_id(), clone.instance_id());
        assert!(ctx.started_at_ms().is_some());
    }
}
