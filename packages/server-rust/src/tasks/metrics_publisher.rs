//! Periodic export of service counters as gauges.

use std::time::Duration;

use async_trait::async_trait;
use keel_core::ResourceState;
use metrics::gauge;
use tracing::info;

use crate::supervisor::{BackgroundTask, Cadence, TaskContext};

/// Publishes request, task and resource counters as gauges and one
/// structured log line per interval.
pub struct MetricsPublisher {
    cadence: Cadence,
}

impl MetricsPublisher {
    #[must_use]
    pub fn new(interval: Duration, max_jitter: Duration) -> Self {
        Self {
            cadence: Cadence::every(interval).with_jitter(max_jitter),
        }
    }
}

#[async_trait]
impl BackgroundTask for MetricsPublisher {
    fn name(&self) -> &'static str {
        "metrics-publisher"
    }

    fn cadence(&self) -> Cadence {
        self.cadence
    }

    #[allow(clippy::cast_precision_loss)]
    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let service = &ctx.service;
        let requests = service.requests.stats(service.lifecycle.in_flight_count());
        let uptime = service.uptime().as_secs();

        gauge!("keel_uptime_seconds").set(uptime as f64);
        gauge!("keel_http_in_flight").set(requests.in_flight as f64);

        let tasks = service.tasks.snapshots();
        for task in &tasks {
            gauge!("keel_task_run_count", "task" => task.name.clone()).set(task.run_count as f64);
            gauge!("keel_task_failure_count", "task" => task.name.clone())
                .set(task.failures as f64);
        }

        let resources = service.resources.snapshots();
        for resource in &resources {
            let ready = if resource.state == ResourceState::Ready { 1.0 } else { 0.0 };
            gauge!("keel_resource_ready", "resource" => resource.name.clone()).set(ready);
        }

        info!(
            instance_id = %service.instance_id(),
            uptime_secs = uptime,
            requests_total = requests.total,
            client_errors = requests.client_errors,
            server_errors = requests.server_errors,
            slow_requests = requests.slow,
            in_flight = requests.in_flight,
            tasks = tasks.len(),
            "service metrics"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::subsystem::context::testing::memory_context;

    #[tokio::test]
    async fn publishes_without_a_recorder_installed() {
        let ctx = TaskContext::new(memory_context().await, CancellationToken::new());
        let task = MetricsPublisher::new(Duration::from_secs(60), Duration::ZERO);
        task.run(&ctx).await.unwrap();
        assert_eq!(task.cadence().interval, Duration::from_secs(60));
    }
}
