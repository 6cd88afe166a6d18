//! The background task trait, its cadence and its spawn spec.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::subsystem::ServiceContext;

/// When a periodic task runs.
///
/// The first iteration happens after one `interval` (or immediately with
/// `run_at_start`), delayed by a random jitter in `[0, max_jitter]`. Later
/// iterations follow the interval; a tick missed because an iteration ran
/// long is delayed, never bursted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub interval: Duration,
    pub run_at_start: bool,
    pub max_jitter: Duration,
}

impl Cadence {
    #[must_use]
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            run_at_start: false,
            max_jitter: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn run_at_start(mut self) -> Self {
        self.run_at_start = true;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    pub(crate) fn first_delay(&self) -> Duration {
        let base = if self.run_at_start {
            Duration::ZERO
        } else {
            self.interval
        };
        if self.max_jitter.is_zero() {
            return base;
        }
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// A long-lived periodic job owned by the supervisor.
///
/// `run` is one iteration. Returning an error (or panicking) ends the
/// task: it is logged, counted and not restarted.
#[async_trait]
pub trait BackgroundTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn cadence(&self) -> Cadence;

    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<()>;
}

/// What an iteration sees: the shared service context plus its own
/// cancellation token.
#[derive(Clone)]
pub struct TaskContext {
    pub service: ServiceContext,
    cancel: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(service: ServiceContext, cancel: CancellationToken) -> Self {
        Self { service, cancel }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once shutdown cancels this task. Iterations with internal
    /// waits can select on it.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

type Condition = Box<dyn Fn(&ServiceContext) -> bool + Send + Sync>;

/// A task plus the predicate deciding whether it is spawned at all.
pub struct TaskSpec {
    task: Arc<dyn BackgroundTask>,
    condition: Option<Condition>,
}

impl TaskSpec {
    pub fn new<T: BackgroundTask>(task: T) -> Self {
        Self::from_arc(Arc::new(task))
    }

    pub fn from_arc(task: Arc<dyn BackgroundTask>) -> Self {
        Self {
            task,
            condition: None,
        }
    }

    /// Spawns the task only if `predicate` holds when the supervisor
    /// starts. Evaluated once.
    #[must_use]
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ServiceContext) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Box::new(predicate));
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.task.name()
    }

    pub(crate) fn should_run(&self, ctx: &ServiceContext) -> bool {
        self.condition.as_ref().map_or(true, |predicate| predicate(ctx))
    }

    pub(crate) fn into_task(self) -> Arc<dyn BackgroundTask> {
        self.task
    }
}

/// Predicate for tasks that only make sense in production.
#[must_use]
pub fn production_only(ctx: &ServiceContext) -> bool {
    ctx.mode().is_production()
}
