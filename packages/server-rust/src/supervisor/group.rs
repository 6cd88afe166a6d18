//! Task group ownership: spawning, the per-task loop and group shutdown.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use keel_core::TaskState;
use tokio::task::{Id, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::record::{TaskRecord, TaskTable};
use super::task::{BackgroundTask, TaskContext, TaskSpec};
use crate::subsystem::{InitReport, ServiceContext};

/// How long a forced shutdown waits for cancelled tasks to exit.
pub const FORCED_TASK_GRACE: Duration = Duration::from_millis(250);

/// Outcome of [`Supervisor::shutdown`], by task name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub cancelled: Vec<&'static str>,
    pub failed: Vec<&'static str>,
    pub abandoned: Vec<&'static str>,
    pub skipped: Vec<&'static str>,
}

/// Owns every background task of the process.
///
/// Each spawned task gets a child of one root cancellation token and is
/// tracked in a `JoinSet`; nothing is spawned fire-and-forget. Admission
/// and cancellation are separate: closing admission stops new iterations
/// while letting a running one finish, cancellation interrupts it.
pub struct Supervisor {
    table: TaskTable,
    root: CancellationToken,
    admission: CancellationToken,
    set: JoinSet<()>,
    names: HashMap<Id, &'static str>,
    spawned: Vec<&'static str>,
    skipped: Vec<&'static str>,
}

impl Supervisor {
    /// Spawns every task whose condition holds.
    ///
    /// Takes the [`InitReport`] so tasks cannot start before every
    /// required subsystem initialized. Must be called from within a Tokio
    /// runtime.
    pub fn start(specs: Vec<TaskSpec>, ctx: &ServiceContext, init: &InitReport) -> Self {
        let mut supervisor = Self {
            table: ctx.tasks.clone(),
            root: CancellationToken::new(),
            admission: CancellationToken::new(),
            set: JoinSet::new(),
            names: HashMap::new(),
            spawned: Vec::new(),
            skipped: Vec::new(),
        };

        for spec in specs {
            let name = spec.name();
            if !spec.should_run(ctx) {
                info!(task = name, "task condition not met, skipping");
                supervisor.skipped.push(name);
                continue;
            }
            supervisor.spawn(spec.into_task(), ctx);
        }

        info!(
            spawned = supervisor.spawned.len(),
            skipped = supervisor.skipped.len(),
            degraded_subsystems = init.degraded().len(),
            "background tasks started"
        );
        supervisor
    }

    fn spawn(&mut self, task: Arc<dyn BackgroundTask>, ctx: &ServiceContext) {
        let name = task.name();
        let record = Arc::new(TaskRecord::new(name, task.cadence().interval));
        if !self.table.insert(Arc::clone(&record)) {
            warn!(task = name, "duplicate task name, not spawning");
            return;
        }

        let task_ctx = TaskContext::new(ctx.clone(), self.root.child_token());
        let handle = self
            .set
            .spawn(drive(task, record, task_ctx, self.admission.clone()));
        self.names.insert(handle.id(), name);
        self.spawned.push(name);
    }

    #[must_use]
    pub fn table(&self) -> &TaskTable {
        &self.table
    }

    #[must_use]
    pub fn spawned(&self) -> &[&'static str] {
        &self.spawned
    }

    #[must_use]
    pub fn skipped(&self) -> &[&'static str] {
        &self.skipped
    }

    /// Stops new iterations from starting. Iterations already running
    /// continue until cancelled.
    pub fn close_admission(&self) {
        if !self.admission.is_cancelled() {
            debug!("task admission closed");
            self.admission.cancel();
        }
    }

    /// Cancels every task and waits for them, up to `budget`.
    ///
    /// Tasks still running at the deadline are aborted and reported as
    /// abandoned.
    pub async fn shutdown(self, budget: Duration) -> SupervisorReport {
        self.shutdown_or_force(budget, &CancellationToken::new()).await
    }

    /// Like [`shutdown`](Self::shutdown), but once `force` is cancelled the
    /// wait shrinks to [`FORCED_TASK_GRACE`]; stragglers are then aborted
    /// and reported as abandoned.
    pub async fn shutdown_or_force(
        mut self,
        budget: Duration,
        force: &CancellationToken,
    ) -> SupervisorReport {
        self.close_admission();
        self.root.cancel();

        let forced_deadline = || tokio::time::Instant::now() + FORCED_TASK_GRACE;
        let mut forced = force.is_cancelled();
        let mut deadline = tokio::time::Instant::now() + budget;
        if forced {
            deadline = deadline.min(forced_deadline());
        }

        loop {
            let joined = tokio::select! {
                joined = tokio::time::timeout_at(deadline, self.set.join_next_with_id()) => joined,
                () = force.cancelled(), if !forced => {
                    debug!("forced shutdown, shortening task wait");
                    forced = true;
                    deadline = deadline.min(forced_deadline());
                    continue;
                }
            };
            match joined {
                Ok(None) => break,
                Ok(Some(Ok((id, ())))) => {
                    self.names.remove(&id);
                }
                Ok(Some(Err(join_error))) => {
                    if let Some(name) = self.names.remove(&join_error.id()) {
                        if let Some(record) = self.table.get(name) {
                            record.finish(TaskState::Failed);
                        }
                        error!(task = name, error = %join_error, "task exited abnormally");
                    }
                }
                Err(_elapsed) => {
                    self.abandon_remaining(forced);
                    break;
                }
            }
        }

        let mut report = SupervisorReport {
            skipped: std::mem::take(&mut self.skipped),
            ..SupervisorReport::default()
        };
        for &name in &self.spawned {
            match self.table.get(name).map(|record| record.state()) {
                Some(TaskState::Failed) => report.failed.push(name),
                Some(TaskState::Abandoned) => report.abandoned.push(name),
                _ => report.cancelled.push(name),
            }
        }

        info!(
            cancelled = report.cancelled.len(),
            failed = report.failed.len(),
            abandoned = report.abandoned.len(),
            "background tasks stopped"
        );
        report
    }

    fn abandon_remaining(&mut self, forced: bool) {
        for name in self.names.values() {
            if let Some(record) = self.table.get(name) {
                if record.finish(TaskState::Abandoned) {
                    if forced {
                        warn!(task = name, "forced shutdown, abandoning task");
                    } else {
                        warn!(task = name, "task ignored cancellation, abandoning");
                    }
                }
            }
        }
        self.set.abort_all();
    }
}

/// One task's loop: `Idle -> Running -> Cancelled | Failed`.
async fn drive(
    task: Arc<dyn BackgroundTask>,
    record: Arc<TaskRecord>,
    ctx: TaskContext,
    admission: CancellationToken,
) {
    let name = task.name();
    let cadence = task.cadence();
    let span = info_span!("task", task = name);

    async move {
        let start = tokio::time::Instant::now() + cadence.first_delay();
        // interval_at panics on a zero period
        let period = cadence.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        record.mark_running();
        debug!(interval_ms = cadence.interval.as_millis(), "task running");

        loop {
            tokio::select! {
                biased;
                () = ctx.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if ctx.is_cancelled() {
                break;
            }
            if admission.is_cancelled() {
                ctx.cancelled().await;
                break;
            }

            record.record_run_start();
            let outcome = tokio::select! {
                biased;
                () = ctx.cancelled() => None,
                result = AssertUnwindSafe(task.run(&ctx)).catch_unwind() => Some(result),
            };

            match outcome {
                None => break,
                Some(Ok(Ok(()))) => {
                    metrics::counter!("keel_task_runs_total", "task" => name).increment(1);
                }
                Some(Ok(Err(e))) => {
                    record.record_failure();
                    metrics::counter!("keel_task_failures_total", "task" => name).increment(1);
                    error!(error = %format!("{e:#}"), "task iteration failed, stopping task");
                    record.finish(TaskState::Failed);
                    return;
                }
                Some(Err(panic)) => {
                    record.record_failure();
                    metrics::counter!("keel_task_failures_total", "task" => name).increment(1);
                    error!(panic = %panic_message(&*panic), "task iteration panicked, stopping task");
                    record.finish(TaskState::Failed);
                    return;
                }
            }
        }

        record.finish(TaskState::Cancelled);
        debug!(runs = record.run_count(), "task cancelled");
    }
    .instrument(span)
    .await;
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
