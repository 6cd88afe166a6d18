//! Per-task counters and the shared table the metrics surfaces read.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use keel_core::{TaskSnapshot, TaskState};

use crate::resources::handle::epoch_millis;

/// Live counters for one supervised task.
///
/// Written by the task's own loop and by the supervisor; read by the
/// metrics endpoint and the metrics publisher without locking.
#[derive(Debug)]
pub struct TaskRecord {
    name: &'static str,
    interval: Duration,
    state: AtomicU8,
    run_count: AtomicU64,
    failures: AtomicU64,
    // 0 = never ran
    last_run_at_ms: AtomicU64,
}

impl TaskRecord {
    #[must_use]
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval,
            state: AtomicU8::new(TaskState::Idle.to_u8()),
            run_count: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_run_at_ms: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_run_at_ms(&self) -> Option<u64> {
        match self.last_run_at_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// `Idle -> Running`. No-op once the task reached a terminal state.
    pub(crate) fn mark_running(&self) {
        let _ = self.state.compare_exchange(
            TaskState::Idle.to_u8(),
            TaskState::Running.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Moves to a terminal state. The first terminal state wins; returns
    /// `false` if one was already set.
    pub(crate) fn finish(&self, terminal: TaskState) -> bool {
        debug_assert!(terminal.is_terminal());
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                if TaskState::from_u8(raw).is_terminal() {
                    None
                } else {
                    Some(terminal.to_u8())
                }
            })
            .is_ok()
    }

    pub(crate) fn record_run_start(&self) {
        self.run_count.fetch_add(1, Ordering::Relaxed);
        let now = epoch_millis(SystemTime::now()).unwrap_or(0);
        self.last_run_at_ms.store(now, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            name: self.name.to_string(),
            state: self.state(),
            run_count: self.run_count(),
            failures: self.failures(),
            last_run_at_ms: self.last_run_at_ms(),
            interval_ms: u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Shared name -> record table for every spawned task.
#[derive(Debug, Clone, Default)]
pub struct TaskTable {
    records: Arc<DashMap<&'static str, Arc<TaskRecord>>>,
}

impl TaskTable {
    /// Inserts a record unless the name is taken. Returns `false` on a
    /// duplicate.
    pub(crate) fn insert(&self, record: Arc<TaskRecord>) -> bool {
        match self.records.entry(record.name()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<TaskRecord>> {
        self.records.get(name).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshots sorted by task name.
    #[must_use]
    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<TaskSnapshot> = self
            .records
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
