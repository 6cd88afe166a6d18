//! Background task supervisor.
//!
//! Periodic tasks run as explicit state machines, each with its own cadence
//! and cancellation token. The supervisor tracks every spawned task and
//! stops them as a group within a budget.

pub mod group;
pub mod record;
pub mod task;

pub use group::{Supervisor, SupervisorReport};
pub use record::{TaskRecord, TaskTable};
pub use task::{production_only, BackgroundTask, Cadence, TaskContext, TaskSpec};
