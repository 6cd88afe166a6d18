//! Lifecycle state machines shared by the orchestrator, the supervisor and
//! the HTTP handlers.
//!
//! Every machine here is monotonic: states carry an ordinal and a transition
//! is legal only when it moves strictly forward. Skipping ahead is allowed
//! (a fatal startup error goes straight from `Initializing` to `Stopped`),
//! going back or re-entering a state is not.

use serde::{Deserialize, Serialize};

/// Top-level phase of the service process.
///
/// `Starting -> Initializing -> Running -> Draining -> ShuttingDown -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    /// Configuration read, nothing acquired yet.
    Starting,
    /// Resources acquired, subsystems being initialized.
    Initializing,
    /// Serving traffic with background tasks running.
    Running,
    /// Termination requested, in-flight work finishing.
    Draining,
    /// Background tasks being cancelled, resources being released.
    ShuttingDown,
    /// Terminal.
    Stopped,
}

impl LifecyclePhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }

    /// Returns `true` if moving from `self` to `next` keeps the machine
    /// monotonic.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        next > self
    }

    /// Returns `true` once shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(self) -> bool {
        self >= Self::Draining
    }
}

/// Process-wide shutdown flag read by in-flight handlers and background
/// tasks to decide whether to accept new long-running work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownState {
    Running,
    Draining,
    Terminated,
}

impl ShutdownState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        }
    }

    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        next > self
    }

    /// Whether new long-running work may still be started.
    #[must_use]
    pub fn accepts_work(self) -> bool {
        self == Self::Running
    }
}

/// Connection state of a single external resource handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Uninitialized,
    Ready,
    Closed,
}

impl ResourceState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Closed => "closed",
        }
    }

    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        next > self
    }
}

/// State of a supervised background task.
///
/// `Idle -> Running -> Cancelled`, with `Failed` and `Abandoned` as the
/// other terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Registered and spawned, waiting for its first tick.
    Idle,
    /// Loop active (between or inside iterations).
    Running,
    /// Observed its cancel token and exited cleanly.
    Cancelled,
    /// An iteration returned an error or panicked; the task ended.
    Failed,
    /// Did not honor cancellation within the shutdown budget and was
    /// aborted.
    Abandoned,
}

impl TaskState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Abandoned)
    }

    /// Compact encoding for storage in an atomic.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Running => 1,
            Self::Cancelled => 2,
            Self::Failed => 3,
            Self::Abandoned => 4,
        }
    }

    /// Inverse of [`TaskState::to_u8`]. Unknown values decode as `Failed`.
    #[must_use]
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Cancelled,
            4 => Self::Abandoned,
            _ => Self::Failed,
        }
    }
}
