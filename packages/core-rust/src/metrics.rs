//! Serializable read-only views served by the metrics endpoint.

use serde::{Deserialize, Serialize};

use crate::instance::InstanceId;
use crate::lifecycle::{LifecyclePhase, ResourceState, TaskState};

/// Aggregated request counters since process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStats {
    pub total: u64,
    /// Responses with status 400-499.
    pub client_errors: u64,
    /// Responses with status >= 500.
    pub server_errors: u64,
    /// Successful responses slower than the slow-request threshold.
    pub slow: u64,
    /// Requests where the inner service returned an error instead of a
    /// response.
    pub failed: u64,
    pub in_flight: u64,
}

/// Point-in-time view of one supervised background task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub name: String,
    pub state: TaskState,
    pub run_count: u64,
    pub failures: u64,
    /// Unix epoch millis of the last iteration start.
    pub last_run_at_ms: Option<u64>,
    pub interval_ms: u64,
}

/// Point-in-time view of one resource handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub name: String,
    pub state: ResourceState,
    /// Unix epoch millis of acquisition.
    pub acquired_at_ms: Option<u64>,
    /// Backend-specific statistics (pool sizes, entry counts).
    pub stats: serde_json::Value,
}

/// A best-effort subsystem that failed to initialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedSubsystem {
    pub name: String,
    pub error: String,
}

/// Everything `GET /metrics` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub instance_id: InstanceId,
    pub phase: LifecyclePhase,
    pub uptime_secs: u64,
    pub requests: RequestStats,
    pub tasks: Vec<TaskSnapshot>,
    pub resources: Vec<ResourceSnapshot>,
    pub degraded_subsystems: Vec<DegradedSubsystem>,
}
