//! The JSON metrics endpoint.

use axum::extract::State;
use axum::Json;
use keel_core::MetricsSnapshot;

use super::AppState;

/// Read-only JSON snapshot of phase, request counters, tasks, resources
/// and degraded subsystems.
pub async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.ctx.metrics_snapshot(&state.degraded))
}
