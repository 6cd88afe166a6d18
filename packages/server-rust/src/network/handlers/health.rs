//! Health, liveness, and readiness endpoint handlers.
//!
//! These handlers expose service health for orchestrators (Kubernetes,
//! load balancers) and operational monitoring.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use keel_core::LifecyclePhase;
use serde_json::json;

use super::AppState;

/// Reports whether the service is serving traffic.
///
/// 200 with `{"status":"ok"}` while Running. Any other phase, including
/// Initializing and Draining, answers 503 with the phase name as status so
/// load balancers stop routing before the drain completes.
pub async fn health_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    let phase = state.ctx.lifecycle.phase();
    let instance_id = state.ctx.instance_id().as_str();

    if phase == LifecyclePhase::Running {
        (
            StatusCode::OK,
            Json(json!({ "status": "ok", "instance_id": instance_id })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": phase.as_str(), "instance_id": instance_id })),
        )
    }
}

/// Kubernetes liveness probe -- always returns 200 OK.
///
/// The liveness probe only checks whether the process is running and
/// responsive. It does not look at the lifecycle phase, because a failed
/// liveness probe triggers a pod restart.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe -- returns 200 when Running, 503 otherwise.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.ctx.lifecycle.is_running() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
