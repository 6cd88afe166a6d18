//! System endpoint handlers.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports the handler functions used to build the
//! system router.

pub mod health;
pub mod metrics;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use metrics::metrics_handler;

use std::sync::Arc;

use keel_core::DegradedSubsystem;

use crate::subsystem::ServiceContext;

/// Shared application state passed to the system handlers via `State`
/// extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub ctx: ServiceContext,
    /// BestEffort subsystems that failed during initialization.
    pub degraded: Arc<Vec<DegradedSubsystem>>,
}

impl AppState {
    #[must_use]
    pub fn new(ctx: ServiceContext, degraded: Vec<DegradedSubsystem>) -> Self {
        Self {
            ctx,
            degraded: Arc::new(degraded),
        }
    }
}
