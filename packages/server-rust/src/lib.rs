//! Keel Server: lifecycle orchestrator, background task supervisor and
//! request pipeline for an axum/tokio service.

pub mod error;
pub mod lifecycle;
pub mod network;
pub mod resources;
pub mod subsystem;
pub mod supervisor;
pub mod tasks;
pub mod telemetry;

pub use error::{LifecycleError, ResourceError};
pub use lifecycle::{
    LifecycleConfig, LifecycleController, Orchestrator, RunningService, ShutdownMode,
    ShutdownReport,
};
pub use network::{NetworkConfig, NetworkModule};
pub use subsystem::{ServiceContext, Subsystem, SubsystemRegistry};
pub use supervisor::{BackgroundTask, Cadence, TaskContext, TaskSpec};
