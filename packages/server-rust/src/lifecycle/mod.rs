//! Process lifecycle: phase controller, configuration, orchestration and
//! signal handling.

pub mod config;
pub mod controller;
pub mod orchestrator;
pub mod signals;

pub use config::LifecycleConfig;
pub use controller::{InFlightGuard, LifecycleController};
pub use orchestrator::{Orchestrator, RunningService, ShutdownMode, ShutdownReport};
pub use signals::signal_stream;
