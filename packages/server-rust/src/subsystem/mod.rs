//! Subsystem contract, ordered initializer and built-in subsystems.

pub mod builtin;
pub mod context;
pub mod registry;

use async_trait::async_trait;
use axum::Router;

pub use builtin::{register_builtins, CacheWarmup, DatabaseProbe};
pub use context::ServiceContext;
pub use registry::{InitReport, SubsystemRegistry, SubsystemShutdown, FORCED_HOOK_BUDGET};

/// A feature subsystem driven through startup and shutdown by the
/// orchestrator.
///
/// `initialize` must be idempotent: a crash-restart runs it again against
/// the same external state. Within one process it is called at most once.
#[async_trait]
pub trait Subsystem: Send + Sync + 'static {
    /// Unique name used in logs, metrics and the degraded list.
    fn name(&self) -> &'static str;

    async fn initialize(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// Handlers mounted under the API prefix. Empty by default.
    fn routes(&self) -> Router {
        Router::new()
    }

    /// Called in reverse registration order during shutdown, only for
    /// subsystems whose `initialize` succeeded.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
