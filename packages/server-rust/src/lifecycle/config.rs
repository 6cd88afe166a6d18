//! Lifecycle configuration, read once at startup.

use std::time::Duration;

use keel_core::{DeploymentMode, InstanceId};

use crate::error::LifecycleError;
use crate::tasks::TaskConfig;

/// Orchestrator configuration: resource URLs, identity and shutdown
/// budgets.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub mode: DeploymentMode,
    /// Operator-supplied instance id. A blank value falls back to a
    /// generated one.
    pub instance_id: Option<String>,
    /// `memory://` or, with the `postgres` feature, `postgres://...`.
    pub database_url: String,
    pub db_max_connections: u32,
    /// `memory://` (in-process cache).
    pub cache_url: String,
    pub cache_capacity: usize,
    /// How long Draining holds for in-flight requests.
    pub drain_grace: Duration,
    /// Upper bound for cancelling background tasks.
    pub task_budget: Duration,
    /// Upper bound for the whole shutdown sequence.
    pub shutdown_budget: Duration,
    /// Per-resource connect and close timeout.
    pub resource_timeout: Duration,
    pub tasks: TaskConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::default(),
            instance_id: None,
            database_url: "memory://".to_string(),
            db_max_connections: 10,
            cache_url: "memory://".to_string(),
            cache_capacity: 10_000,
            drain_grace: Duration::from_secs(2),
            task_budget: Duration::from_secs(5),
            shutdown_budget: Duration::from_secs(10),
            resource_timeout: Duration::from_secs(2),
            tasks: TaskConfig::default(),
        }
    }
}

impl LifecycleConfig {
    /// The override when set and non-blank, otherwise a fresh identity.
    #[must_use]
    pub fn resolve_instance_id(&self) -> InstanceId {
        self.instance_id
            .as_deref()
            .and_then(InstanceId::from_override)
            .unwrap_or_else(InstanceId::generate)
    }

    /// # Errors
    ///
    /// Returns [`LifecycleError::Config`] when a budget is zero or the
    /// task budget exceeds the overall shutdown budget.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.shutdown_budget.is_zero() {
            return Err(LifecycleError::Config(
                "shutdown budget must be greater than zero".to_string(),
            ));
        }
        if self.task_budget.is_zero() {
            return Err(LifecycleError::Config(
                "task budget must be greater than zero".to_string(),
            ));
        }
        if self.task_budget > self.shutdown_budget {
            return Err(LifecycleError::Config(format!(
                "task budget {:?} exceeds shutdown budget {:?}",
                self.task_budget, self.shutdown_budget
            )));
        }
        if self.cache_capacity == 0 {
            return Err(LifecycleError::Config(
                "cache capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
