//! Ordered subsystem registration with init and reverse-order shutdown.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use futures_util::future::BoxFuture;
use keel_core::{Criticality, DegradedSubsystem};
use parking_lot::RwLock;
use tokio::time::timeout_at;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{ServiceContext, Subsystem};
use crate::error::LifecycleError;
use crate::network::SYSTEM_PATHS;
use crate::supervisor::group::panic_message;

// ---------------------------------------------------------------------------
// InitReport
// ---------------------------------------------------------------------------

/// Outcome of a completed init sequence.
///
/// Only [`SubsystemRegistry::init_all`] can build one, and it only does so
/// when every `Required` entry succeeded. The supervisor takes it as proof
/// before spawning anything.
#[derive(Debug, Clone)]
pub struct InitReport {
    completed: Vec<&'static str>,
    degraded: Vec<DegradedSubsystem>,
}

impl InitReport {
    /// Names of subsystems that initialized, in order.
    #[must_use]
    pub fn completed(&self) -> &[&'static str] {
        &self.completed
    }

    /// Best-effort subsystems that failed.
    #[must_use]
    pub fn degraded(&self) -> &[DegradedSubsystem] {
        &self.degraded
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

/// Remaining budget for shutdown hooks once a forced shutdown arrives.
pub const FORCED_HOOK_BUDGET: Duration = Duration::from_millis(250);

/// Outcome of [`SubsystemRegistry::shutdown_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubsystemShutdown {
    /// Hooks that returned an error.
    pub failed: Vec<&'static str>,
    /// Hooks abandoned when the budget ran out.
    pub unfinished: Vec<&'static str>,
}

impl SubsystemShutdown {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.unfinished.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Closure-backed subsystem
// ---------------------------------------------------------------------------

type InitFn = Box<dyn Fn(ServiceContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct FnSubsystem {
    name: &'static str,
    init: InitFn,
}

#[async_trait]
impl Subsystem for FnSubsystem {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn initialize(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        (self.init)(ctx.clone()).await
    }
}

// ---------------------------------------------------------------------------
// SubsystemRegistry
// ---------------------------------------------------------------------------

struct Entry {
    subsystem: Arc<dyn Subsystem>,
    criticality: Criticality,
}

/// Ordered list of subsystem init entries.
///
/// Subsystems are initialized strictly in registration order and shut
/// down in reverse order. Only subsystems whose `initialize` succeeded get
/// a `shutdown` call.
pub struct SubsystemRegistry {
    entries: RwLock<Vec<Entry>>,
    initialized: RwLock<Vec<Arc<dyn Subsystem>>>,
    started: AtomicBool,
}

impl SubsystemRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            initialized: RwLock::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Appends a subsystem. Registration order is init order.
    pub fn register<T: Subsystem>(&self, subsystem: T, criticality: Criticality) {
        self.register_arc(Arc::new(subsystem), criticality);
    }

    pub fn register_arc(&self, subsystem: Arc<dyn Subsystem>, criticality: Criticality) {
        self.entries.write().push(Entry {
            subsystem,
            criticality,
        });
    }

    /// Registers an init step backed by a closure, for collaborators that
    /// only need a startup hook.
    pub fn register_fn<F, Fut>(&self, name: &'static str, criticality: Criticality, init: F)
    where
        F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let init: InitFn = Box::new(move |ctx| Box::pin(init(ctx)));
        self.register(FnSubsystem { name, init }, criticality);
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn Subsystem>> {
        self.entries
            .read()
            .iter()
            .find(|entry| entry.subsystem.name() == name)
            .map(|entry| Arc::clone(&entry.subsystem))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Runs every entry once, in order.
    ///
    /// A `BestEffort` failure is logged, recorded as degraded, and the
    /// sequence continues. A `Required` failure stops the sequence; no
    /// later entry runs.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::RequiredInit`] for the first failing
    /// required entry, or [`LifecycleError::AlreadyInitialized`] if called
    /// a second time.
    pub async fn init_all(&self, ctx: &ServiceContext) -> Result<InitReport, LifecycleError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(LifecycleError::AlreadyInitialized);
        }

        let entries: Vec<(Arc<dyn Subsystem>, Criticality)> = self
            .entries
            .read()
            .iter()
            .map(|entry| (Arc::clone(&entry.subsystem), entry.criticality))
            .collect();

        let mut report = InitReport {
            completed: Vec::with_capacity(entries.len()),
            degraded: Vec::new(),
        };

        for (subsystem, criticality) in entries {
            let name = subsystem.name();
            let started = Instant::now();
            let result = subsystem.initialize(ctx).await;
            let elapsed_ms = started.elapsed().as_millis();

            match (result, criticality) {
                (Ok(()), _) => {
                    info!(subsystem = name, elapsed_ms, "subsystem initialized");
                    report.completed.push(name);
                    self.initialized.write().push(subsystem);
                }
                (Err(e), Criticality::BestEffort) => {
                    let message = format!("{e:#}");
                    warn!(
                        subsystem = name,
                        elapsed_ms,
                        error = %message,
                        "best-effort subsystem failed, continuing degraded"
                    );
                    report.degraded.push(DegradedSubsystem {
                        name: name.to_string(),
                        error: message,
                    });
                }
                (Err(e), Criticality::Required) => {
                    error!(
                        subsystem = name,
                        elapsed_ms,
                        error = %format!("{e:#}"),
                        "required subsystem failed"
                    );
                    return Err(LifecycleError::RequiredInit {
                        subsystem: name,
                        source: e,
                    });
                }
            }
        }

        info!(
            completed = report.completed.len(),
            degraded = report.degraded.len(),
            "subsystem initialization finished"
        );
        Ok(report)
    }

    /// Shuts down every initialized subsystem in reverse order, each hook
    /// bounded by what is left of `budget`.
    ///
    /// Failures never stop the remaining hooks. A hook that outlives the
    /// budget is abandoned and reported as unfinished. Once `force` is
    /// cancelled the remaining budget shrinks to [`FORCED_HOOK_BUDGET`].
    pub async fn shutdown_all(
        &self,
        budget: Duration,
        force: &CancellationToken,
    ) -> SubsystemShutdown {
        let initialized: Vec<Arc<dyn Subsystem>> = self.initialized.write().drain(..).collect();
        let mut outcome = SubsystemShutdown::default();

        let forced_deadline = || tokio::time::Instant::now() + FORCED_HOOK_BUDGET;
        let mut forced = force.is_cancelled();
        let mut deadline = tokio::time::Instant::now() + budget;
        if forced {
            deadline = deadline.min(forced_deadline());
        }

        for subsystem in initialized.iter().rev() {
            let name = subsystem.name();
            let mut hook = subsystem.shutdown();
            let result = loop {
                tokio::select! {
                    result = timeout_at(deadline, &mut hook) => break result,
                    () = force.cancelled(), if !forced => {
                        forced = true;
                        deadline = deadline.min(forced_deadline());
                    }
                }
            };

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(subsystem = name, error = %format!("{e:#}"), "subsystem shutdown failed");
                    outcome.failed.push(name);
                }
                Err(_elapsed) => {
                    warn!(subsystem = name, forced, "subsystem shutdown hook did not finish in time");
                    outcome.unfinished.push(name);
                }
            }
        }
        outcome
    }

    /// Merges the handler sets of every registered subsystem.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::RouteConflict`] for the first subsystem
    /// whose routes overlap an earlier subsystem's or one of the
    /// [`SYSTEM_PATHS`].
    pub fn routes(&self) -> Result<Router, LifecycleError> {
        // Tracks every claimed path, system endpoints included.
        let mut claimed: Router = SYSTEM_PATHS
            .iter()
            .fold(Router::new(), |router, path| router.route(path, get(|| async {})));
        let mut merged = Router::new();

        for entry in self.entries.read().iter() {
            let subsystem = &entry.subsystem;
            let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
                let routes = subsystem.routes();
                (claimed.clone().merge(routes.clone()), routes)
            }));
            match attempt {
                Ok((next, routes)) => {
                    claimed = next;
                    merged = merged.merge(routes);
                }
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    error!(subsystem = subsystem.name(), reason = %reason, "subsystem routes conflict");
                    return Err(LifecycleError::RouteConflict {
                        subsystem: subsystem.name(),
                        reason,
                    });
                }
            }
        }
        Ok(merged)
    }
}

impl Default for SubsystemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
