//! Startup and shutdown sequencing.
//!
//! [`Orchestrator::start`] walks `Starting -> Initializing -> Running`:
//! resources, then subsystems, then background tasks. The returned
//! [`RunningService`] walks the rest in [`RunningService::shutdown`]:
//! drain requests, stop the listener, cancel tasks, run subsystem shutdown
//! hooks, release resources in reverse order.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures_util::{Stream, StreamExt};
use keel_core::{Criticality, LifecyclePhase};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::config::LifecycleConfig;
use super::controller::LifecycleController;
use crate::error::LifecycleError;
use crate::network::middleware::RequestCounters;
use crate::network::{build_app, AppState, HttpApp, NetworkConfig, NetworkModule};
use crate::resources::{cache_from_url, database_from_url, Cache, Database, ResourceSet};
use crate::subsystem::{
    register_builtins, InitReport, ServiceContext, Subsystem, SubsystemRegistry,
};
use crate::supervisor::{Supervisor, SupervisorReport, TaskSpec};
use crate::tasks::builtin_specs;

/// Lower bound for any single shutdown phase once the overall budget is
/// spent, so late phases still get a chance to run.
const MIN_PHASE_BUDGET: Duration = Duration::from_millis(250);

/// How shutdown treats in-flight requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Hold in Draining for the grace period or until no request is in
    /// flight.
    Graceful,
    /// Skip the grace period. Tasks, subsystems and resources are still
    /// stopped in order.
    Immediate,
}

impl ShutdownMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Graceful => "graceful",
            Self::Immediate => "immediate",
        }
    }
}

/// What happened during shutdown. Logged by the binary.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// `Immediate` if the shutdown was forced at any point.
    pub mode: ShutdownMode,
    /// Phase reached; `Stopped` unless a transition was rejected.
    pub phase: LifecyclePhase,
    /// Whether in-flight requests reached zero before the listener stopped.
    pub drained: bool,
    pub tasks: SupervisorReport,
    pub subsystem_failures: Vec<&'static str>,
    /// Shutdown hooks abandoned when their budget ran out.
    pub unfinished_subsystems: Vec<&'static str>,
    pub resource_failures: Vec<String>,
    /// Set when the HTTP server ended with an error.
    pub server_error: Option<String>,
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// No task was abandoned and every hook, close and the server ended
    /// cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.phase == LifecyclePhase::Stopped
            && self.tasks.abandoned.is_empty()
            && self.subsystem_failures.is_empty()
            && self.unfinished_subsystems.is_empty()
            && self.resource_failures.is_empty()
            && self.server_error.is_none()
    }

    fn log(&self) {
        let elapsed_ms = u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX);
        if self.is_clean() {
            info!(
                mode = self.mode.as_str(),
                drained = self.drained,
                cancelled = self.tasks.cancelled.len(),
                failed_tasks = self.tasks.failed.len(),
                elapsed_ms,
                "shutdown complete"
            );
        } else {
            warn!(
                mode = self.mode.as_str(),
                phase = self.phase.as_str(),
                drained = self.drained,
                abandoned = ?self.tasks.abandoned,
                subsystem_failures = ?self.subsystem_failures,
                unfinished_subsystems = ?self.unfinished_subsystems,
                resource_failures = ?self.resource_failures,
                server_error = ?self.server_error,
                elapsed_ms,
                "shutdown finished with errors"
            );
        }
    }
}

/// Builds the service and drives it through its lifecycle.
///
/// Register subsystems and tasks, then call [`start`](Self::start) (or
/// [`run`](Self::run) to also serve HTTP and wait for signals).
pub struct Orchestrator {
    config: Arc<LifecycleConfig>,
    controller: Arc<LifecycleController>,
    requests: Arc<RequestCounters>,
    registry: Arc<SubsystemRegistry>,
    specs: Vec<TaskSpec>,
    database: Option<Arc<dyn Database>>,
    cache: Option<Arc<dyn Cache>>,
}

impl Orchestrator {
    /// An orchestrator with no subsystems and no tasks.
    #[must_use]
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            config: Arc::new(config),
            controller: Arc::new(LifecycleController::new()),
            requests: Arc::new(RequestCounters::default()),
            registry: Arc::new(SubsystemRegistry::new()),
            specs: Vec::new(),
            database: None,
            cache: None,
        }
    }

    /// An orchestrator with the built-in subsystems and background tasks.
    #[must_use]
    pub fn from_config(config: LifecycleConfig) -> Self {
        let mut orchestrator = Self::new(config);
        register_builtins(&orchestrator.registry);
        orchestrator.specs = builtin_specs(&orchestrator.config.tasks);
        orchestrator
    }

    /// Uses the given backends instead of the configured URLs.
    #[must_use]
    pub fn with_resources(mut self, database: Arc<dyn Database>, cache: Arc<dyn Cache>) -> Self {
        self.database = Some(database);
        self.cache = Some(cache);
        self
    }

    /// Appends a subsystem; initialization follows registration order.
    pub fn register_subsystem<T: Subsystem>(&self, subsystem: T, criticality: Criticality) {
        self.registry.register(subsystem, criticality);
    }

    #[must_use]
    pub fn registry(&self) -> &SubsystemRegistry {
        &self.registry
    }

    pub fn add_task(&mut self, spec: TaskSpec) {
        self.specs.push(spec);
    }

    #[must_use]
    pub fn controller(&self) -> Arc<LifecycleController> {
        Arc::clone(&self.controller)
    }

    /// Acquires resources, initializes subsystems and starts background
    /// tasks, leaving the service in `Running`.
    ///
    /// On failure everything acquired so far is released and the phase
    /// moves to `Stopped`.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`LifecycleError`]: invalid configuration,
    /// resource acquisition failure, a required subsystem failure or
    /// overlapping subsystem routes.
    pub async fn start(self) -> Result<RunningService, LifecycleError> {
        let Self {
            config,
            controller,
            requests,
            registry,
            specs,
            database,
            cache,
        } = self;

        if let Err(e) = config.validate() {
            mark_stopped(&controller);
            return Err(e);
        }

        let instance_id = config.resolve_instance_id();
        info!(instance_id = %instance_id, mode = %config.mode, "starting");

        let resources = match acquire_resources(&config, instance_id, database, cache).await {
            Ok(resources) => Arc::new(resources),
            Err(e) => {
                error!(error = %e, "startup aborted");
                mark_stopped(&controller);
                return Err(e);
            }
        };

        let ctx = ServiceContext::new(
            Arc::clone(&config),
            resources,
            Arc::clone(&controller),
            requests,
        );

        if let Err(e) = controller.advance(LifecyclePhase::Initializing) {
            abort_startup(&ctx, &registry).await;
            return Err(e);
        }

        let init = match registry.init_all(&ctx).await {
            Ok(init) => init,
            Err(e) => {
                error!(error = %e, "startup aborted");
                abort_startup(&ctx, &registry).await;
                return Err(e);
            }
        };

        let routes = match registry.routes() {
            Ok(routes) => routes,
            Err(e) => {
                error!(error = %e, "startup aborted");
                abort_startup(&ctx, &registry).await;
                return Err(e);
            }
        };

        let supervisor = Supervisor::start(specs, &ctx, &init);

        if let Err(e) = controller.advance(LifecyclePhase::Running) {
            supervisor.shutdown(config.task_budget).await;
            abort_startup(&ctx, &registry).await;
            return Err(e);
        }

        info!(
            instance_id = %ctx.instance_id(),
            subsystems = init.completed().len(),
            degraded = init.degraded().len(),
            tasks = supervisor.spawned().len(),
            "service running"
        );

        Ok(RunningService {
            ctx,
            registry,
            routes,
            supervisor,
            init,
            force: CancellationToken::new(),
            http_stop: CancellationToken::new(),
            server: None,
        })
    }

    /// Binds the listener, starts the service, serves HTTP and shuts down
    /// on the first item of `signals`. A second item escalates to an
    /// immediate shutdown.
    ///
    /// # Errors
    ///
    /// Returns startup errors ([`LifecycleError::Bind`] included). Errors
    /// after `Running` are reported in the [`ShutdownReport`] instead.
    pub async fn run<S>(
        self,
        mut network: NetworkModule,
        mut signals: S,
    ) -> Result<ShutdownReport, LifecycleError>
    where
        S: Stream<Item = &'static str> + Unpin,
    {
        if let Err(e) = network.start().await {
            error!(error = %e, "startup aborted");
            mark_stopped(&self.controller);
            return Err(e);
        }

        let mut running = self.start().await?;
        running.serve(network);

        let server_error = tokio::select! {
            signal = signals.next() => {
                match signal {
                    Some(name) => info!(signal = name, "shutdown signal received"),
                    None => warn!("signal source closed, shutting down"),
                }
                None
            }
            exited = running.server_exited() => {
                let message = exited.unwrap_or_else(|| "http server stopped unexpectedly".to_string());
                error!(error = %message, "http server exited, shutting down");
                Some(message)
            }
        };

        let force = running.force_token();
        let shutdown = running.shutdown(ShutdownMode::Graceful);
        tokio::pin!(shutdown);

        let mut report = loop {
            tokio::select! {
                report = &mut shutdown => break report,
                Some(name) = signals.next(), if !force.is_cancelled() => {
                    warn!(signal = name, "second signal, forcing immediate shutdown");
                    force.cancel();
                }
            }
        };

        if report.server_error.is_none() {
            report.server_error = server_error;
        }
        Ok(report)
    }
}

async fn acquire_resources(
    config: &LifecycleConfig,
    instance_id: keel_core::InstanceId,
    database: Option<Arc<dyn Database>>,
    cache: Option<Arc<dyn Cache>>,
) -> Result<ResourceSet, LifecycleError> {
    let database = match database {
        Some(database) => database,
        None => database_from_url(&config.database_url, config.db_max_connections)?,
    };
    let cache = match cache {
        Some(cache) => cache,
        None => cache_from_url(&config.cache_url, config.cache_capacity)?,
    };
    ResourceSet::acquire(instance_id, database, cache, config.resource_timeout).await
}

/// Undoes a partial startup: subsystem hooks, then resources, then
/// `Stopped`.
async fn abort_startup(ctx: &ServiceContext, registry: &SubsystemRegistry) {
    let outcome = registry
        .shutdown_all(ctx.config.task_budget, &CancellationToken::new())
        .await;
    if !outcome.is_clean() {
        warn!(
            failed = ?outcome.failed,
            unfinished = ?outcome.unfinished,
            "subsystem shutdown incomplete during aborted startup"
        );
    }
    ctx.resources.release_all(ctx.config.resource_timeout).await;
    mark_stopped(&ctx.lifecycle);
}

fn mark_stopped(controller: &LifecycleController) {
    advance_or_warn(controller, LifecyclePhase::Stopped);
}

fn advance_or_warn(controller: &LifecycleController, next: LifecyclePhase) {
    if let Err(e) = controller.advance(next) {
        warn!(error = %e, "lifecycle transition skipped");
    }
}

/// What is left of the shutdown budget, never less than
/// [`MIN_PHASE_BUDGET`].
fn phase_budget(deadline: Instant) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .max(MIN_PHASE_BUDGET)
}

/// A service in the `Running` phase.
pub struct RunningService {
    ctx: ServiceContext,
    registry: Arc<SubsystemRegistry>,
    routes: Router,
    supervisor: Supervisor,
    init: InitReport,
    force: CancellationToken,
    http_stop: CancellationToken,
    server: Option<JoinHandle<Result<(), LifecycleError>>>,
}

impl RunningService {
    #[must_use]
    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    #[must_use]
    pub fn init_report(&self) -> &InitReport {
        &self.init
    }

    #[must_use]
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// The request pipeline over the system endpoints and every
    /// subsystem's routes.
    #[must_use]
    pub fn app(&self, network: &NetworkConfig) -> HttpApp {
        let state = AppState::new(self.ctx.clone(), self.init.degraded().to_vec());
        build_app(network, state, self.routes.clone())
    }

    /// Starts accepting on the bound listener. The server task stays
    /// owned by this service and is stopped by [`shutdown`](Self::shutdown).
    pub fn serve(&mut self, network: NetworkModule) {
        let app = self.app(network.config());
        let stop = self.http_stop.clone();
        self.server = Some(tokio::spawn(async move {
            network.serve(app, stop.cancelled_owned()).await
        }));
    }

    /// Cancelling this token turns an in-progress graceful shutdown into an
    /// immediate one.
    #[must_use]
    pub fn force_token(&self) -> CancellationToken {
        self.force.clone()
    }

    /// Resolves when the HTTP server task ends, with its error if any.
    /// Never resolves when no server was started.
    async fn server_exited(&mut self) -> Option<String> {
        let Some(handle) = self.server.as_mut() else {
            return std::future::pending().await;
        };
        let joined = handle.await;
        self.server = None;
        server_outcome(joined)
    }

    /// Runs `Draining -> ShuttingDown -> Stopped`, bounded by the
    /// configured shutdown budget.
    pub async fn shutdown(mut self, mode: ShutdownMode) -> ShutdownReport {
        let started = Instant::now();
        let config = Arc::clone(&self.ctx.config);
        let controller = Arc::clone(&self.ctx.lifecycle);
        let deadline = started + config.shutdown_budget;

        if mode == ShutdownMode::Immediate {
            self.force.cancel();
        }
        info!(
            mode = mode.as_str(),
            in_flight = controller.in_flight_count(),
            "shutdown started"
        );

        advance_or_warn(&controller, LifecyclePhase::Draining);
        self.supervisor.close_admission();

        let drained = if self.force.is_cancelled() {
            controller.in_flight_count() == 0
        } else {
            let grace = config.drain_grace.min(phase_budget(deadline));
            tokio::select! {
                drained = controller.wait_for_drain(grace) => drained,
                () = self.force.cancelled() => {
                    warn!("forced shutdown, skipping drain grace");
                    controller.in_flight_count() == 0
                }
            }
        };
        if !drained {
            warn!(
                in_flight = controller.in_flight_count(),
                "drain ended with requests in flight"
            );
        }
        let server_error = self.stop_server(deadline).await;

        advance_or_warn(&controller, LifecyclePhase::ShuttingDown);
        let task_budget = config.task_budget.min(phase_budget(deadline));
        let tasks = self
            .supervisor
            .shutdown_or_force(task_budget, &self.force)
            .await;

        let subsystems = self
            .registry
            .shutdown_all(phase_budget(deadline), &self.force)
            .await;

        let per_resource = (phase_budget(deadline) / 2).max(MIN_PHASE_BUDGET);
        let resource_failures = self
            .ctx
            .resources
            .release_all(per_resource)
            .await
            .into_iter()
            .map(|e| e.to_string())
            .collect();

        advance_or_warn(&controller, LifecyclePhase::Stopped);

        let report = ShutdownReport {
            mode: if self.force.is_cancelled() {
                ShutdownMode::Immediate
            } else {
                ShutdownMode::Graceful
            },
            phase: controller.phase(),
            drained,
            tasks,
            subsystem_failures: subsystems.failed,
            unfinished_subsystems: subsystems.unfinished,
            resource_failures,
            server_error,
            elapsed: started.elapsed(),
        };
        report.log();
        report
    }

    /// Stops accepting and waits for open connections, aborting them if
    /// they outlive the grace period.
    async fn stop_server(&mut self, deadline: Instant) -> Option<String> {
        self.http_stop.cancel();
        let mut handle = self.server.take()?;

        let budget = if self.force.is_cancelled() {
            MIN_PHASE_BUDGET
        } else {
            self.ctx
                .config
                .drain_grace
                .max(MIN_PHASE_BUDGET)
                .min(phase_budget(deadline))
        };

        match tokio::time::timeout(budget, &mut handle).await {
            Ok(joined) => server_outcome(joined),
            Err(_) => {
                warn!("http server did not stop in time, aborting open connections");
                handle.abort();
                None
            }
        }
    }
}

fn server_outcome(
    joined: Result<Result<(), LifecycleError>, tokio::task::JoinError>,
) -> Option<String> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) => Some(format!("http server task failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use keel_core::{ResourceState, TaskState};
    use parking_lot::Mutex;

    use super::*;
    use crate::resources::set::testing::{new_log, EventLog, RecordingResource};
    use crate::resources::{LocalCache, MemoryDatabase};
    use crate::supervisor::{BackgroundTask, Cadence, TaskContext};

    fn fast_config() -> LifecycleConfig {
        LifecycleConfig {
            drain_grace: Duration::from_millis(50),
            task_budget: Duration::from_secs(1),
            shutdown_budget: Duration::from_secs(3),
            ..LifecycleConfig::default()
        }
    }

    fn memory_orchestrator(config: LifecycleConfig) -> Orchestrator {
        Orchestrator::new(config).with_resources(
            Arc::new(MemoryDatabase::new()),
            Arc::new(LocalCache::new(64)),
        )
    }

    fn recording_orchestrator(log: &EventLog) -> Orchestrator {
        Orchestrator::new(fast_config()).with_resources(
            Arc::new(RecordingResource::new("database", log)),
            Arc::new(RecordingResource::new("cache", log)),
        )
    }

    struct Ticker {
        runs: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BackgroundTask for Ticker {
        fn name(&self) -> &'static str {
            "ticker"
        }

        fn cadence(&self) -> Cadence {
            Cadence::every(Duration::from_millis(5)).run_at_start()
        }

        async fn run(&self, _ctx: &TaskContext) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Hooked {
        name: &'static str,
        events: Arc<Mutex<Vec<String>>>,
        fail_init: bool,
    }

    #[async_trait]
    impl Subsystem for Hooked {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn initialize(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            self.events.lock().push(format!("init:{}", self.name));
            if self.fail_init {
                anyhow::bail!("{} unavailable", self.name);
            }
            Ok(())
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            self.events.lock().push(format!("shutdown:{}", self.name));
            Ok(())
        }
    }

    fn hooked(name: &'static str, events: &Arc<Mutex<Vec<String>>>, fail_init: bool) -> Hooked {
        Hooked {
            name,
            events: Arc::clone(events),
            fail_init,
        }
    }

    /// Shutdown hook that never returns.
    struct Stalled;

    #[async_trait]
    impl Subsystem for Stalled {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn initialize(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            std::future::pending().await
        }
    }

    /// Serves `/templates`.
    struct Templates(&'static str);

    #[async_trait]
    impl Subsystem for Templates {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn initialize(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            Ok(())
        }

        fn routes(&self) -> Router {
            Router::new().route("/templates", axum::routing::get(|| async { "templates" }))
        }
    }

    #[tokio::test]
    async fn start_reaches_running_with_resources_ready() {
        let orchestrator = memory_orchestrator(fast_config());
        let controller = orchestrator.controller();

        let running = orchestrator.start().await.unwrap();

        assert_eq!(controller.phase(), LifecyclePhase::Running);
        assert!(running
            .context()
            .resources
            .snapshots()
            .iter()
            .all(|r| r.state == ResourceState::Ready));

        let report = running.shutdown(ShutdownMode::Graceful).await;
        assert_eq!(report.phase, LifecyclePhase::Stopped);
        assert!(report.is_clean());
        assert!(report.drained);
    }

    #[tokio::test]
    async fn required_failure_starts_no_tasks_and_releases_resources() {
        let log = new_log();
        let mut orchestrator = recording_orchestrator(&log);
        let events = Arc::new(Mutex::new(Vec::new()));
        let runs = Arc::new(AtomicU32::new(0));

        orchestrator.register_subsystem(
            hooked("first", &events, false),
            Criticality::Required,
        );
        orchestrator.register_subsystem(
            hooked("broken", &events, true),
            Criticality::Required,
        );
        orchestrator.register_subsystem(
            hooked("never", &events, false),
            Criticality::Required,
        );
        orchestrator.add_task(TaskSpec::new(Ticker { runs: Arc::clone(&runs) }));
        let controller = orchestrator.controller();

        let err = orchestrator.start().await.err().unwrap();

        assert!(matches!(err, LifecycleError::RequiredInit { subsystem: "broken", .. }));
        assert_eq!(controller.phase(), LifecyclePhase::Stopped);
        assert_eq!(
            *events.lock(),
            vec!["init:first", "init:broken", "shutdown:first"]
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(
            *log.lock(),
            vec!["connect:database", "connect:cache", "close:cache", "close:database"]
        );
    }

    #[tokio::test]
    async fn best_effort_failure_degrades_but_runs() {
        let orchestrator = memory_orchestrator(fast_config());
        let events = Arc::new(Mutex::new(Vec::new()));
        orchestrator.register_subsystem(
            hooked("optional", &events, true),
            Criticality::BestEffort,
        );
        orchestrator.register_subsystem(
            hooked("core", &events, false),
            Criticality::Required,
        );

        let running = orchestrator.start().await.unwrap();

        assert_eq!(running.init_report().completed(), &["core"]);
        assert_eq!(running.init_report().degraded()[0].name, "optional");
        let snapshot = running.context().metrics_snapshot(running.init_report().degraded());
        assert_eq!(snapshot.degraded_subsystems.len(), 1);

        running.shutdown(ShutdownMode::Immediate).await;
        assert_eq!(events.lock().last().map(String::as_str), Some("shutdown:core"));
    }

    #[tokio::test]
    async fn shutdown_runs_phases_in_order() {
        let log = new_log();
        let mut orchestrator = recording_orchestrator(&log);
        let runs = Arc::new(AtomicU32::new(0));
        orchestrator.add_task(TaskSpec::new(Ticker { runs: Arc::clone(&runs) }));
        let controller = orchestrator.controller();
        let mut phases = controller.shutdown_receiver();

        let running = orchestrator.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(runs.load(Ordering::SeqCst) > 0);

        let report = running.shutdown(ShutdownMode::Graceful).await;

        assert_eq!(report.tasks.cancelled, vec!["ticker"]);
        assert!(report.tasks.abandoned.is_empty());
        assert_eq!(report.mode, ShutdownMode::Graceful);
        assert_eq!(controller.phase(), LifecyclePhase::Stopped);
        assert!(phases.has_changed().unwrap());
        assert_eq!(*phases.borrow_and_update(), keel_core::ShutdownState::Terminated);

        let after = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after);
        assert_eq!(
            log.lock()[2..],
            ["close:cache".to_string(), "close:database".to_string()]
        );
    }

    #[tokio::test]
    async fn graceful_drain_waits_for_in_flight_requests() {
        let orchestrator = memory_orchestrator(LifecycleConfig {
            drain_grace: Duration::from_secs(2),
            ..fast_config()
        });
        let controller = orchestrator.controller();
        let running = orchestrator.start().await.unwrap();

        let guard = controller.in_flight_guard();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        let report = running.shutdown(ShutdownMode::Graceful).await;
        release.await.unwrap();

        assert!(report.drained);
        assert!(report.elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn immediate_shutdown_skips_the_grace_period() {
        let orchestrator = memory_orchestrator(LifecycleConfig {
            drain_grace: Duration::from_secs(2),
            ..fast_config()
        });
        let controller = orchestrator.controller();
        let running = orchestrator.start().await.unwrap();
        let _guard = controller.in_flight_guard();

        let report = running.shutdown(ShutdownMode::Immediate).await;

        assert_eq!(report.mode, ShutdownMode::Immediate);
        assert!(!report.drained);
        assert!(report.elapsed < Duration::from_secs(1));
        assert_eq!(report.phase, LifecyclePhase::Stopped);
    }

    #[tokio::test]
    async fn unsupported_cache_url_is_fatal() {
        let orchestrator = Orchestrator::new(LifecycleConfig {
            cache_url: "memcached://localhost:11211".to_string(),
            ..fast_config()
        });
        let controller = orchestrator.controller();

        let err = orchestrator.start().await.err().unwrap();

        assert!(matches!(err, LifecycleError::Resource(_)));
        assert_eq!(controller.phase(), LifecyclePhase::Stopped);
    }

    #[tokio::test]
    async fn tasks_are_visible_in_the_snapshot() {
        let mut orchestrator = memory_orchestrator(fast_config());
        orchestrator.add_task(TaskSpec::new(Ticker { runs: Arc::new(AtomicU32::new(0)) }));

        let running = orchestrator.start().await.unwrap();
        let table = running.context().tasks.clone();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = running.context().metrics_snapshot(&[]);
        assert_eq!(snapshot.tasks.len(), 1);
        assert_eq!(snapshot.tasks[0].name, "ticker");
        assert!(snapshot.tasks[0].run_count > 0);

        running.shutdown(ShutdownMode::Graceful).await;
        let record = table.get("ticker").unwrap();
        assert_eq!(record.state(), TaskState::Cancelled);
    }

    #[tokio::test]
    async fn run_stops_on_first_signal_and_escalates_on_second() {
        let orchestrator = memory_orchestrator(LifecycleConfig {
            drain_grace: Duration::from_secs(2),
            ..fast_config()
        });
        let controller = orchestrator.controller();
        let guard = controller.in_flight_guard();
        let network = NetworkModule::new(NetworkConfig {
            host: "127.0.0.1".to_string(),
            ..NetworkConfig::default()
        });

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<&'static str>();
        let signals = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|name| (name, rx))
        })
        .boxed();

        let run = tokio::spawn(orchestrator.run(network, signals));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.phase(), LifecyclePhase::Running);

        tx.send("SIGTERM").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(controller.phase(), LifecyclePhase::Draining);

        tx.send("SIGINT").unwrap();
        let report = run.await.unwrap().unwrap();
        drop(guard);

        assert_eq!(report.mode, ShutdownMode::Immediate);
        assert_eq!(report.phase, LifecyclePhase::Stopped);
        assert!(report.server_error.is_none());
    }

    #[tokio::test]
    async fn run_reports_bind_failure() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let orchestrator = memory_orchestrator(fast_config());
        let controller = orchestrator.controller();
        let network = NetworkModule::new(NetworkConfig {
            host: "127.0.0.1".to_string(),
            port: taken.local_addr().unwrap().port(),
            ..NetworkConfig::default()
        });

        let err = orchestrator
            .run(network, futures_util::stream::pending::<&'static str>().boxed())
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Bind { .. }));
        assert_eq!(controller.phase(), LifecyclePhase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_shutdown_hook_is_reported_unfinished() {
        let orchestrator = memory_orchestrator(fast_config());
        orchestrator.register_subsystem(Stalled, Criticality::Required);
        let running = orchestrator.start().await.unwrap();

        let report = running.shutdown(ShutdownMode::Graceful).await;

        assert_eq!(report.phase, LifecyclePhase::Stopped);
        assert_eq!(report.unfinished_subsystems, vec!["stalled"]);
        assert!(report.subsystem_failures.is_empty());
        assert!(!report.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn force_cuts_a_stalled_shutdown_short() {
        let orchestrator = memory_orchestrator(LifecycleConfig {
            shutdown_budget: Duration::from_secs(60),
            task_budget: Duration::from_secs(30),
            ..fast_config()
        });
        orchestrator.register_subsystem(Stalled, Criticality::Required);
        let running = orchestrator.start().await.unwrap();

        let force = running.force_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            force.cancel();
        });
        let report = running.shutdown(ShutdownMode::Graceful).await;

        assert_eq!(report.mode, ShutdownMode::Immediate);
        assert_eq!(report.unfinished_subsystems, vec!["stalled"]);
        assert!(report.elapsed < Duration::from_secs(2));
        assert_eq!(report.phase, LifecyclePhase::Stopped);
    }

    #[tokio::test]
    async fn overlapping_subsystem_routes_abort_startup() {
        let log = new_log();
        let mut orchestrator = recording_orchestrator(&log);
        let runs = Arc::new(AtomicU32::new(0));
        orchestrator.register_subsystem(Templates("drafts"), Criticality::Required);
        orchestrator.register_subsystem(Templates("published"), Criticality::BestEffort);
        orchestrator.add_task(TaskSpec::new(Ticker { runs: Arc::clone(&runs) }));
        let controller = orchestrator.controller();

        let err = orchestrator.start().await.err().unwrap();

        assert!(matches!(
            err,
            LifecycleError::RouteConflict { subsystem: "published", .. }
        ));
        assert_eq!(controller.phase(), LifecyclePhase::Stopped);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(
            *log.lock(),
            vec!["connect:database", "connect:cache", "close:cache", "close:database"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_database_connect_fails_startup() {
        let log = new_log();
        let mut database = RecordingResource::new("database", &log);
        database.hang_connect = true;
        let orchestrator = Orchestrator::new(LifecycleConfig {
            resource_timeout: Duration::from_millis(200),
            ..fast_config()
        })
        .with_resources(
            Arc::new(database),
            Arc::new(RecordingResource::new("cache", &log)),
        );
        let controller = orchestrator.controller();

        let err = orchestrator.start().await.err().unwrap();

        assert!(matches!(
            err,
            LifecycleError::ResourceAcquisition {
                resource: "database",
                source: crate::error::ResourceError::ConnectTimeout { .. },
            }
        ));
        assert_eq!(controller.phase(), LifecyclePhase::Stopped);
        assert_eq!(*log.lock(), vec!["connect:database"]);
    }
}
