use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, ProviderError};
use crate::{Command, Event, OrchestrationContext};

pub mod activity;
pub mod clock;
pub mod instances;
pub mod registry;
pub mod replay_engine;
pub mod status;
mod timers;

pub use activity::{
    ActivityContext, ActivityExecutor, ActivityHandler, ActivityWorkItem, ExecutionOutcome, FnActivity, RuntimeStats,
    StatsSnapshot,
};
pub use clock::{Clock, SystemClock, VirtualClock};
pub use instances::InstanceManager;
pub use registry::{ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder};
pub use replay_engine::{Decision, ReplayEngine, TurnResult, replay_commands};
pub use status::{InstanceSnapshot, InstanceStatus};

use timers::{TimerRequest, TimerService};

/// Retries after the first failed append of a retryable provider error.
const APPEND_RETRIES: u32 = 5;
/// Wait before work whose append retries ran out is queued again.
const REQUEUE_DELAY: Duration = Duration::from_millis(500);

/// Append with exponential backoff on retryable provider errors. Retrying is
/// safe because the store's admission rules drop anything already written.
pub(crate) async fn append_with_retry(
    store: &dyn HistoryStore,
    instance: &str,
    events: Vec<Event>,
) -> Result<usize, ProviderError> {
    let mut attempts: u32 = 0;
    loop {
        match store.append(instance, events.clone()).await {
            Ok(written) => return Ok(written),
            Err(e) if e.is_retryable() && attempts < APPEND_RETRIES => {
                let backoff_ms = 10u64.saturating_mul(1 << attempts);
                warn!(instance, attempts, backoff_ms, error = %e, "append failed; retrying");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempts += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Upper bound on activity executions running at once, retries included.
    /// Default: 16
    pub max_concurrent_activities: usize,
    /// How often `InstanceManager::wait_for_completion` re-reads the store.
    /// Default: 20ms
    pub status_poll_interval: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_concurrent_activities: 16,
            status_poll_interval: Duration::from_millis(20),
        }
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Requests for decision cycles, coalesced per instance: while an instance
/// already has a request queued, further requests for it are absorbed.
#[derive(Clone)]
pub struct DecisionQueue {
    tx: mpsc::UnboundedSender<String>,
    pending: Arc<std::sync::Mutex<HashSet<String>>>,
}

impl DecisionQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            pending: Arc::new(std::sync::Mutex::new(HashSet::new())),
        };
        (queue, rx)
    }

    /// Ask for a decision on `instance`. Returns false if one was already queued.
    pub fn request(&self, instance: &str) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if !pending.insert(instance.to_string()) {
            return false;
        }
        if self.tx.send(instance.to_string()).is_err() {
            pending.remove(instance);
            return false;
        }
        true
    }

    /// Mark the queued request for `instance` as picked up, so that requests
    /// arriving during the decision queue a follow-up cycle.
    fn taken(&self, instance: &str) {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).remove(instance);
    }
}

/// Per-instance write locks. Decision cycles and termination hold the lock
/// for the instance they touch; instances never contend with each other.
#[derive(Clone, Default)]
pub struct InstanceLocks {
    inner: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl InstanceLocks {
    pub async fn acquire(&self, instance: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(map.entry(instance.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Liveness of the background loops, reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RuntimeHealth {
    pub dispatcher_alive: bool,
    pub timers_alive: bool,
}

impl RuntimeHealth {
    pub fn is_healthy(&self) -> bool {
        self.dispatcher_alive && self.timers_alive
    }
}

/// In-process runtime: drives decision cycles, executes activities and
/// fires timers, persisting everything through a [`HistoryStore`].
pub struct Runtime {
    // [dispatcher, timers]
    loops: std::sync::Mutex<Vec<JoinHandle<()>>>,
    tasks: std::sync::Mutex<JoinSet<()>>,
    store: Arc<dyn HistoryStore>,
    orchestrations: Arc<OrchestrationRegistry>,
    executor: Arc<ActivityExecutor>,
    clock: Arc<dyn Clock>,
    decisions: DecisionQueue,
    locks: InstanceLocks,
    timer_tx: mpsc::UnboundedSender<TimerRequest>,
    activity_slots: Arc<Semaphore>,
    stats: Arc<RuntimeStats>,
    options: RuntimeOptions,
}

impl Runtime {
    /// Start a new runtime backed by an in-memory store.
    pub async fn start(
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
        Self::start_with_store(store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    /// Unfinished instances already in the store are resumed.
    pub async fn start_with_store(
        store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            store,
            activity_registry,
            orchestration_registry,
            Arc::new(SystemClock),
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a new runtime with an explicit clock and options.
    pub async fn start_with_options(
        store: Arc<dyn HistoryStore>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        clock: Arc<dyn Clock>,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let stats = Arc::new(RuntimeStats::default());
        let (decisions, decision_rx) = DecisionQueue::new();
        let (timer_handle, timer_tx) = TimerService::start(store.clone(), clock.clone(), decisions.clone());
        let activity_slots = Arc::new(Semaphore::new(options.max_concurrent_activities.max(1)));
        let executor = Arc::new(
            ActivityExecutor::new(store.clone(), activity_registry, clock.clone(), stats.clone())
                .with_concurrency_limit(activity_slots.clone()),
        );

        let runtime = Arc::new(Self {
            loops: std::sync::Mutex::new(Vec::new()),
            tasks: std::sync::Mutex::new(JoinSet::new()),
            store,
            orchestrations: Arc::new(orchestration_registry),
            executor,
            clock,
            decisions,
            locks: InstanceLocks::default(),
            timer_tx,
            activity_slots,
            stats,
            options,
        });

        let dispatcher = runtime.clone().start_orchestration_dispatcher(decision_rx);
        if let Ok(mut loops) = runtime.loops.lock() {
            loops.push(dispatcher);
            loops.push(timer_handle);
        }

        if let Err(e) = runtime.recover().await {
            error!(error = %e, "recovery scan failed; unfinished instances were not resumed");
        }
        runtime
    }

    /// Handle for scheduling and inspecting instances.
    pub fn instances(&self) -> InstanceManager {
        InstanceManager::new(
            self.store.clone(),
            self.orchestrations.clone(),
            self.decisions.clone(),
            self.locks.clone(),
            self.options.status_poll_interval,
        )
    }

    pub fn store(&self) -> Arc<dyn HistoryStore> {
        self.store.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn health(&self) -> RuntimeHealth {
        let loops = self.loops.lock().unwrap_or_else(|p| p.into_inner());
        let alive = |idx: usize| loops.get(idx).is_some_and(|h| !h.is_finished());
        RuntimeHealth {
            dispatcher_alive: alive(0),
            timers_alive: alive(1),
        }
    }

    fn spawn_task<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        // Reap finished tasks so the set does not grow without bound
        while tasks.try_join_next().is_some() {}
        tasks.spawn(fut);
    }

    fn start_orchestration_dispatcher(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(instance) = rx.recv().await {
                self.decisions.taken(&instance);
                let rt = self.clone();
                self.spawn_task(async move { rt.run_decision(instance).await });
            }
            debug!("decision channel closed; dispatcher exiting");
        })
    }

    async fn run_decision(self: Arc<Self>, instance: String) {
        let result = {
            let _guard = self.locks.acquire(&instance).await;
            self.decide(&instance).await
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                warn!(instance = %instance, error = %e, "decision cycle failed; requeueing");
                let decisions = self.decisions.clone();
                self.spawn_task(async move {
                    tokio::time::sleep(REQUEUE_DELAY).await;
                    decisions.request(&instance);
                });
            }
            Err(e) => error!(instance = %instance, error = %e, "decision cycle failed"),
        }
    }

    /// One decision cycle. Caller holds the instance lock.
    async fn decide(self: &Arc<Self>, instance: &str) -> Result<(), ProviderError> {
        let record = match self.store.load(instance).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                warn!(instance, "decision requested for unknown instance");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let history = record.history();
        if history.iter().any(Event::is_orchestrator_terminal) {
            debug!(instance, "instance is terminal; skipping decision");
            return Ok(());
        }
        self.stats.record_decision();

        let engine = ReplayEngine::new(
            instance,
            record.metadata.orchestration.clone(),
            record.metadata.input.clone(),
            history,
            self.clock.now_ms(),
        );
        let decision = match self.orchestrations.get(&record.metadata.orchestration) {
            Some(handler) => engine.execute(handler),
            None => engine.unregistered(),
        };

        // Events first: a command is only dispatched once its scheduling event is durable
        let mut commands = decision.commands;
        if !decision.new_events.is_empty() {
            let expected = decision.new_events.len();
            let written = append_with_retry(self.store.as_ref(), instance, decision.new_events).await?;
            if written < expected {
                warn!(instance, expected, written, "store admitted only part of the decision");
                let persisted = self.store.read(instance).await?;
                if persisted.iter().any(Event::is_orchestrator_terminal) {
                    commands.clear();
                } else {
                    commands.retain(|command| scheduled_in(&persisted, command));
                }
            }
        }
        for command in commands {
            self.dispatch(instance, command);
        }

        match decision.outcome {
            TurnResult::Continue => {}
            TurnResult::Completed(_) => info!(instance, orchestration = %record.metadata.orchestration, "orchestration completed"),
            TurnResult::Failed(details) => warn!(
                instance,
                orchestration = %record.metadata.orchestration,
                error = %details,
                "orchestration failed"
            ),
        }
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, instance: &str, command: Command) {
        match command {
            Command::ScheduleActivity {
                call_id,
                name,
                input,
                retry_policy,
            } => self.spawn_activity(ActivityWorkItem {
                instance_id: instance.to_string(),
                call_id,
                name,
                input,
                retry_policy,
                first_attempt: 1,
            }),
            Command::CreateTimer { timer_id, fire_at_ms } => {
                let request = TimerRequest {
                    fire_at_ms,
                    instance: instance.to_string(),
                    timer_id,
                };
                if self.timer_tx.send(request).is_err() {
                    error!(instance, timer_id, "timer service is gone; timer will fire after restart");
                }
            }
        }
    }

    fn spawn_activity(self: &Arc<Self>, item: ActivityWorkItem) {
        let rt = self.clone();
        self.spawn_task(async move {
            match rt.executor.execute(&item).await {
                Ok(outcome) => {
                    if outcome.needs_decision() {
                        rt.decisions.request(&item.instance_id);
                    } else {
                        debug!(
                            instance = %item.instance_id,
                            call_id = item.call_id,
                            outcome = ?outcome,
                            "activity finished without a new outcome"
                        );
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        instance = %item.instance_id,
                        call_id = item.call_id,
                        error = %e,
                        "activity outcome could not be recorded; requeueing"
                    );
                    tokio::time::sleep(REQUEUE_DELAY).await;
                    rt.spawn_activity(item);
                }
                Err(e) => error!(
                    instance = %item.instance_id,
                    call_id = item.call_id,
                    error = %e,
                    "activity outcome could not be recorded"
                ),
            }
        });
    }

    /// Resume every unfinished instance in the store: re-dispatch calls that
    /// have no terminal event, re-arm unfired timers and queue a decision.
    async fn recover(self: &Arc<Self>) -> Result<(), ProviderError> {
        let mut resumed = 0usize;
        for instance in self.store.list_instances().await? {
            let record = match self.store.load(&instance).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(instance = %instance, error = %e, "skipping unreadable instance during recovery");
                    continue;
                }
            };
            let history = record.history();
            if history.iter().any(Event::is_orchestrator_terminal) {
                continue;
            }
            for call in open_calls(&history) {
                match call {
                    OpenCall::Activity(mut item) => {
                        item.instance_id = instance.clone();
                        self.spawn_activity(item);
                    }
                    OpenCall::Timer { timer_id, fire_at_ms } => {
                        self.dispatch(&instance, Command::CreateTimer { timer_id, fire_at_ms });
                    }
                }
            }
            self.decisions.request(&instance);
            resumed += 1;
        }
        if resumed > 0 {
            info!(resumed, "resumed unfinished instances");
        }
        Ok(())
    }

    /// Abort background tasks.
    pub async fn shutdown(self: Arc<Self>) {
        self.activity_slots.close();
        let loops: Vec<JoinHandle<()>> = self.loops.lock().map(|mut l| l.drain(..).collect()).unwrap_or_default();
        for j in loops {
            j.abort();
        }
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        tasks.shutdown().await;
    }
}

/// Whether the scheduling event behind `command` is in `history`.
fn scheduled_in(history: &[Event], command: &Command) -> bool {
    history.iter().any(|event| match (event, command) {
        (Event::ActivityScheduled { call_id, .. }, Command::ScheduleActivity { call_id: id, .. }) => call_id == id,
        (Event::TimerCreated { timer_id, .. }, Command::CreateTimer { timer_id: id, .. }) => timer_id == id,
        _ => false,
    })
}

enum OpenCall {
    Activity(ActivityWorkItem),
    Timer { timer_id: u64, fire_at_ms: u64 },
}

/// Calls scheduled in `history` that have no terminal event yet. Activities
/// resume at the attempt after the last recorded failure.
fn open_calls(history: &[Event]) -> Vec<OpenCall> {
    let mut closed = HashSet::new();
    let mut last_attempt: HashMap<u64, u32> = HashMap::new();
    for event in history {
        if event.is_call_terminal()
            && let Some(id) = event.call_id()
        {
            closed.insert(id);
        }
        if let Event::ActivityFailed { call_id, attempt, .. } = event {
            let entry = last_attempt.entry(*call_id).or_default();
            *entry = (*entry).max(*attempt);
        }
    }
    let mut open = Vec::new();
    for event in history {
        match event {
            Event::ActivityScheduled {
                call_id,
                name,
                input,
                retry_policy,
            } if !closed.contains(call_id) => open.push(OpenCall::Activity(ActivityWorkItem {
                instance_id: String::new(),
                call_id: *call_id,
                name: name.clone(),
                input: input.clone(),
                retry_policy: retry_policy.clone(),
                first_attempt: last_attempt.get(call_id).copied().unwrap_or(0) + 1,
            })),
            Event::TimerCreated { timer_id, fire_at_ms } if !closed.contains(timer_id) => open.push(OpenCall::Timer {
                timer_id: *timer_id,
                fire_at_ms: *fire_at_ms,
            }),
            _ => {}
        }
    }
    open
}
