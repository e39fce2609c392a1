use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::append_with_retry;
use super::clock::Clock;
use super::registry::ActivityRegistry;
use crate::providers::{HistoryStore, InstanceRecord, ProviderError};
use crate::{ActivityFailure, Event, RetryPolicy};

/// Identity of the attempt a handler is running. Carries the instance id as a
/// back-reference only; activities never touch orchestration history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityContext {
    instance_id: String,
    call_id: u64,
    activity_name: String,
    attempt: u32,
}

impl ActivityContext {
    pub fn new(instance_id: impl Into<String>, call_id: u64, activity_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            instance_id: instance_id.into(),
            call_id,
            activity_name: activity_name.into(),
            attempt,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Trait implemented by activity handlers that can be invoked by the runtime.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// One activity call handed to the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityWorkItem {
    pub instance_id: String,
    pub call_id: u64,
    pub name: String,
    pub input: String,
    pub retry_policy: Option<RetryPolicy>,
    /// Attempt number to start from; greater than 1 when resuming after a restart.
    pub first_attempt: u32,
}

/// How an execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// `ActivityCompleted` was appended.
    Completed(String),
    /// The terminal `ActivityFailed` was appended.
    Exhausted(ActivityFailure),
    /// The instance is unknown to the store. The activity ran once anyway and
    /// nothing was recorded.
    Orphaned { output: Result<String, String> },
    /// Another execution already recorded this call's outcome.
    AlreadyRecorded,
    /// The instance reached a terminal state; no further attempts were made.
    Terminated { attempts: u32 },
    /// The activity slots were closed by shutdown before the next attempt.
    ShutDown,
}

impl ExecutionOutcome {
    /// Whether the owning instance should run a decision cycle.
    pub fn needs_decision(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed(_) | ExecutionOutcome::Exhausted(_))
    }
}

/// Counters shared by the runtime's workers.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    activity_attempts: AtomicU64,
    activities_completed: AtomicU64,
    activities_exhausted: AtomicU64,
    orphaned_activities: AtomicU64,
    decisions: AtomicU64,
}

/// Point-in-time copy of [`RuntimeStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub activity_attempts: u64,
    pub activities_completed: u64,
    pub activities_exhausted: u64,
    pub orphaned_activities: u64,
    pub decisions: u64,
}

impl RuntimeStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            activity_attempts: self.activity_attempts.load(Ordering::Relaxed),
            activities_completed: self.activities_completed.load(Ordering::Relaxed),
            activities_exhausted: self.activities_exhausted.load(Ordering::Relaxed),
            orphaned_activities: self.orphaned_activities.load(Ordering::Relaxed),
            decisions: self.decisions.load(Ordering::Relaxed),
        }
    }

    pub fn orphaned_activities(&self) -> u64 {
        self.orphaned_activities.load(Ordering::Relaxed)
    }

    pub(crate) fn record_decision(&self) {
        self.decisions.fetch_add(1, Ordering::Relaxed);
    }
}

enum CallState {
    Open,
    Recorded,
    InstanceFinished,
}

/// State of `call_id` plus the highest attempt already recorded as failed.
fn call_state(record: &InstanceRecord, call_id: u64) -> (CallState, u32) {
    let mut state = CallState::Open;
    let mut last_failed = 0;
    for stored in &record.events {
        let event = &stored.event;
        if event.is_orchestrator_terminal() {
            return (CallState::InstanceFinished, last_failed);
        }
        if event.is_call_terminal() && event.call_id() == Some(call_id) {
            state = CallState::Recorded;
        }
        if let Event::ActivityFailed { call_id: id, attempt, .. } = event
            && *id == call_id
        {
            last_failed = last_failed.max(*attempt);
        }
    }
    (state, last_failed)
}

/// Runs activity calls with their retry policy and records the outcome.
///
/// Every attempt's failure is appended as `ActivityFailed`; the last one is
/// marked `exhausted`. Backoff sleeps go through the injected [`Clock`]. The
/// store's admission rules make a second execution of the same call harmless:
/// its appends are dropped and it reports [`ExecutionOutcome::AlreadyRecorded`].
///
/// Each attempt holds one permit from the executor's slots while the handler
/// runs and its outcome is appended; backoff sleeps hold none.
pub struct ActivityExecutor {
    store: Arc<dyn HistoryStore>,
    registry: Arc<ActivityRegistry>,
    clock: Arc<dyn Clock>,
    stats: Arc<RuntimeStats>,
    slots: Arc<Semaphore>,
}

impl ActivityExecutor {
    pub fn new(
        store: Arc<dyn HistoryStore>,
        registry: Arc<ActivityRegistry>,
        clock: Arc<dyn Clock>,
        stats: Arc<RuntimeStats>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            stats,
            slots: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
        }
    }

    /// Share `slots` with other executions to bound how many attempts run at once.
    pub fn with_concurrency_limit(mut self, slots: Arc<Semaphore>) -> Self {
        self.slots = slots;
        self
    }

    pub async fn execute(&self, item: &ActivityWorkItem) -> Result<ExecutionOutcome, ProviderError> {
        let record = match self.store.load(&item.instance_id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Ok(self.run_orphaned(item).await),
            Err(e) => return Err(e),
        };
        let (state, last_failed) = call_state(&record, item.call_id);
        match state {
            CallState::Open => {}
            CallState::Recorded => return Ok(ExecutionOutcome::AlreadyRecorded),
            CallState::InstanceFinished => return Ok(ExecutionOutcome::Terminated { attempts: 0 }),
        }
        // Failed attempts already on record are never rerun under the same number
        let first_attempt = item.first_attempt.max(last_failed + 1);

        let Some(handler) = self.registry.get(&item.name) else {
            let error = format!("unregistered:{}", item.name);
            warn!(
                target: "duraflow::runtime::activity",
                instance = %item.instance_id,
                call_id = item.call_id,
                activity = %item.name,
                "activity not registered"
            );
            let outcome = self.record_failure(item, first_attempt, error, true).await?;
            return Ok(outcome.unwrap_or(ExecutionOutcome::AlreadyRecorded));
        };

        let policy = item.retry_policy.clone().unwrap_or_else(RetryPolicy::no_retry);
        let started_ms = self.clock.now_ms();
        let mut attempt = first_attempt;
        loop {
            let Ok(permit) = self.slots.acquire().await else {
                return Ok(ExecutionOutcome::ShutDown);
            };
            self.stats.activity_attempts.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "duraflow::runtime::activity",
                instance = %item.instance_id,
                call_id = item.call_id,
                activity = %item.name,
                attempt,
                "running activity attempt"
            );
            let ctx = ActivityContext::new(item.instance_id.clone(), item.call_id, item.name.clone(), attempt);
            match handler.invoke(ctx, item.input.clone()).await {
                Ok(output) => {
                    let written = append_with_retry(
                        self.store.as_ref(),
                        &item.instance_id,
                        vec![Event::ActivityCompleted {
                            call_id: item.call_id,
                            output: output.clone(),
                        }],
                    )
                    .await?;
                    if written == 0 {
                        return self.explain_dropped(item, attempt).await;
                    }
                    self.stats.activities_completed.fetch_add(1, Ordering::Relaxed);
                    info!(
                        target: "duraflow::runtime::activity",
                        instance = %item.instance_id,
                        call_id = item.call_id,
                        activity = %item.name,
                        attempt,
                        "activity completed"
                    );
                    return Ok(ExecutionOutcome::Completed(output));
                }
                Err(error) => {
                    let elapsed = Duration::from_millis(self.clock.now_ms().saturating_sub(started_ms));
                    let retry = policy.should_retry(attempt, elapsed);
                    if let Some(outcome) = self.record_failure(item, attempt, error, !retry).await? {
                        return Ok(outcome);
                    }
                    drop(permit);
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        target: "duraflow::runtime::activity",
                        instance = %item.instance_id,
                        call_id = item.call_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "backing off before retry"
                    );
                    self.clock.sleep(delay).await;
                    if self.instance_finished(&item.instance_id).await? {
                        info!(
                            target: "duraflow::runtime::activity",
                            instance = %item.instance_id,
                            call_id = item.call_id,
                            "instance finished; abandoning retries"
                        );
                        return Ok(ExecutionOutcome::Terminated { attempts: attempt });
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Append the failure of `attempt`. Returns `None` when a non-exhausted
    /// attempt was recorded and the caller may retry.
    async fn record_failure(
        &self,
        item: &ActivityWorkItem,
        attempt: u32,
        error: String,
        exhausted: bool,
    ) -> Result<Option<ExecutionOutcome>, ProviderError> {
        warn!(
            target: "duraflow::runtime::activity",
            instance = %item.instance_id,
            call_id = item.call_id,
            activity = %item.name,
            attempt,
            exhausted,
            error = %error,
            "activity attempt failed"
        );
        let written = append_with_retry(
            self.store.as_ref(),
            &item.instance_id,
            vec![Event::ActivityFailed {
                call_id: item.call_id,
                error: error.clone(),
                attempt,
                exhausted,
            }],
        )
        .await?;
        if written == 0 {
            return self.explain_dropped(item, attempt).await.map(Some);
        }
        if !exhausted {
            return Ok(None);
        }
        self.stats.activities_exhausted.fetch_add(1, Ordering::Relaxed);
        Ok(Some(ExecutionOutcome::Exhausted(ActivityFailure {
            activity: item.name.clone(),
            call_id: item.call_id,
            attempts: attempt,
            message: error,
        })))
    }

    /// Classify an append the store refused.
    async fn explain_dropped(&self, item: &ActivityWorkItem, attempt: u32) -> Result<ExecutionOutcome, ProviderError> {
        if self.instance_finished(&item.instance_id).await? {
            Ok(ExecutionOutcome::Terminated { attempts: attempt })
        } else {
            debug!(
                target: "duraflow::runtime::activity",
                instance = %item.instance_id,
                call_id = item.call_id,
                "outcome already recorded by another execution"
            );
            Ok(ExecutionOutcome::AlreadyRecorded)
        }
    }

    async fn instance_finished(&self, instance: &str) -> Result<bool, ProviderError> {
        match self.store.load(instance).await {
            Ok(record) => Ok(record.events.iter().any(|s| s.event.is_orchestrator_terminal())),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn run_orphaned(&self, item: &ActivityWorkItem) -> ExecutionOutcome {
        warn!(
            target: "duraflow::runtime::activity",
            instance = %item.instance_id,
            call_id = item.call_id,
            activity = %item.name,
            "instance not found; running activity without recording its outcome"
        );
        let Ok(_permit) = self.slots.acquire().await else {
            return ExecutionOutcome::ShutDown;
        };
        self.stats.orphaned_activities.fetch_add(1, Ordering::Relaxed);
        self.stats.activity_attempts.fetch_add(1, Ordering::Relaxed);
        let output = match self.registry.get(&item.name) {
            Some(handler) => {
                let ctx = ActivityContext::new(item.instance_id.clone(), item.call_id, item.name.clone(), item.first_attempt.max(1));
                handler.invoke(ctx, item.input.clone()).await
            }
            None => Err(format!("unregistered:{}", item.name)),
        };
        ExecutionOutcome::Orphaned { output }
    }
}
