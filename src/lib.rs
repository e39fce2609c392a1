//! Durable workflow orchestration core.
//!
//! Orchestrations are ordinary async Rust functions that schedule activities
//! and timers through an [`OrchestrationContext`]. Every scheduling decision and
//! every outcome is appended to a per-instance history kept by a
//! [`providers::HistoryStore`]. On each decision cycle the runtime re-runs the
//! orchestration function from the top against that history: calls that
//! already have a recorded outcome resolve instantly, the first call without
//! one suspends the cycle, and newly issued calls become commands for the
//! activity worker or the timer service.
//!
//! The crate exposes:
//!
//! - Data model: [`Event`], [`Command`], [`RetryPolicy`]
//! - Orchestration API: [`OrchestrationContext`] with [`ActivityFuture`],
//!   [`TimerFuture`], [`JoinFuture`] and [`FanOutFuture`]
//! - Runtime: [`runtime::Runtime`], [`runtime::InstanceManager`] and the
//!   immutable [`runtime::registry`] types
//! - Storage: [`providers::in_memory::InMemoryHistoryStore`] and
//!   [`providers::fs::FsHistoryStore`]
//!
//! Orchestration code must be deterministic: it may only depend on its input
//! and on the outputs the context hands back. Wall-clock reads, random values
//! and direct I/O inside an orchestration break replay. The engine detects
//! divergence from recorded history and fails the instance, but it cannot
//! prevent it.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

pub mod error;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod retry;
pub mod runtime;
pub mod samples;
pub mod server;

pub use error::{ActivityFailure, Error, FailureDetails};
pub use crate::futures::{ActivityFuture, FanOutFuture, JoinFuture, TimerFuture};
pub use retry::RetryPolicy;
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::{ActivityContext, InstanceManager, InstanceSnapshot, InstanceStatus, Runtime, RuntimeOptions};

/// First call id handed out during a replay.
pub const INITIAL_CALL_ID: u64 = 1;

// Internal codec utilities for typed I/O
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // Plain strings travel unquoted so string-typed handlers interoperate
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => serde_json::from_value(Value::String(s.to_string())).map_err(|e| e.to_string()),
            }
        }
    }
}

/// Append-only orchestration history entries. The total order of events within
/// an instance is the replay contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// First decision cycle picked the instance up.
    OrchestratorStarted { name: String, input: String },
    /// An activity call was issued with a deterministic call id.
    ActivityScheduled {
        call_id: u64,
        name: String,
        input: String,
        retry_policy: Option<RetryPolicy>,
    },
    /// Terminal success for a call.
    ActivityCompleted { call_id: u64, output: String },
    /// One failed attempt. `exhausted` marks the terminal failure that is
    /// surfaced to the orchestration.
    ActivityFailed {
        call_id: u64,
        error: String,
        attempt: u32,
        exhausted: bool,
    },
    /// Durable timer issued; `timer_id` shares the call id sequence.
    TimerCreated { timer_id: u64, fire_at_ms: u64 },
    TimerFired { timer_id: u64, fire_at_ms: u64 },
    OrchestratorCompleted { result: String },
    OrchestratorFailed { error: FailureDetails },
    /// External cancellation; no further calls are scheduled.
    OrchestratorTerminated { reason: String },
}

impl Event {
    /// Stable name of the variant, used in logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::OrchestratorStarted { .. } => "OrchestratorStarted",
            Event::ActivityScheduled { .. } => "ActivityScheduled",
            Event::ActivityCompleted { .. } => "ActivityCompleted",
            Event::ActivityFailed { .. } => "ActivityFailed",
            Event::TimerCreated { .. } => "TimerCreated",
            Event::TimerFired { .. } => "TimerFired",
            Event::OrchestratorCompleted { .. } => "OrchestratorCompleted",
            Event::OrchestratorFailed { .. } => "OrchestratorFailed",
            Event::OrchestratorTerminated { .. } => "OrchestratorTerminated",
        }
    }

    /// Call id this event belongs to, if any.
    pub fn call_id(&self) -> Option<u64> {
        match self {
            Event::ActivityScheduled { call_id, .. }
            | Event::ActivityCompleted { call_id, .. }
            | Event::ActivityFailed { call_id, .. } => Some(*call_id),
            Event::TimerCreated { timer_id, .. } | Event::TimerFired { timer_id, .. } => Some(*timer_id),
            _ => None,
        }
    }

    /// True for events that open a call (activity or timer).
    pub fn is_scheduling(&self) -> bool {
        matches!(self, Event::ActivityScheduled { .. } | Event::TimerCreated { .. })
    }

    /// True for the single event that closes a call.
    pub fn is_call_terminal(&self) -> bool {
        matches!(
            self,
            Event::ActivityCompleted { .. } | Event::ActivityFailed { exhausted: true, .. } | Event::TimerFired { .. }
        )
    }

    /// True for events that end the orchestration itself.
    pub fn is_orchestrator_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestratorCompleted { .. } | Event::OrchestratorFailed { .. } | Event::OrchestratorTerminated { .. }
        )
    }
}

/// Work requested by a decision cycle. The runtime materializes commands
/// after the matching scheduling events are durable.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ScheduleActivity {
        call_id: u64,
        name: String,
        input: String,
        retry_policy: Option<RetryPolicy>,
    },
    CreateTimer { timer_id: u64, fire_at_ms: u64 },
}

/// One member of a fan-out batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityCall {
    pub name: String,
    pub input: String,
    pub retry_policy: Option<RetryPolicy>,
}

impl ActivityCall {
    pub fn new(name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            retry_policy: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// Recorded outcome of a call, indexed once per decision cycle.
#[derive(Debug, Clone)]
pub(crate) enum CallOutcome {
    Completed(String),
    Failed(ActivityFailure),
    Fired,
}

/// Replay cursor for one decision cycle. Everything the orchestration "knows"
/// is derived from `history`; nothing survives past the cycle.
#[derive(Debug)]
pub(crate) struct CtxInner {
    instance_id: String,
    history: Vec<Event>,
    // call_id -> index of its scheduling event in `history`
    scheduled: HashMap<u64, usize>,
    outcomes: HashMap<u64, CallOutcome>,
    last_recorded_call_id: u64,
    next_call_id: u64,
    claimed: HashSet<u64>,
    staged_events: Vec<Event>,
    commands: Vec<Command>,
    nondeterminism: Option<String>,
    now_ms: u64,
}

impl CtxInner {
    fn new(instance_id: String, history: Vec<Event>, now_ms: u64) -> Self {
        let mut scheduled = HashMap::new();
        let mut outcomes = HashMap::new();
        let mut last_recorded_call_id = 0;
        for (idx, event) in history.iter().enumerate() {
            match event {
                Event::ActivityScheduled { call_id, .. } | Event::TimerCreated { timer_id: call_id, .. } => {
                    scheduled.insert(*call_id, idx);
                    last_recorded_call_id = last_recorded_call_id.max(*call_id);
                }
                Event::ActivityCompleted { call_id, output } => {
                    outcomes
                        .entry(*call_id)
                        .or_insert_with(|| CallOutcome::Completed(output.clone()));
                }
                Event::ActivityFailed {
                    call_id,
                    error,
                    attempt,
                    exhausted: true,
                } => {
                    let activity = match scheduled.get(call_id).map(|i| &history[*i]) {
                        Some(Event::ActivityScheduled { name, .. }) => name.clone(),
                        _ => String::new(),
                    };
                    outcomes.entry(*call_id).or_insert_with(|| {
                        CallOutcome::Failed(ActivityFailure {
                            activity,
                            call_id: *call_id,
                            attempts: *attempt,
                            message: error.clone(),
                        })
                    });
                }
                Event::TimerFired { timer_id, .. } => {
                    outcomes.entry(*timer_id).or_insert(CallOutcome::Fired);
                }
                _ => {}
            }
        }
        Self {
            instance_id,
            history,
            scheduled,
            outcomes,
            last_recorded_call_id,
            next_call_id: INITIAL_CALL_ID,
            claimed: HashSet::new(),
            staged_events: Vec::new(),
            commands: Vec::new(),
            nondeterminism: None,
            now_ms,
        }
    }

    fn take_call_id(&mut self) -> u64 {
        let id = self.next_call_id;
        self.next_call_id += 1;
        self.claimed.insert(id);
        id
    }

    fn recorded(&self, call_id: u64) -> Option<&Event> {
        self.scheduled.get(&call_id).map(|idx| &self.history[*idx])
    }

    fn record_nondeterminism(&mut self, message: String) {
        // Keep the first divergence; later ones are usually knock-on effects
        if self.nondeterminism.is_none() {
            self.nondeterminism = Some(message);
        }
    }

    fn issue_activity(&mut self, name: String, input: String, retry_policy: Option<RetryPolicy>) -> u64 {
        let call_id = self.take_call_id();
        match self.recorded(call_id) {
            Some(Event::ActivityScheduled {
                name: recorded_name,
                input: recorded_input,
                ..
            }) => {
                if recorded_name != &name || recorded_input != &input {
                    let message = format!(
                        "call {call_id}: history has ActivityScheduled('{recorded_name}','{recorded_input}') but replay issued ActivityScheduled('{name}','{input}')"
                    );
                    self.record_nondeterminism(message);
                }
            }
            Some(other) => {
                let message = format!(
                    "call {call_id}: history has {} but replay issued ActivityScheduled('{name}','{input}')",
                    other.kind()
                );
                self.record_nondeterminism(message);
            }
            None => {
                self.staged_events.push(Event::ActivityScheduled {
                    call_id,
                    name: name.clone(),
                    input: input.clone(),
                    retry_policy: retry_policy.clone(),
                });
                self.commands.push(Command::ScheduleActivity {
                    call_id,
                    name,
                    input,
                    retry_policy,
                });
            }
        }
        call_id
    }

    fn issue_timer(&mut self, delay_ms: u64) -> u64 {
        let timer_id = self.take_call_id();
        match self.recorded(timer_id) {
            Some(Event::TimerCreated { .. }) => {}
            Some(other) => {
                let message = format!(
                    "call {timer_id}: history has {} but replay issued TimerCreated",
                    other.kind()
                );
                self.record_nondeterminism(message);
            }
            None => {
                let fire_at_ms = self.now_ms.saturating_add(delay_ms);
                self.staged_events.push(Event::TimerCreated { timer_id, fire_at_ms });
                self.commands.push(Command::CreateTimer { timer_id, fire_at_ms });
            }
        }
        timer_id
    }

    /// Recorded calls the current replay never re-issued.
    fn unclaimed_recorded_calls(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .scheduled
            .keys()
            .filter(|id| !self.claimed.contains(id))
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// User-facing orchestration context. Cheap to clone; every clone shares the
/// same replay cursor for the current decision cycle.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Build a context over `history` for one decision cycle. `now_ms` is the
    /// cycle's wall-clock time and is only used to place newly created timers.
    pub fn new(instance_id: impl Into<String>, history: Vec<Event>, now_ms: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance_id.into(), history, now_ms))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CtxInner> {
        // A panic inside orchestration code is caught by the engine; the cursor
        // itself is never left half-updated, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Identifier of the instance being replayed.
    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    /// True while the orchestration is re-executing calls that are already in
    /// history. Used to suppress duplicate log output during replay.
    pub fn is_replaying(&self) -> bool {
        let inner = self.lock();
        inner.next_call_id <= inner.last_recorded_call_id
    }

    /// Schedule an activity without retries (a single attempt).
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> ActivityFuture {
        let call_id = self.lock().issue_activity(name.into(), input.into(), None);
        ActivityFuture::new(self.clone(), call_id)
    }

    /// Schedule an activity whose failures are retried by the activity
    /// executor according to `policy`.
    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> ActivityFuture {
        let call_id = self.lock().issue_activity(name.into(), input.into(), Some(policy));
        ActivityFuture::new(self.clone(), call_id)
    }

    /// Typed variant of [`schedule_activity`](Self::schedule_activity); the
    /// input is JSON-encoded.
    pub fn schedule_activity_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<ActivityFuture, String> {
        use crate::_typed_codec::Codec;
        let payload = crate::_typed_codec::Json::encode(input)?;
        Ok(self.schedule_activity(name, payload))
    }

    /// Schedule a durable timer that fires `delay` after the current decision.
    pub fn schedule_timer(&self, delay: std::time::Duration) -> TimerFuture {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let timer_id = self.lock().issue_timer(delay_ms);
        TimerFuture::new(self.clone(), timer_id)
    }

    /// Wait for every future and return their results in submission order.
    /// Failures are handed back per call; nothing is propagated implicitly.
    pub fn join(&self, futures: Vec<ActivityFuture>) -> JoinFuture {
        JoinFuture::all(futures)
    }

    /// Wait only for the members at `indices` and return their results in
    /// submission order. Out-of-range indices are ignored.
    pub fn join_subset(&self, futures: Vec<ActivityFuture>, indices: &[usize]) -> JoinFuture {
        JoinFuture::subset(futures, indices)
    }

    /// Issue every call in the same decision cycle and wait for all of them.
    /// Resolves to the outputs in submission order, or to the first failure in
    /// submission order once every member is terminal.
    pub fn fan_out<I>(&self, calls: I) -> FanOutFuture
    where
        I: IntoIterator<Item = ActivityCall>,
    {
        let futures = calls
            .into_iter()
            .map(|call| match call.retry_policy {
                Some(policy) => self.schedule_activity_with_retry(call.name, call.input, policy),
                None => self.schedule_activity(call.name, call.input),
            })
            .collect();
        FanOutFuture::new(JoinFuture::all(futures))
    }

    pub(crate) fn outcome(&self, call_id: u64) -> Option<CallOutcome> {
        let inner = self.lock();
        if inner.nondeterminism.is_some() {
            return None;
        }
        inner.outcomes.get(&call_id).cloned()
    }

    pub(crate) fn take_nondeterminism(&self) -> Option<String> {
        self.lock().nondeterminism.take()
    }

    pub(crate) fn unclaimed_recorded_calls(&self) -> Vec<u64> {
        self.lock().unclaimed_recorded_calls()
    }

    pub(crate) fn take_staged(&self) -> (Vec<Event>, Vec<Command>) {
        let mut inner = self.lock();
        (std::mem::take(&mut inner.staged_events), std::mem::take(&mut inner.commands))
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn wall_clock_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
