use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::Event;

pub mod error;
/// Filesystem-backed provider for local development and restart recovery.
pub mod fs;
/// In-memory provider for tests and the default binary mode.
pub mod in_memory;

pub use error::{ProviderError, ProviderErrorKind};

/// Immutable facts recorded when an instance is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub instance_id: String,
    pub orchestration: String,
    pub input: String,
    pub created_at_ms: u64,
}

/// History entry as persisted: the event plus the wall-clock time it was
/// accepted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub recorded_at_ms: u64,
    pub event: Event,
}

/// Everything a store knows about one instance.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub metadata: InstanceMetadata,
    pub events: Vec<StoredEvent>,
}

impl InstanceRecord {
    pub fn history(&self) -> Vec<Event> {
        self.events.iter().map(|stored| stored.event.clone()).collect()
    }
}

/// Storage abstraction for append-only orchestration history per instance.
///
/// Stores are datastores only; the runtime owns queues and workers. Every
/// implementation applies the same admission rules on `append` (see
/// [`Admission`]), which is what guarantees at most one terminal event per
/// call id even when an activity is executed twice.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create a new, empty instance. Fails with `AlreadyExists` if the id is taken.
    async fn create_instance(&self, metadata: InstanceMetadata) -> Result<(), ProviderError>;

    /// Metadata and full history of an instance.
    async fn load(&self, instance: &str) -> Result<InstanceRecord, ProviderError>;

    /// Full history of an instance in append order.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        Ok(self.load(instance).await?.history())
    }

    /// Append events atomically with respect to other appends on the same
    /// instance. Events rejected by the admission rules are skipped; returns
    /// how many were actually written.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<usize, ProviderError>;

    /// Enumerate known instances.
    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    /// Remove an instance and its history.
    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError>;
}

/// Append-time dedup state for one instance.
///
/// Rules, applied per event in order:
/// - nothing is admitted after an orchestrator terminal event
/// - `OrchestratorStarted` and each scheduling event are admitted once
/// - a call outcome needs a prior scheduling event for that call id
/// - each call gets at most one terminal outcome
/// - non-terminal `ActivityFailed` is admitted once per (call id, attempt)
#[derive(Debug, Default)]
pub(crate) struct Admission {
    started: bool,
    finished: bool,
    scheduled: HashSet<u64>,
    terminal: HashSet<u64>,
    attempts: HashSet<(u64, u32)>,
}

impl Admission {
    pub(crate) fn from_history<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut admission = Self::default();
        for event in events {
            admission.admit(event);
        }
        admission
    }

    /// Decide whether `event` may be appended and record it if so.
    pub(crate) fn admit(&mut self, event: &Event) -> bool {
        if self.finished {
            return false;
        }
        match event {
            Event::OrchestratorStarted { .. } => !std::mem::replace(&mut self.started, true),
            Event::ActivityScheduled { call_id, .. } | Event::TimerCreated { timer_id: call_id, .. } => {
                self.scheduled.insert(*call_id)
            }
            Event::ActivityFailed {
                call_id,
                attempt,
                exhausted: false,
                ..
            } => {
                self.scheduled.contains(call_id)
                    && !self.terminal.contains(call_id)
                    && self.attempts.insert((*call_id, *attempt))
            }
            Event::ActivityCompleted { call_id, .. }
            | Event::ActivityFailed { call_id, .. }
            | Event::TimerFired { timer_id: call_id, .. } => {
                self.scheduled.contains(call_id) && self.terminal.insert(*call_id)
            }
            Event::OrchestratorCompleted { .. }
            | Event::OrchestratorFailed { .. }
            | Event::OrchestratorTerminated { .. } => {
                self.finished = true;
                true
            }
        }
    }
}
