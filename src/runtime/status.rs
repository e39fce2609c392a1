use serde::Serialize;

use crate::providers::InstanceRecord;
use crate::{Event, FailureDetails};

/// Lifecycle state of an orchestration instance, derived from its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InstanceStatus {
    /// Created; no decision cycle has run yet.
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl InstanceStatus {
    pub fn from_history<'a>(history: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut status = InstanceStatus::Pending;
        for event in history {
            match event {
                Event::OrchestratorStarted { .. } => status = InstanceStatus::Running,
                Event::OrchestratorCompleted { .. } => return InstanceStatus::Completed,
                Event::OrchestratorFailed { .. } => return InstanceStatus::Failed,
                Event::OrchestratorTerminated { .. } => return InstanceStatus::Terminated,
                _ => {}
            }
        }
        status
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Terminated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "Pending",
            InstanceStatus::Running => "Running",
            InstanceStatus::Completed => "Completed",
            InstanceStatus::Failed => "Failed",
            InstanceStatus::Terminated => "Terminated",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of an instance as of the store's last append.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub orchestration: String,
    pub input: String,
    pub status: InstanceStatus,
    pub history: Vec<Event>,
    pub created_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub last_event_at_ms: Option<u64>,
    pub output: Option<String>,
    pub error: Option<FailureDetails>,
    /// Reason given to `terminate`, if the instance was terminated.
    pub termination_reason: Option<String>,
}

impl InstanceSnapshot {
    pub fn from_record(record: InstanceRecord) -> Self {
        let status = InstanceStatus::from_history(record.events.iter().map(|s| &s.event));
        let mut completed_at_ms = None;
        let mut output = None;
        let mut error = None;
        let mut termination_reason = None;
        for stored in &record.events {
            match &stored.event {
                Event::OrchestratorCompleted { result } => output = Some(result.clone()),
                Event::OrchestratorFailed { error: details } => error = Some(details.clone()),
                Event::OrchestratorTerminated { reason } => termination_reason = Some(reason.clone()),
                _ => continue,
            }
            completed_at_ms = Some(stored.recorded_at_ms);
        }
        let last_event_at_ms = record.events.last().map(|s| s.recorded_at_ms);
        let history = record.history();
        Self {
            instance_id: record.metadata.instance_id,
            orchestration: record.metadata.orchestration,
            input: record.metadata.input,
            status,
            history,
            created_at_ms: record.metadata.created_at_ms,
            completed_at_ms,
            last_event_at_ms,
            output,
            error,
            termination_reason,
        }
    }
}
