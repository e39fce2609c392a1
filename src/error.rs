//! Error taxonomy.
//!
//! - [`Error`]: control-plane failures returned by the instance manager.
//! - [`ActivityFailure`]: an activity call that exhausted its retry policy;
//!   handed to orchestration code as a catchable value.
//! - [`FailureDetails`]: why an orchestration ended in `Failed`, recorded in
//!   history.

use serde::{Deserialize, Serialize};

use crate::providers::ProviderError;

/// Errors surfaced to callers of the instance manager. Never retried
/// automatically.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("instance already exists: {0}")]
    InstanceAlreadyExists(String),
    #[error("orchestration not registered: {0}")]
    UnknownOrchestration(String),
    #[error("invalid instance id '{id}': {reason}")]
    InvalidInstanceId { id: String, reason: String },
    #[error("timed out waiting for instance {0}")]
    Timeout(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// An activity call that ended in failure after its final attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("activity '{activity}' (call {call_id}) failed after {attempts} attempt(s): {message}")]
pub struct ActivityFailure {
    pub activity: String,
    pub call_id: u64,
    pub attempts: u32,
    pub message: String,
}

/// Lets orchestration bodies, which return `Result<String, String>`, propagate
/// an exhausted call with `?`.
impl From<ActivityFailure> for String {
    fn from(failure: ActivityFailure) -> Self {
        failure.to_string()
    }
}

/// Reason an orchestration failed. Stored in `OrchestratorFailed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum FailureDetails {
    /// The orchestration function returned `Err`.
    Application { message: String },
    /// Replay diverged from recorded history. Fatal to the instance.
    NonDeterminism { message: String },
    /// No orchestration is registered under the recorded name.
    Unregistered { orchestration: String },
    /// The orchestration function panicked.
    Panicked { message: String },
}

impl FailureDetails {
    pub fn display_message(&self) -> String {
        match self {
            FailureDetails::Application { message } => message.clone(),
            FailureDetails::NonDeterminism { message } => format!("nondeterministic: {message}"),
            FailureDetails::Unregistered { orchestration } => format!("unregistered:{orchestration}"),
            FailureDetails::Panicked { message } => format!("panicked: {message}"),
        }
    }
}

impl std::fmt::Display for FailureDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_message())
    }
}
