use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::registry::OrchestrationRegistry;
use super::status::{InstanceSnapshot, InstanceStatus};
use super::{DecisionQueue, InstanceLocks, append_with_retry};
use crate::Event;
use crate::error::Error;
use crate::providers::{HistoryStore, InstanceMetadata, ProviderError, ProviderErrorKind};

const MAX_INSTANCE_ID_LEN: usize = 128;

/// Control-plane entry point: creates instances, reports their state and
/// terminates them. Cheap to clone.
#[derive(Clone)]
pub struct InstanceManager {
    store: Arc<dyn HistoryStore>,
    orchestrations: Arc<OrchestrationRegistry>,
    decisions: DecisionQueue,
    locks: InstanceLocks,
    poll_interval: Duration,
}

impl InstanceManager {
    pub(crate) fn new(
        store: Arc<dyn HistoryStore>,
        orchestrations: Arc<OrchestrationRegistry>,
        decisions: DecisionQueue,
        locks: InstanceLocks,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            orchestrations,
            decisions,
            locks,
            poll_interval,
        }
    }

    /// Create an instance of `orchestration` and queue its first decision.
    /// Without an explicit id, one is generated as `{orchestration}-{uuid}`.
    ///
    /// # Errors
    ///
    /// `UnknownOrchestration` if no handler is registered under the name,
    /// `InvalidInstanceId` for ids that are empty, too long or contain
    /// characters outside `[A-Za-z0-9_.:-]`, and `InstanceAlreadyExists` if
    /// the id is taken. A rejected call leaves existing instances untouched.
    pub async fn schedule(
        &self,
        instance_id: Option<String>,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<String, Error> {
        if !self.orchestrations.has(orchestration) {
            return Err(Error::UnknownOrchestration(orchestration.to_string()));
        }
        let instance_id = match instance_id {
            Some(id) => {
                validate_instance_id(&id)?;
                id
            }
            None => format!("{orchestration}-{}", uuid::Uuid::new_v4()),
        };
        let metadata = InstanceMetadata {
            instance_id: instance_id.clone(),
            orchestration: orchestration.to_string(),
            input: input.into(),
            created_at_ms: crate::wall_clock_ms(),
        };
        self.store
            .create_instance(metadata)
            .await
            .map_err(|e| match e.kind {
                ProviderErrorKind::AlreadyExists => Error::InstanceAlreadyExists(instance_id.clone()),
                _ => Error::Provider(e),
            })?;
        info!(instance = %instance_id, orchestration, "instance scheduled");
        self.decisions.request(&instance_id);
        Ok(instance_id)
    }

    /// Snapshot as of the store's last append. Never waits for a running
    /// decision cycle.
    pub async fn get_state(&self, instance_id: &str) -> Result<InstanceSnapshot, Error> {
        let record = self
            .store
            .load(instance_id)
            .await
            .map_err(|e| not_found_or(e, instance_id))?;
        Ok(InstanceSnapshot::from_record(record))
    }

    /// Record `OrchestratorTerminated`. Activities already running finish
    /// but their outcomes are discarded and no new calls are scheduled.
    /// Terminating a finished instance is a no-op.
    pub async fn terminate(&self, instance_id: &str, reason: impl Into<String>) -> Result<(), Error> {
        let _guard = self.locks.acquire(instance_id).await;
        let history = self
            .store
            .read(instance_id)
            .await
            .map_err(|e| not_found_or(e, instance_id))?;
        if InstanceStatus::from_history(&history).is_terminal() {
            return Ok(());
        }
        let reason = reason.into();
        append_with_retry(
            self.store.as_ref(),
            instance_id,
            vec![Event::OrchestratorTerminated { reason: reason.clone() }],
        )
        .await?;
        info!(instance = %instance_id, %reason, "instance terminated");
        Ok(())
    }

    /// Poll until the instance reaches a terminal status or `timeout` elapses.
    pub async fn wait_for_completion(&self, instance_id: &str, timeout: Duration) -> Result<InstanceSnapshot, Error> {
        let wait = async {
            loop {
                let snapshot = self.get_state(instance_id).await?;
                if snapshot.status.is_terminal() {
                    return Ok(snapshot);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(instance_id.to_string())),
        }
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, Error> {
        Ok(self.store.list_instances().await?)
    }

    /// Names of the orchestrations that can be scheduled.
    pub fn orchestrations(&self) -> Vec<String> {
        self.orchestrations.list_names()
    }
}

fn not_found_or(e: ProviderError, instance_id: &str) -> Error {
    if e.is_not_found() {
        Error::InstanceNotFound(instance_id.to_string())
    } else {
        Error::Provider(e)
    }
}

fn validate_instance_id(id: &str) -> Result<(), Error> {
    let invalid = |reason: &str| Error::InvalidInstanceId {
        id: id.to_string(),
        reason: reason.to_string(),
    };
    if id.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if id.len() > MAX_INSTANCE_ID_LEN {
        return Err(invalid("longer than 128 characters"));
    }
    if id == "." || id == ".." {
        return Err(invalid("reserved name"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
    {
        return Err(invalid("allowed characters are A-Z a-z 0-9 _ . : -"));
    }
    Ok(())
}
