use std::collections::HashMap;

use tokio::sync::Mutex;

use super::{Admission, HistoryStore, InstanceMetadata, InstanceRecord, ProviderError, StoredEvent};
use crate::Event;

struct Entry {
    metadata: InstanceMetadata,
    events: Vec<StoredEvent>,
    admission: Admission,
}

/// Process-local history store. Histories are lost when the process exits.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<HashMap<String, Entry>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(&self, metadata: InstanceMetadata) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        if g.contains_key(&metadata.instance_id) {
            return Err(ProviderError::already_exists("create_instance", &metadata.instance_id));
        }
        g.insert(
            metadata.instance_id.clone(),
            Entry {
                metadata,
                events: Vec::new(),
                admission: Admission::default(),
            },
        );
        Ok(())
    }

    async fn load(&self, instance: &str) -> Result<InstanceRecord, ProviderError> {
        let g = self.inner.lock().await;
        let entry = g.get(instance).ok_or_else(|| ProviderError::not_found("load", instance))?;
        Ok(InstanceRecord {
            metadata: entry.metadata.clone(),
            events: entry.events.clone(),
        })
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<usize, ProviderError> {
        let mut g = self.inner.lock().await;
        let entry = g
            .get_mut(instance)
            .ok_or_else(|| ProviderError::not_found("append", instance))?;
        let recorded_at_ms = crate::wall_clock_ms();
        let mut written = 0;
        for event in new_events {
            if !entry.admission.admit(&event) {
                tracing::debug!(target: "duraflow::providers", instance, kind = event.kind(), "dropping duplicate or late event");
                continue;
            }
            entry.events.push(StoredEvent { recorded_at_ms, event });
            written += 1;
        }
        Ok(written)
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let mut ids: Vec<String> = self.inner.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        match self.inner.lock().await.remove(instance) {
            Some(_) => Ok(()),
            None => Err(ProviderError::not_found("remove_instance", instance)),
        }
    }
}
