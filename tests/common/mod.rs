#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use duraflow::Event;
use duraflow::providers::HistoryStore;
use duraflow::providers::in_memory::InMemoryHistoryStore;

pub fn memory_store() -> Arc<dyn HistoryStore> {
    Arc::new(InMemoryHistoryStore::new())
}

/// Poll the store until `predicate` holds for the instance's history.
pub async fn wait_for_history<F>(store: &Arc<dyn HistoryStore>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(history) = store.read(instance).await
            && predicate(&history)
        {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn count<F>(history: &[Event], f: F) -> usize
where
    F: Fn(&Event) -> bool,
{
    history.iter().filter(|e| f(e)).count()
}

pub fn scheduled_names(history: &[Event]) -> Vec<String> {
    history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { name, .. } => Some(name.clone()),
            _ => None,
        })
        .collect()
}

/// Terminal events per call id, for asserting at-most-one-outcome.
pub fn terminal_events_for(history: &[Event], call_id: u64) -> usize {
    count(history, |e| e.is_call_terminal() && e.call_id() == Some(call_id))
}
