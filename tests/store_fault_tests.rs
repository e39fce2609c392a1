use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use duraflow::providers::in_memory::InMemoryHistoryStore;
use duraflow::providers::{HistoryStore, InstanceMetadata, InstanceRecord, ProviderError};
use duraflow::runtime::SystemClock;
use duraflow::{
    ActivityContext, ActivityRegistry, Event, InstanceStatus, OrchestrationContext, OrchestrationRegistry,
    RetryPolicy, Runtime, RuntimeOptions,
};

mod common;

/// Wraps the in-memory store and fails the first `failures` appends that
/// carry an event matching `trigger` with a retryable I/O error.
struct FlakyStore {
    inner: InMemoryHistoryStore,
    trigger: fn(&Event) -> bool,
    failures: AtomicU32,
}

impl FlakyStore {
    fn new(failures: u32, trigger: fn(&Event) -> bool) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryHistoryStore::new(),
            trigger,
            failures: AtomicU32::new(failures),
        })
    }

    fn failures_left(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl HistoryStore for FlakyStore {
    async fn create_instance(&self, metadata: InstanceMetadata) -> Result<(), ProviderError> {
        self.inner.create_instance(metadata).await
    }

    async fn load(&self, instance: &str) -> Result<InstanceRecord, ProviderError> {
        self.inner.load(instance).await
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<usize, ProviderError> {
        if new_events.iter().any(self.trigger)
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(ProviderError::io("append", "disk unavailable"));
        }
        self.inner.append(instance, new_events).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_instances().await
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        self.inner.remove_instance(instance).await
    }
}

fn is_activity_completed(event: &Event) -> bool {
    matches!(event, Event::ActivityCompleted { .. })
}

fn is_orchestrator_completed(event: &Event) -> bool {
    matches!(event, Event::OrchestratorCompleted { .. })
}

fn two_steps() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register("two_steps", |ctx: OrchestrationContext, input: String| async move {
            let first = ctx.schedule_activity("Step", format!("{input}-1")).await?;
            let second = ctx.schedule_activity("Step", format!("{input}-2")).await?;
            Ok(format!("{first}+{second}"))
        })
        .build()
}

fn counted_step(runs: Arc<AtomicU32>) -> Arc<ActivityRegistry> {
    Arc::new(
        ActivityRegistry::builder()
            .register("Step", move |_ctx: ActivityContext, input: String| {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("did:{input}"))
                }
            })
            .build(),
    )
}

async fn run_two_steps(store: Arc<FlakyStore>, runs: Arc<AtomicU32>) -> duraflow::InstanceSnapshot {
    let rt = Runtime::start_with_store(store, counted_step(runs), two_steps()).await;
    rt.instances()
        .schedule(Some("flaky-1".into()), "two_steps", "job")
        .await
        .unwrap();
    let snapshot = rt
        .instances()
        .wait_for_completion("flaky-1", Duration::from_secs(10))
        .await
        .unwrap();
    rt.shutdown().await;
    snapshot
}

#[tokio::test]
async fn transient_outcome_append_failure_is_retried() {
    let store = FlakyStore::new(1, is_activity_completed);
    let runs = Arc::new(AtomicU32::new(0));
    let snapshot = run_two_steps(store.clone(), runs.clone()).await;

    assert_eq!(store.failures_left(), 0);
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert_eq!(snapshot.output.as_deref(), Some("did:job-1+did:job-2"));
    // The backoff retry reuses the output; the activity is not rerun
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn outcome_is_requeued_once_append_retries_run_out() {
    let store = FlakyStore::new(8, is_activity_completed);
    let runs = Arc::new(AtomicU32::new(0));
    let snapshot = run_two_steps(store.clone(), runs.clone()).await;

    assert_eq!(store.failures_left(), 0);
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert!(runs.load(Ordering::SeqCst) > 2);
    for call_id in 1..=2 {
        assert_eq!(common::terminal_events_for(&snapshot.history, call_id), 1);
    }
}

#[tokio::test]
async fn failed_decision_append_is_requeued() {
    let store = FlakyStore::new(8, is_orchestrator_completed);
    let runs = Arc::new(AtomicU32::new(0));
    let snapshot = run_two_steps(store.clone(), runs.clone()).await;

    assert_eq!(store.failures_left(), 0);
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(
        common::count(&snapshot.history, |e| matches!(e, Event::OrchestratorCompleted { .. })),
        1
    );
}

#[tokio::test]
async fn backoff_does_not_hold_an_activity_slot() {
    let activities = ActivityRegistry::builder()
        .register("Failing", |_ctx: ActivityContext, _input: String| async move {
            Err::<String, String>("not yet".to_string())
        })
        .register("Quick", |_ctx: ActivityContext, _input: String| async move { Ok("quick".to_string()) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("mixed", |ctx: OrchestrationContext, _input: String| async move {
            let policy = RetryPolicy::new(2).with_first_retry_interval(Duration::from_secs(2));
            let results = ctx
                .join(vec![
                    ctx.schedule_activity_with_retry("Failing", "", policy),
                    ctx.schedule_activity("Quick", ""),
                ])
                .await;
            Ok(format!("{}", results.iter().filter(|r| r.is_ok()).count()))
        })
        .build();
    let store = common::memory_store();
    let options = RuntimeOptions {
        max_concurrent_activities: 1,
        ..Default::default()
    };
    let rt = Runtime::start_with_options(
        store.clone(),
        Arc::new(activities),
        orchestrations,
        Arc::new(SystemClock),
        options,
    )
    .await;
    rt.instances().schedule(Some("mixed-1".into()), "mixed", "").await.unwrap();

    // With one slot, Quick completes while Failing waits out its backoff
    let quick_done = common::wait_for_history(
        &store,
        "mixed-1",
        |h| h.iter().any(|e| matches!(e, Event::ActivityCompleted { call_id: 2, .. })),
        1_000,
    )
    .await;
    assert!(quick_done);
    let history = store.read("mixed-1").await.unwrap();
    assert_eq!(common::terminal_events_for(&history, 1), 0);
    rt.shutdown().await;
}
