use std::sync::Arc;
use std::time::Duration;

use duraflow::samples::{self, HELLO_ACTIVITY, HELLO_ORCHESTRATION};
use duraflow::{
    ActivityContext, ActivityRegistry, Error, Event, InstanceStatus, OrchestrationContext, OrchestrationRegistry,
    Runtime,
};

mod common;

async fn hello_runtime() -> Arc<Runtime> {
    Runtime::start(samples::hello_activities(Duration::ZERO), samples::hello_orchestrations()).await
}

#[tokio::test]
async fn demo_instance_completes_with_thirty_pairs() {
    let rt = hello_runtime().await;
    let instances = rt.instances();
    let id = instances
        .schedule(Some("demo-1".into()), HELLO_ORCHESTRATION, "")
        .await
        .unwrap();
    assert_eq!(id, "demo-1");

    let snapshot = instances
        .wait_for_completion("demo-1", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert_eq!(snapshot.output.as_deref(), Some("Done"));

    let history = &snapshot.history;
    let scheduled = common::scheduled_names(history);
    assert_eq!(scheduled.len(), 30);
    assert!(scheduled.iter().all(|n| n == HELLO_ACTIVITY));
    assert_eq!(common::count(history, |e| matches!(e, Event::ActivityCompleted { .. })), 30);
    for call_id in 1..=30 {
        assert_eq!(common::terminal_events_for(history, call_id), 1, "call {call_id}");
    }
    assert_eq!(
        common::count(history, |e| matches!(e, Event::OrchestratorCompleted { .. })),
        1
    );
    assert!(snapshot.completed_at_ms.is_some());
    assert!(snapshot.last_event_at_ms >= snapshot.completed_at_ms);
    rt.shutdown().await;
}

#[tokio::test]
async fn scheduling_same_id_twice_is_rejected() {
    let rt = hello_runtime().await;
    let instances = rt.instances();
    instances
        .schedule(Some("demo-1".into()), HELLO_ORCHESTRATION, "first")
        .await
        .unwrap();
    let err = instances
        .schedule(Some("demo-1".into()), HELLO_ORCHESTRATION, "second")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InstanceAlreadyExists(ref id) if id == "demo-1"), "{err}");

    // The first instance keeps its input and runs to completion
    let snapshot = instances
        .wait_for_completion("demo-1", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(snapshot.input, "first");
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    rt.shutdown().await;
}

#[tokio::test]
async fn unknown_instance_is_not_found() {
    let rt = hello_runtime().await;
    let instances = rt.instances();
    let err = instances.get_state("never-scheduled").await.unwrap_err();
    assert!(matches!(err, Error::InstanceNotFound(ref id) if id == "never-scheduled"));
    let err = instances.terminate("never-scheduled", "x").await.unwrap_err();
    assert!(matches!(err, Error::InstanceNotFound(_)));
    rt.shutdown().await;
}

#[tokio::test]
async fn schedule_validates_name_and_id() {
    let rt = hello_runtime().await;
    let instances = rt.instances();
    let err = instances.schedule(None, "no-such-flow", "").await.unwrap_err();
    assert!(matches!(err, Error::UnknownOrchestration(_)));
    let err = instances
        .schedule(Some("../etc".into()), HELLO_ORCHESTRATION, "")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInstanceId { .. }));
    assert!(instances.list_instances().await.unwrap().is_empty());
    rt.shutdown().await;
}

#[tokio::test]
async fn generated_ids_are_prefixed_and_unique() {
    let rt = hello_runtime().await;
    let instances = rt.instances();
    let a = instances.schedule(None, HELLO_ORCHESTRATION, "").await.unwrap();
    let b = instances.schedule(None, HELLO_ORCHESTRATION, "").await.unwrap();
    assert_ne!(a, b);
    assert!(a.starts_with("hello-"), "{a}");
    let mut listed = instances.list_instances().await.unwrap();
    listed.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(listed, expected);
    rt.shutdown().await;
}

fn blocking_runtime_parts() -> (Arc<ActivityRegistry>, OrchestrationRegistry) {
    let activities = ActivityRegistry::builder()
        .register("Wait", |_ctx: ActivityContext, _input: String| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("waited".to_string())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("steps", |ctx: OrchestrationContext, _input: String| async move {
            for _ in 0..5 {
                ctx.schedule_activity("Wait", "").await?;
            }
            Ok("all steps".to_string())
        })
        .build();
    (Arc::new(activities), orchestrations)
}

#[tokio::test]
async fn terminate_stops_further_scheduling() {
    let (activities, orchestrations) = blocking_runtime_parts();
    let rt = Runtime::start(activities, orchestrations).await;
    let store = rt.store();
    let instances = rt.instances();
    instances.schedule(Some("term-1".into()), "steps", "").await.unwrap();
    assert!(common::wait_for_history(&store, "term-1", |h| !common::scheduled_names(h).is_empty(), 2_000).await);

    instances.terminate("term-1", "operator request").await.unwrap();
    let snapshot = instances.get_state("term-1").await.unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Terminated);
    assert_eq!(snapshot.termination_reason.as_deref(), Some("operator request"));

    // The in-flight call finishes but nothing is recorded after termination
    tokio::time::sleep(Duration::from_millis(400)).await;
    let history = store.read("term-1").await.unwrap();
    assert!(matches!(history.last(), Some(Event::OrchestratorTerminated { .. })));
    assert_eq!(common::scheduled_names(&history).len(), 1);

    // Terminating again is a no-op
    instances.terminate("term-1", "again").await.unwrap();
    assert_eq!(store.read("term-1").await.unwrap().len(), history.len());
    rt.shutdown().await;
}

#[tokio::test]
async fn wait_for_completion_times_out() {
    let (activities, orchestrations) = blocking_runtime_parts();
    let rt = Runtime::start(activities, orchestrations).await;
    let instances = rt.instances();
    instances.schedule(Some("slow-1".into()), "steps", "").await.unwrap();
    let err = instances
        .wait_for_completion("slow-1", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(ref id) if id == "slow-1"));
    rt.shutdown().await;
}

#[tokio::test]
async fn durable_timer_resumes_orchestration() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("sleepy", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_timer(Duration::from_millis(50)).await;
            let out = ctx.schedule_activity("Wait", "").await?;
            Ok(format!("after timer: {out}"))
        })
        .build();
    let (activities, _) = blocking_runtime_parts();
    let rt = Runtime::start(activities, orchestrations).await;
    let instances = rt.instances();
    instances.schedule(Some("timer-1".into()), "sleepy", "").await.unwrap();
    let snapshot = instances
        .wait_for_completion("timer-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    assert_eq!(snapshot.output.as_deref(), Some("after timer: waited"));
    // Timer and activity share one call id sequence
    assert!(matches!(snapshot.history[1], Event::TimerCreated { timer_id: 1, .. }));
    assert!(
        snapshot
            .history
            .iter()
            .any(|e| matches!(e, Event::ActivityScheduled { call_id: 2, .. }))
    );
    rt.shutdown().await;
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Order {
    qty: u32,
    unit_cents: u64,
}

#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct Receipt {
    total_cents: u64,
    label: String,
}

#[tokio::test]
async fn typed_orchestration_round_trips_json_end_to_end() {
    let activities = ActivityRegistry::builder()
        .register_typed("Price", |_ctx: ActivityContext, order: Order| async move {
            Ok(u64::from(order.qty) * order.unit_cents)
        })
        // Plain string payloads travel unquoted to string handlers
        .register("Label", |_ctx: ActivityContext, input: String| async move { Ok(format!("[{input}]")) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register_typed("quote", |ctx: OrchestrationContext, order: Order| async move {
            let total_cents: u64 = ctx.schedule_activity_typed("Price", &order)?.into_typed().await?;
            let label: String = ctx.schedule_activity_typed("Label", &"order")?.into_typed().await?;
            Ok(Receipt { total_cents, label })
        })
        .build();
    let rt = Runtime::start(Arc::new(activities), orchestrations).await;
    let instances = rt.instances();
    instances
        .schedule(Some("quote-1".into()), "quote", r#"{"qty":3,"unit_cents":250}"#)
        .await
        .unwrap();
    let snapshot = instances
        .wait_for_completion("quote-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Completed);
    let receipt: Receipt = serde_json::from_str(snapshot.output.as_deref().unwrap()).unwrap();
    assert_eq!(
        receipt,
        Receipt {
            total_cents: 750,
            label: "[order]".into()
        }
    );
    assert!(
        snapshot
            .history
            .iter()
            .any(|e| matches!(e, Event::ActivityScheduled { call_id: 2, input, .. } if input == "order"))
    );

    // Undecodable input fails the instance instead of panicking
    instances
        .schedule(Some("quote-2".into()), "quote", "not json")
        .await
        .unwrap();
    let snapshot = instances
        .wait_for_completion("quote-2", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(snapshot.status, InstanceStatus::Failed);
    rt.shutdown().await;
}
