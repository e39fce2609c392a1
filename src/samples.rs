//! Hello-world workload served by the binary: ten rounds of three parallel
//! greetings, each call retried with the default [`RetryPolicy`].

use std::sync::Arc;
use std::time::Duration;

use crate::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
use crate::runtime::ActivityContext;
use crate::{ActivityCall, OrchestrationContext, RetryPolicy, durable_error, durable_info};

pub const HELLO_ORCHESTRATION: &str = "hello";
pub const HELLO_ACTIVITY: &str = "hello_world_activity";
pub const HELLO_ROUNDS: usize = 10;
pub const HELLO_FAN_OUT: usize = 3;

/// Ten sequential rounds; each round fans out three greetings and waits for
/// all of them before starting the next.
pub async fn hello_world_workflow(ctx: OrchestrationContext, _input: String) -> Result<String, String> {
    durable_info!(ctx, "starting hello world workflow");
    for round in 0..HELLO_ROUNDS {
        let calls = (0..HELLO_FAN_OUT).map(|_| ActivityCall::new(HELLO_ACTIVITY, "").with_retry_policy(RetryPolicy::default()));
        match ctx.fan_out(calls).await {
            Ok(greetings) => durable_info!(ctx, round, count = greetings.len(), "round finished"),
            Err(failure) => {
                durable_error!(ctx, round, error = %failure, "round failed");
                return Err(failure.into());
            }
        }
    }
    Ok("Done".to_string())
}

/// Greets with the current local time after `delay`.
pub async fn hello_world_activity(ctx: ActivityContext, delay: Duration) -> Result<String, String> {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let message = format!("Hello world! - {timestamp}");
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    tracing::info!(
        instance = %ctx.instance_id(),
        call_id = ctx.call_id(),
        attempt = ctx.attempt(),
        "{message}"
    );
    Ok(message)
}

pub fn hello_orchestrations() -> OrchestrationRegistry {
    OrchestrationRegistry::builder()
        .register(HELLO_ORCHESTRATION, hello_world_workflow)
        .build()
}

pub fn hello_activities(delay: Duration) -> Arc<ActivityRegistry> {
    let registry = ActivityRegistry::builder()
        .register(HELLO_ACTIVITY, move |ctx: ActivityContext, _input: String| hello_world_activity(ctx, delay))
        .build();
    Arc::new(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn activity_greets_with_timestamp() {
        let ctx = ActivityContext::new("hello-1", 1, HELLO_ACTIVITY, 1);
        let message = hello_world_activity(ctx, Duration::ZERO).await.unwrap();
        assert!(message.starts_with("Hello world! - "), "{message}");
    }

    #[tokio::test]
    async fn failing_round_fails_the_workflow() {
        let activities = ActivityRegistry::builder()
            .register(HELLO_ACTIVITY, |_ctx: ActivityContext, _input: String| async move {
                Err::<String, String>("greeting service down".to_string())
            })
            .build();
        let store: Arc<dyn crate::providers::HistoryStore> = Arc::new(crate::providers::in_memory::InMemoryHistoryStore::new());
        let rt = crate::Runtime::start_with_options(
            store,
            Arc::new(activities),
            hello_orchestrations(),
            Arc::new(crate::runtime::VirtualClock::new(0)),
            crate::RuntimeOptions::default(),
        )
        .await;
        rt.instances()
            .schedule(Some("hello-fail".into()), HELLO_ORCHESTRATION, "")
            .await
            .unwrap();
        let snapshot = rt
            .instances()
            .wait_for_completion("hello-fail", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(snapshot.status, crate::InstanceStatus::Failed);
        // The first round never finishes, so no second round is scheduled
        let scheduled = snapshot
            .history
            .iter()
            .filter(|e| matches!(e, crate::Event::ActivityScheduled { .. }))
            .count();
        assert_eq!(scheduled, HELLO_FAN_OUT);
        rt.shutdown().await;
    }

    #[test]
    fn registries_contain_the_sample() {
        assert!(hello_orchestrations().has(HELLO_ORCHESTRATION));
        assert!(hello_activities(Duration::ZERO).has(HELLO_ACTIVITY));
    }
}
