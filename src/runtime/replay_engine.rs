use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use tracing::{debug, warn};

use crate::runtime::OrchestrationHandler;
use crate::{Command, Event, FailureDetails, OrchestrationContext};

/// Result of executing an orchestration turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnResult {
    /// The orchestration is suspended on at least one call without an outcome
    Continue,
    /// Orchestration completed with output
    Completed(String),
    /// Orchestration failed with error details
    Failed(FailureDetails),
}

/// Everything one decision cycle produced. `new_events` must be made durable
/// before any of `commands` is dispatched.
#[derive(Debug, Clone)]
pub struct Decision {
    pub new_events: Vec<Event>,
    pub commands: Vec<Command>,
    pub outcome: TurnResult,
}

/// Replays history and executes one deterministic orchestration evaluation.
pub struct ReplayEngine {
    instance: String,
    orchestration: String,
    input: String,
    baseline_history: Vec<Event>,
    now_ms: u64,
}

impl ReplayEngine {
    pub fn new(
        instance: impl Into<String>,
        orchestration: impl Into<String>,
        input: impl Into<String>,
        baseline_history: Vec<Event>,
        now_ms: u64,
    ) -> Self {
        Self {
            instance: instance.into(),
            orchestration: orchestration.into(),
            input: input.into(),
            baseline_history,
            now_ms,
        }
    }

    fn started_event(&self) -> Option<Event> {
        let started = self
            .baseline_history
            .iter()
            .any(|e| matches!(e, Event::OrchestratorStarted { .. }));
        (!started).then(|| Event::OrchestratorStarted {
            name: self.orchestration.clone(),
            input: self.input.clone(),
        })
    }

    /// Decision for an instance whose orchestration name has no handler.
    pub fn unregistered(&self) -> Decision {
        warn!(instance = %self.instance, orchestration = %self.orchestration, "orchestration not registered");
        self.finish(TurnResult::Failed(FailureDetails::Unregistered {
            orchestration: self.orchestration.clone(),
        }))
    }

    /// Terminal decision: only the start marker (if missing) and the
    /// terminal event are recorded; anything staged this cycle is dropped.
    fn finish(&self, outcome: TurnResult) -> Decision {
        let mut new_events: Vec<Event> = self.started_event().into_iter().collect();
        match &outcome {
            TurnResult::Completed(result) => new_events.push(Event::OrchestratorCompleted { result: result.clone() }),
            TurnResult::Failed(error) => new_events.push(Event::OrchestratorFailed { error: error.clone() }),
            TurnResult::Continue => {}
        }
        Decision {
            new_events,
            commands: Vec::new(),
            outcome,
        }
    }

    /// Run the orchestration from the top against the baseline history and
    /// poll it exactly once.
    pub fn execute(&self, handler: Arc<dyn OrchestrationHandler>) -> Decision {
        debug!(
            instance = %self.instance,
            history_len = self.baseline_history.len(),
            "executing orchestration turn"
        );
        let ctx = OrchestrationContext::new(self.instance.clone(), self.baseline_history.clone(), self.now_ms);

        let run_result = catch_unwind(AssertUnwindSafe(|| {
            let mut fut = handler.invoke(ctx.clone(), self.input.clone());
            let mut cx = Context::from_waker(Waker::noop());
            fut.as_mut().poll(&mut cx)
        }));

        let polled = match run_result {
            Ok(polled) => polled,
            Err(panic_payload) => {
                let message = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "orchestration panicked".to_string()
                };
                warn!(instance = %self.instance, %message, "orchestration panicked");
                return self.finish(TurnResult::Failed(FailureDetails::Panicked { message }));
            }
        };

        if let Some(message) = ctx.take_nondeterminism() {
            warn!(instance = %self.instance, %message, "nondeterminism detected");
            return self.finish(TurnResult::Failed(FailureDetails::NonDeterminism { message }));
        }

        // Outcomes only accumulate, so a faithful replay always re-issues every
        // recorded call before it suspends or returns.
        let unclaimed = ctx.unclaimed_recorded_calls();
        if !unclaimed.is_empty() {
            let message = format!("history holds calls {unclaimed:?} that the orchestration did not issue on replay");
            warn!(instance = %self.instance, %message, "nondeterminism detected");
            return self.finish(TurnResult::Failed(FailureDetails::NonDeterminism { message }));
        }

        match polled {
            Poll::Ready(Ok(result)) => self.finish(TurnResult::Completed(result)),
            Poll::Ready(Err(message)) => self.finish(TurnResult::Failed(FailureDetails::Application { message })),
            Poll::Pending => {
                let (staged_events, commands) = ctx.take_staged();
                let mut new_events: Vec<Event> = self.started_event().into_iter().collect();
                new_events.extend(staged_events);
                Decision {
                    new_events,
                    commands,
                    outcome: TurnResult::Continue,
                }
            }
        }
    }
}

/// Commands a single decision over `history` would produce. Two calls with
/// the same arguments return identical commands for a deterministic
/// orchestration.
pub fn replay_commands(history: &[Event], handler: Arc<dyn OrchestrationHandler>, input: &str) -> Vec<Command> {
    ReplayEngine::new("replay", "replay", input, history.to_vec(), 0)
        .execute(handler)
        .commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::registry::OrchestrationRegistry;
    use crate::{ActivityCall, RetryPolicy};

    fn handler_of(reg: &OrchestrationRegistry, name: &str) -> Arc<dyn OrchestrationHandler> {
        reg.get(name).expect("registered")
    }

    fn two_step_registry() -> OrchestrationRegistry {
        OrchestrationRegistry::builder()
            .register("two_step", |ctx: OrchestrationContext, input: String| async move {
                let a = ctx.schedule_activity("A", input).await?;
                let b = ctx.schedule_activity("B", a).await?;
                Ok(b)
            })
            .build()
    }

    fn completed(call_id: u64, output: &str) -> Event {
        Event::ActivityCompleted {
            call_id,
            output: output.to_string(),
        }
    }

    #[test]
    fn first_turn_records_start_and_first_call() {
        let reg = two_step_registry();
        let engine = ReplayEngine::new("i", "two_step", "x", Vec::new(), 0);
        let decision = engine.execute(handler_of(&reg, "two_step"));
        assert_eq!(decision.outcome, TurnResult::Continue);
        assert_eq!(decision.new_events.len(), 2);
        assert!(matches!(decision.new_events[0], Event::OrchestratorStarted { .. }));
        assert_eq!(
            decision.commands,
            vec![Command::ScheduleActivity {
                call_id: 1,
                name: "A".into(),
                input: "x".into(),
                retry_policy: None,
            }]
        );
    }

    #[test]
    fn replay_resumes_after_recorded_outcomes() {
        let reg = two_step_registry();
        let mut history = ReplayEngine::new("i", "two_step", "x", Vec::new(), 0)
            .execute(handler_of(&reg, "two_step"))
            .new_events;
        history.push(completed(1, "a-out"));

        let decision = ReplayEngine::new("i", "two_step", "x", history.clone(), 0).execute(handler_of(&reg, "two_step"));
        assert_eq!(decision.outcome, TurnResult::Continue);
        assert_eq!(decision.new_events.len(), 1);
        assert!(matches!(
            &decision.new_events[0],
            Event::ActivityScheduled { call_id: 2, input, .. } if input == "a-out"
        ));

        history.extend(decision.new_events);
        history.push(completed(2, "done"));
        let decision = ReplayEngine::new("i", "two_step", "x", history, 0).execute(handler_of(&reg, "two_step"));
        assert_eq!(decision.outcome, TurnResult::Completed("done".into()));
        assert_eq!(
            decision.new_events,
            vec![Event::OrchestratorCompleted { result: "done".into() }]
        );
        assert!(decision.commands.is_empty());
    }

    #[test]
    fn diverging_replay_fails_with_nondeterminism() {
        let reg = two_step_registry();
        let history = vec![
            Event::OrchestratorStarted {
                name: "two_step".into(),
                input: "x".into(),
            },
            Event::ActivityScheduled {
                call_id: 1,
                name: "Other".into(),
                input: "x".into(),
                retry_policy: None,
            },
        ];
        let decision = ReplayEngine::new("i", "two_step", "x", history, 0).execute(handler_of(&reg, "two_step"));
        match decision.outcome {
            TurnResult::Failed(FailureDetails::NonDeterminism { message }) => {
                assert!(message.contains("Other"), "{message}");
            }
            other => panic!("expected nondeterminism, got {other:?}"),
        }
        assert!(decision.commands.is_empty());
        assert_eq!(decision.new_events.len(), 1);
    }

    #[test]
    fn returning_with_unreplayed_calls_is_nondeterministic() {
        let reg = OrchestrationRegistry::builder()
            .register("quick", |_ctx: OrchestrationContext, _input: String| async move { Ok("early".to_string()) })
            .build();
        let history = vec![
            Event::OrchestratorStarted {
                name: "quick".into(),
                input: String::new(),
            },
            Event::ActivityScheduled {
                call_id: 1,
                name: "A".into(),
                input: String::new(),
                retry_policy: None,
            },
        ];
        let decision = ReplayEngine::new("i", "quick", "", history, 0).execute(handler_of(&reg, "quick"));
        assert!(matches!(
            decision.outcome,
            TurnResult::Failed(FailureDetails::NonDeterminism { .. })
        ));
    }

    #[test]
    fn panics_and_errors_fail_the_orchestration() {
        let reg = OrchestrationRegistry::builder()
            .register("boom", |_ctx: OrchestrationContext, _input: String| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(String::new())
            })
            .register("err", |_ctx: OrchestrationContext, _input: String| async move {
                Err::<String, String>("bad input".into())
            })
            .build();
        let decision = ReplayEngine::new("i", "boom", "", Vec::new(), 0).execute(handler_of(&reg, "boom"));
        assert_eq!(
            decision.outcome,
            TurnResult::Failed(FailureDetails::Panicked {
                message: "kaboom".into()
            })
        );
        let decision = ReplayEngine::new("i", "err", "", Vec::new(), 0).execute(handler_of(&reg, "err"));
        assert_eq!(
            decision.outcome,
            TurnResult::Failed(FailureDetails::Application {
                message: "bad input".into()
            })
        );
        assert!(matches!(decision.new_events.last(), Some(Event::OrchestratorFailed { .. })));
    }

    #[test]
    fn unregistered_decision_records_failure() {
        let decision = ReplayEngine::new("i", "ghost", "", Vec::new(), 0).unregistered();
        assert_eq!(
            decision.new_events.last(),
            Some(&Event::OrchestratorFailed {
                error: FailureDetails::Unregistered {
                    orchestration: "ghost".into()
                }
            })
        );
    }

    #[test]
    fn fan_out_issues_whole_batch_in_one_turn() {
        let reg = OrchestrationRegistry::builder()
            .register("batch", |ctx: OrchestrationContext, _input: String| async move {
                let calls = (0..3).map(|i| ActivityCall::new("Work", i.to_string()).with_retry_policy(RetryPolicy::default()));
                let outputs = ctx.fan_out(calls).await?;
                Ok(outputs.join(","))
            })
            .build();
        let commands = replay_commands(&[], handler_of(&reg, "batch"), "");
        let ids: Vec<u64> = commands
            .iter()
            .map(|c| match c {
                Command::ScheduleActivity { call_id, .. } => *call_id,
                Command::CreateTimer { timer_id, .. } => *timer_id,
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(commands, replay_commands(&[], handler_of(&reg, "batch"), ""));
    }
}
