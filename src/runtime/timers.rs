use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::clock::Clock;
use super::{DecisionQueue, append_with_retry};
use crate::Event;
use crate::providers::HistoryStore;

/// A durable timer waiting to fire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerRequest {
    pub fire_at_ms: u64,
    pub instance: String,
    pub timer_id: u64,
}

/// In-process timer service.
/// Keeps a min-heap of pending timers, appends `TimerFired` when one is due
/// and asks for a decision on the owning instance.
pub struct TimerService {
    store: Arc<dyn HistoryStore>,
    clock: Arc<dyn Clock>,
    decisions: DecisionQueue,
    rx: mpsc::UnboundedReceiver<TimerRequest>,
    // (instance, timer_id) pairs already queued
    keys: HashSet<(String, u64)>,
    min_heap: BinaryHeap<Reverse<TimerRequest>>,
}

impl TimerService {
    pub fn start(
        store: Arc<dyn HistoryStore>,
        clock: Arc<dyn Clock>,
        decisions: DecisionQueue,
    ) -> (tokio::task::JoinHandle<()>, mpsc::UnboundedSender<TimerRequest>) {
        let (tx, rx) = mpsc::unbounded_channel::<TimerRequest>();
        let mut svc = TimerService {
            store,
            clock,
            decisions,
            rx,
            keys: HashSet::new(),
            min_heap: BinaryHeap::new(),
        };
        let handle = tokio::spawn(async move { svc.run().await });
        (handle, tx)
    }

    async fn run(&mut self) {
        let mut open = true;
        loop {
            // Drain any queued schedules
            while let Ok(item) = self.rx.try_recv() {
                self.insert_item(item);
            }

            self.fire_due().await;

            let next = self.min_heap.peek().map(|Reverse(t)| t.fire_at_ms);
            match (next, open) {
                (Some(next_ts), true) => {
                    let wait = Duration::from_millis(next_ts.saturating_sub(self.clock.now_ms()).max(1));
                    tokio::select! {
                        _ = self.clock.sleep(wait) => {},
                        maybe = self.rx.recv() => match maybe {
                            Some(item) => self.insert_item(item),
                            None => open = false,
                        },
                    }
                }
                (Some(next_ts), false) => {
                    let wait = Duration::from_millis(next_ts.saturating_sub(self.clock.now_ms()).max(1));
                    self.clock.sleep(wait).await;
                }
                (None, true) => match self.rx.recv().await {
                    Some(item) => self.insert_item(item),
                    None => open = false,
                },
                (None, false) => return,
            }
        }
    }

    async fn fire_due(&mut self) {
        let now = self.clock.now_ms();
        let mut unrecorded = Vec::new();
        while let Some(Reverse(top)) = self.min_heap.peek() {
            if top.fire_at_ms > now {
                break;
            }
            let Some(Reverse(timer)) = self.min_heap.pop() else {
                break;
            };
            self.keys.remove(&(timer.instance.clone(), timer.timer_id));
            let fired = Event::TimerFired {
                timer_id: timer.timer_id,
                fire_at_ms: timer.fire_at_ms,
            };
            match append_with_retry(self.store.as_ref(), &timer.instance, vec![fired]).await {
                Ok(written) => {
                    tracing::debug!(
                        target: "duraflow::runtime::timers",
                        instance = %timer.instance,
                        timer_id = timer.timer_id,
                        written,
                        "timer fired"
                    );
                    if written > 0 {
                        self.decisions.request(&timer.instance);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        target: "duraflow::runtime::timers",
                        instance = %timer.instance,
                        timer_id = timer.timer_id,
                        error = %e,
                        "failed to record fired timer"
                    );
                    if e.is_retryable() {
                        unrecorded.push(timer);
                    }
                }
            }
        }
        // Fired on the next pass
        for timer in unrecorded {
            self.insert_item(timer);
        }
    }

    fn insert_item(&mut self, item: TimerRequest) {
        if self.keys.insert((item.instance.clone(), item.timer_id)) {
            self.min_heap.push(Reverse(item));
        }
    }
}
