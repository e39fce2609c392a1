use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{ActivityFailure, CallOutcome, OrchestrationContext};

/// Future for one activity call. Resolves as soon as the call's terminal event
/// is present in the replayed history; stays pending otherwise.
pub struct ActivityFuture {
    ctx: OrchestrationContext,
    call_id: u64,
}

impl ActivityFuture {
    pub(crate) fn new(ctx: OrchestrationContext, call_id: u64) -> Self {
        Self { ctx, call_id }
    }

    /// Deterministic id assigned when the call was issued.
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    fn resolve(&self) -> Option<Result<String, ActivityFailure>> {
        match self.ctx.outcome(self.call_id)? {
            CallOutcome::Completed(output) => Some(Ok(output)),
            CallOutcome::Failed(failure) => Some(Err(failure)),
            // A timer outcome at an activity's id means replay diverged, which
            // is already recorded as nondeterminism; never resolve.
            CallOutcome::Fired => None,
        }
    }

    /// Await the output decoded from JSON.
    pub async fn into_typed<Out: serde::de::DeserializeOwned>(self) -> Result<Out, String> {
        use crate::_typed_codec::Codec;
        let output = self.await?;
        crate::_typed_codec::Json::decode::<Out>(&output)
    }
}

impl Future for ActivityFuture {
    type Output = Result<String, ActivityFailure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.resolve() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

/// Future for a durable timer.
pub struct TimerFuture {
    ctx: OrchestrationContext,
    timer_id: u64,
}

impl TimerFuture {
    pub(crate) fn new(ctx: OrchestrationContext, timer_id: u64) -> Self {
        Self { ctx, timer_id }
    }

    pub fn timer_id(&self) -> u64 {
        self.timer_id
    }
}

impl Future for TimerFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.ctx.outcome(self.timer_id) {
            Some(CallOutcome::Fired) => Poll::Ready(()),
            _ => Poll::Pending,
        }
    }
}

/// Fan-in over a batch of activity calls.
///
/// Members are polled in submission order and the output keeps that order,
/// regardless of the order in which completions were appended to history.
pub struct JoinFuture {
    children: Vec<ActivityFuture>,
    // Submission indices this join waits on, ascending
    selected: Vec<usize>,
    results: Vec<Option<Result<String, ActivityFailure>>>,
}

impl JoinFuture {
    pub(crate) fn all(children: Vec<ActivityFuture>) -> Self {
        let selected = (0..children.len()).collect();
        Self::with_selection(children, selected)
    }

    pub(crate) fn subset(children: Vec<ActivityFuture>, indices: &[usize]) -> Self {
        let mut selected: Vec<usize> = indices.iter().copied().filter(|i| *i < children.len()).collect();
        selected.sort_unstable();
        selected.dedup();
        Self::with_selection(children, selected)
    }

    fn with_selection(children: Vec<ActivityFuture>, selected: Vec<usize>) -> Self {
        let results = (0..children.len()).map(|_| None).collect();
        Self {
            children,
            selected,
            results,
        }
    }

    /// Call ids of the batch in submission order.
    pub fn call_ids(&self) -> Vec<u64> {
        self.children.iter().map(ActivityFuture::call_id).collect()
    }
}

impl Future for JoinFuture {
    type Output = Vec<Result<String, ActivityFailure>>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut pending = false;
        for &idx in &this.selected {
            if this.results[idx].is_some() {
                continue;
            }
            match this.children[idx].resolve() {
                Some(result) => this.results[idx] = Some(result),
                None => pending = true,
            }
        }
        if pending {
            return Poll::Pending;
        }
        let outputs = this
            .selected
            .iter()
            .filter_map(|idx| this.results[*idx].take())
            .collect();
        Poll::Ready(outputs)
    }
}

/// "All" join that fails the whole batch when any member exhausted its
/// retries. Waits for every member before deciding, so the failure reported
/// is always the first one in submission order.
pub struct FanOutFuture {
    join: JoinFuture,
}

impl FanOutFuture {
    pub(crate) fn new(join: JoinFuture) -> Self {
        Self { join }
    }

    pub fn call_ids(&self) -> Vec<u64> {
        self.join.call_ids()
    }
}

impl Future for FanOutFuture {
    type Output = Result<Vec<String>, ActivityFailure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let join = Pin::new(&mut self.get_mut().join);
        match join.poll(cx) {
            Poll::Ready(results) => Poll::Ready(results.into_iter().collect()),
            Poll::Pending => Poll::Pending,
        }
    }
}

// poll() projects &mut self freely; keep every durable future Unpin.
const fn assert_unpin<T: Unpin>() {}
const _: () = {
    assert_unpin::<ActivityFuture>();
    assert_unpin::<TimerFuture>();
    assert_unpin::<JoinFuture>();
    assert_unpin::<FanOutFuture>();
};
