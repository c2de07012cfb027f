//! The admission gate itself.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use snafu::ResultExt;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::backoff::{self, BackoffSchedule};
use super::error::{AdmissionError, QueueFullSnafu, RateLimitedSnafu, UpstreamSnafu};
use super::queue::PendingQueue;
use super::stats;
use super::window::UsageWindow;
use super::{PriorityAdmissionSettings, instant_now};

/// Gate to a rate-limited upstream dependency.
///
/// One limiter instance guards one upstream target; everything that talks to
/// that target shares the same queue, budget and backoff state, since the
/// protected quota is itself shared. The handle is cheap to clone and meant to
/// be constructed once and passed to callers, not reached through a global.
///
/// Dropping the last handle discards all queued work and backoff state;
/// nothing is persisted.
#[derive(Clone)]
pub struct RequestRateLimiter {
    inner: Arc<Inner>,
}

/// Point-in-time view of the gate, as returned by
/// [`RequestRateLimiter::rate_limit_status`].
#[derive(Clone, Copy, Debug)]
pub struct RateLimitStatus {
    /// Admission is currently suspended after an upstream overload signal.
    pub is_backing_off: bool,
    /// The instant at which backoff lifts. `Some` iff `is_backing_off`.
    pub backoff_until: Option<Instant>,
    /// Requests queued but not yet admitted.
    pub queue_depth: usize,
    /// Requests admitted and not yet completed.
    pub in_flight: usize,
}

struct Inner {
    settings: PriorityAdmissionSettings,
    state: Mutex<State>,
}

struct State {
    in_flight: usize,
    window: UsageWindow,
    queue: PendingQueue,
    backoff_until: Option<Instant>,
    schedule: BackoffSchedule,
    /// Instant of the one outstanding queue-drain wakeup, if any.
    wakeup: Option<Instant>,
}

/// Held by an admitted request for as long as its work runs.
///
/// Dropping the permit without completing (the caller abandoned its call
/// future mid-flight) still frees the concurrency slot.
pub(super) struct AdmissionPermit {
    gate: RequestRateLimiter,
    released: bool,
}

enum Completion {
    Success,
    Overload { hint: Option<Duration> },
    Failure,
}

impl State {
    /// Lazily observe timer-driven transitions: backoff expiry and window
    /// boundaries.
    fn refresh(&mut self, now: Instant) {
        if let Some(until) = self.backoff_until {
            if now >= until {
                self.backoff_until = None;
            }
        }
        self.window.roll(now);
    }
}

impl AdmissionPermit {
    /// Consume the permit without freeing the slot; the completion path owns
    /// the decrement.
    fn dissolve(mut self) {
        self.released = true;
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if !self.released {
            self.gate.release_slot();
        }
    }
}

impl RequestRateLimiter {
    fn locked(&self) -> MutexGuard<'_, State> {
        // A poisoned guard can only carry a consistent snapshot: the lock is
        // never held across a suspension point.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit queued requests while capacity, budget and backoff allow.
    ///
    /// Blocked admission never skips the queue head, preserving the
    /// priority-then-FIFO guarantee.
    fn pump(&self, state: &mut State, now: Instant) {
        let settings = &self.inner.settings;
        loop {
            if state.backoff_until.is_some() {
                break;
            }
            if state.in_flight >= settings.max_concurrency {
                break;
            }
            let admissible = match state.queue.peek() {
                Some(head) => state
                    .window
                    .admits(head.estimated_cost, settings.window_budget),
                None => break,
            };
            if !admissible {
                break;
            }
            let Some(request) = state.queue.pop() else {
                break;
            };
            state.in_flight += 1;
            state.window.charge(request.estimated_cost);
            let permit = AdmissionPermit {
                gate: self.clone(),
                released: false,
            };
            match request.admit.send(permit) {
                Ok(()) => stats::emit_admission(
                    now.duration_since(request.enqueued_at),
                    request.estimated_cost,
                ),
                Err(mut permit) => {
                    // The caller went away while queued; hand the slot and
                    // the window charge straight back.
                    permit.released = true;
                    state.in_flight -= 1;
                    state.window.refund(request.estimated_cost);
                }
            }
        }
        stats::emit_gate(state.in_flight, state.queue.len());

        // A queue stalled purely on a timer has no completion coming to
        // re-drive it before the unblock instant.
        let head_cost = state.queue.peek().map(|head| head.estimated_cost);
        if let Some(cost) = head_cost {
            if let Some(until) = state.backoff_until {
                self.schedule_wakeup(state, until);
            } else if state.in_flight < settings.max_concurrency
                && !state.window.admits(cost, settings.window_budget)
            {
                let at = state.window.next_reset();
                self.schedule_wakeup(state, at);
            }
        }
    }

    /// Arrange a single pump pass at `at`. At most one wakeup is outstanding;
    /// an earlier one already covers this request.
    fn schedule_wakeup(&self, state: &mut State, at: Instant) {
        if let Some(scheduled) = state.wakeup {
            if scheduled <= at {
                return;
            }
        }
        // Dropped outside the runtime: nothing is awaiting admission, so
        // there is nobody to wake.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        state.wakeup = Some(at);
        let gate = self.clone();
        handle.spawn(async move {
            tokio::time::sleep_until(at).await;
            let now = instant_now();
            let mut state = gate.locked();
            if state.wakeup != Some(at) {
                // Superseded by an earlier wakeup, which pumps instead.
                return;
            }
            state.wakeup = None;
            state.refresh(now);
            gate.pump(&mut state, now);
        });
    }

    fn complete(&self, permit: AdmissionPermit, completion: Completion) {
        permit.dissolve();
        let now = instant_now();
        let mut state = self.locked();
        state.in_flight -= 1;
        state.refresh(now);
        match completion {
            Completion::Success => state.schedule.reset(),
            Completion::Overload { hint } => {
                let hinted = hint.is_some();
                let delay = hint.unwrap_or_else(|| state.schedule.next_delay());
                state.backoff_until = Some(now + delay);
                stats::emit_backoff_entered(delay, hinted);
            }
            Completion::Failure => {}
        }
        self.pump(&mut state, now);
    }

    /// Free the slot of an admitted request whose caller vanished before
    /// completing.
    fn release_slot(&self) {
        let now = instant_now();
        let mut state = self.locked();
        state.in_flight -= 1;
        state.refresh(now);
        self.pump(&mut state, now);
    }

    pub fn new(settings: PriorityAdmissionSettings) -> Self {
        let now = instant_now();
        Self {
            inner: Arc::new(Inner {
                settings,
                state: Mutex::new(State {
                    in_flight: 0,
                    window: UsageWindow::new(settings.window_length, now),
                    queue: PendingQueue::new(),
                    backoff_until: None,
                    schedule: BackoffSchedule::new(
                        settings.initial_backoff,
                        settings.backoff_base,
                        settings.max_backoff,
                        settings.jitter,
                    ),
                    wakeup: None,
                }),
            }),
        }
    }

    pub fn settings(&self) -> &PriorityAdmissionSettings {
        &self.inner.settings
    }

    /// Queue `work` for admission and run it once admitted, returning its
    /// settled result.
    ///
    /// Higher `priority` admits sooner; arrival order breaks ties, so
    /// equal-priority work cannot starve. `estimated_cost` is charged against
    /// the current accounting window on admission; a wrong estimate skews
    /// smoothing, never correctness.
    ///
    /// Fails fast with [`AdmissionError::RateLimited`] while the upstream is
    /// cooling down and [`AdmissionError::QueueFull`] when the pending queue
    /// is at capacity; the call is never silently parked past a backoff
    /// window. A failure from `work` is re-raised verbatim as
    /// [`AdmissionError::Upstream`]; when its message reads as an upstream
    /// overload (429, quota or rate-limit wording) the limiter additionally
    /// arms backoff before re-raising. The limiter itself never retries.
    pub async fn execute_request<F, Fut, T, E>(
        &self,
        priority: i32,
        estimated_cost: u64,
        work: F,
    ) -> Result<T, AdmissionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let admitted = {
            let now = instant_now();
            let mut state = self.locked();
            state.refresh(now);
            if let Some(until) = state.backoff_until {
                let retry_in = until.duration_since(now);
                stats::emit_rejection("backing_off");
                tracing::debug!(
                    target: "priority_admission",
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Rejected: upstream cooling down"
                );
                return RateLimitedSnafu { retry_in }.fail();
            }
            let depth = state.queue.len();
            if depth >= self.inner.settings.max_queue_depth {
                stats::emit_rejection("queue_full");
                return QueueFullSnafu { depth }.fail();
            }
            let (admit, admitted) = oneshot::channel();
            let id = state.queue.push(priority, estimated_cost, now, admit);
            tracing::trace!(
                target: "priority_admission",
                id,
                priority,
                estimated_cost,
                "Request queued"
            );
            self.pump(&mut state, now);
            admitted
        };

        // The sender sits in the queue owned by `self.inner`, which this
        // future keeps alive; it is never dropped before sending.
        let permit = admitted
            .await
            .expect("admission sender dropped before sending");

        let result = work().await;
        let completion = match &result {
            Ok(_) => Completion::Success,
            Err(error) => {
                let message = error.to_string();
                if backoff::is_overload_signal(&message) {
                    Completion::Overload {
                        hint: backoff::retry_after_hint(&message),
                    }
                } else {
                    Completion::Failure
                }
            }
        };
        self.complete(permit, completion);
        result.context(UpstreamSnafu)
    }

    /// Snapshot the gate.
    ///
    /// Reading the status is also how an expired backoff is observed and
    /// cleared; once cleared it reads cleared until the next overload signal.
    /// Callers use this to short-circuit to a cached or degraded response
    /// instead of spending a request during a cooldown.
    pub fn rate_limit_status(&self) -> RateLimitStatus {
        let now = instant_now();
        let mut state = self.locked();
        state.refresh(now);
        RateLimitStatus {
            is_backing_off: state.backoff_until.is_some(),
            backoff_until: state.backoff_until,
            queue_depth: state.queue.len(),
            in_flight: state.in_flight,
        }
    }
}

impl fmt::Debug for RequestRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRateLimiter")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}
