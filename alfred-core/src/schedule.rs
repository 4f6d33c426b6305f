//! Absolute-time callback scheduler.
//!
//! Callers schedule a boxed callback to run at a wall time read from the
//! bound [`Clock`]; the returned token cancels it. Each scheduled callback
//! runs on its own timer task, so users must re-check their own state
//! (mobilized flag, generation counter) under their own lock when the
//! callback finally fires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::time::Clock;

/// Token returned by [`Scheduler::schedule`]; pass to [`Scheduler::cancel`].
pub type ScheduleToken = u64;

#[derive(Default)]
struct SchedulerState {
    clock: Option<Arc<dyn Clock>>,
    next_token: ScheduleToken,
    pending: HashMap<ScheduleToken, JoinHandle<()>>,
}

/// Schedules callbacks at absolute wall times against a pluggable clock.
#[derive(Default)]
pub struct Scheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl Scheduler {
    /// Creates a scheduler with no clock bound.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds (or detaches, with `None`) the clock used to translate absolute
    /// times into delays. Detaching does not cancel pending callbacks.
    pub fn set_clock(&self, clock: Option<Arc<dyn Clock>>) {
        self.state.lock().clock = clock;
    }

    /// Schedules `callback` to run at wall time `at` (seconds). Times in the
    /// past fire immediately. Returns a cancellation token, or `None` when no
    /// clock is bound.
    pub fn schedule<F>(&self, at: f64, callback: F) -> Option<ScheduleToken>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        let now = state.clock.as_ref()?.now();
        let token = state.next_token;
        state.next_token += 1;
        let delay = Duration::from_secs_f64((at - now).max(0.0));
        let shared = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.lock().pending.remove(&token);
            callback();
        });
        state.pending.insert(token, handle);
        Some(token)
    }

    /// Current time read from the bound clock, if any.
    #[must_use]
    pub fn now(&self) -> Option<f64> {
        self.state.lock().clock.as_ref().map(|clock| clock.now())
    }

    /// Cancels a pending callback. Unknown or already-fired tokens are a
    /// no-op.
    pub fn cancel(&self, token: ScheduleToken) {
        if let Some(handle) = self.state.lock().pending.remove(&token) {
            handle.abort();
        }
    }

    /// Number of callbacks scheduled but not yet fired.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}
