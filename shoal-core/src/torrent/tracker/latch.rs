//! Single-winner coordination across concurrent tracker attempts.
//!
//! Every attempt of an announce cycle takes a generation from `set()`. The
//! fetch and its timeout race to `trip()` that generation; only the first
//! arrival sees `true` and may act. Late arrivals, including those of
//! superseded generations, see `false` and must suppress their side effects.

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct LatchState {
    code: u64,
    first: bool,
    finished: bool,
    success: bool,
    gate_closed: bool,
}

/// Generation-counted one-shot latch with a waitable gate.
#[derive(Debug, Default)]
pub struct SuccessLatch {
    state: Mutex<LatchState>,
    gate: Notify,
}

impl SuccessLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the outcome of the previous cycle.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.finished = false;
        state.success = false;
    }

    /// Arms the gate and returns a fresh generation.
    pub fn set(&self) -> u64 {
        let mut state = self.state.lock();
        state.first = true;
        state.code += 1;
        state.gate_closed = true;
        state.code
    }

    /// Waits until the gate armed by the latest `set()` is released.
    pub async fn wait(&self) {
        loop {
            let notified = self.gate.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.state.lock().gate_closed {
                return;
            }
            notified.await;
        }
    }

    /// Lands for `generation`; returns whether the caller arrived first.
    ///
    /// A first arrival with `success` finishes the cycle successfully.
    pub fn trip(&self, generation: u64, success: bool) -> bool {
        let mut state = self.state.lock();
        if state.finished || generation != state.code {
            return false;
        }

        let is_first = state.first;
        state.first = false;
        if is_first && success {
            state.finished = true;
            state.success = true;
        }
        is_first
    }

    /// Releases waiters iff `generation` is current.
    pub fn unwait(&self, generation: u64) {
        let mut state = self.state.lock();
        if generation == state.code {
            state.gate_closed = false;
            drop(state);
            self.gate.notify_waiters();
        }
    }

    /// Finishes the cycle unsuccessfully.
    pub fn give_up(&self) {
        let mut state = self.state.lock();
        state.success = false;
        state.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn is_success(&self) -> bool {
        self.state.lock().success
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.state.lock().code
    }
}
