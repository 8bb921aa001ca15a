//! Bounded linear retry delay used by the reconnect supervisor, the remote
//! address pool refresher, and the long-poll loops.

use std::time::Duration;

/// Retry delay that grows by a fixed step on every failure and is clamped to
/// a cap. `reset()` snaps it back to the initial value after a success.
#[derive(Debug, Clone)]
pub struct RetryScaler {
    value: u64,
    init: u64,
    step: u64,
    cap: u64,
}

impl RetryScaler {
    pub fn new(init_secs: u64, step_secs: u64, cap_secs: u64) -> Self {
        Self {
            value: init_secs.min(cap_secs),
            init: init_secs,
            step: step_secs,
            cap: cap_secs,
        }
    }

    /// Current delay in seconds.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Current delay as a [`Duration`].
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.value)
    }

    /// Registers a failure, growing the delay by one step up to the cap.
    pub fn advance(&mut self) {
        self.value = self.value.saturating_add(self.step).min(self.cap);
    }

    /// Registers a success, snapping the delay back to the initial value.
    pub fn reset(&mut self) {
        self.value = self.init.min(self.cap);
    }
}
