//! Debug-output suppression.
//!
//! Hot paths (transitions, hotplug surgery) disable debug chatter for
//! their duration; suppressed lines are counted instead of printed.

use core::fmt;

use spin::Mutex;

struct RateLimitState {
    disable_depth: u32,
    suppressed: u64,
}

pub(crate) struct RateLimit {
    state: Mutex<RateLimitState>,
}

impl RateLimit {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RateLimitState {
                disable_depth: 0,
                suppressed: 0,
            }),
        }
    }

    pub fn disable(&self) {
        self.state.lock().disable_depth += 1;
    }

    pub fn enable(&self) {
        let mut state = self.state.lock();
        if state.disable_depth > 0 {
            state.disable_depth -= 1;
        }
        if state.disable_depth == 0 && state.suppressed > 0 {
            log::debug!("{} debug lines suppressed", state.suppressed);
            state.suppressed = 0;
        }
    }

    /// Emits a debug line unless suppression is active.
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        let mut state = self.state.lock();
        if state.disable_depth == 0 {
            drop(state);
            log::debug!("{}", args);
        } else {
            state.suppressed = state.suppressed.saturating_add(1);
        }
    }

    #[cfg(test)]
    pub fn suppressed(&self) -> u64 {
        self.state.lock().suppressed
    }
}
