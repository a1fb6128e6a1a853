//! Rate limiting for the global clear.

use std::time::{Duration, Instant};

use crate::config::DEFAULT_CLEAR_COOLDOWN_SECS;

/// Allows at most one clear per cooldown window on this participant.
///
/// The window opens at the first clear, not at construction: a freshly
/// joined participant may clear right away.
#[derive(Debug, Clone)]
pub struct ClearThrottle {
    cooldown: Duration,
    last_clear: Option<Instant>,
}

impl ClearThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_clear: None,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Consume the clear allowance if it is available now.
    pub fn try_clear(&mut self) -> bool {
        self.try_clear_at(Instant::now())
    }

    /// Consume the clear allowance if it is available at `now`.
    ///
    /// A refused attempt does not restart the window.
    pub fn try_clear_at(&mut self, now: Instant) -> bool {
        if self.is_ready_at(now) {
            self.record_at(now);
            true
        } else {
            false
        }
    }

    /// Whether a clear would be allowed at `now`, without consuming it.
    pub fn is_ready_at(&self, now: Instant) -> bool {
        self.remaining_at(now).is_zero()
    }

    /// Start a new window at `now`.
    pub fn record_at(&mut self, now: Instant) {
        self.last_clear = Some(now);
    }

    /// Time left until the next clear is allowed.
    pub fn remaining_at(&self, now: Instant) -> Duration {
        match self.last_clear {
            Some(last) => self.cooldown.saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
}

impl Default for ClearThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_CLEAR_COOLDOWN_SECS))
    }
}
