//! Reconnection timing.
//!
//! Tracks the current delay and attempt count. The base delay is
//! multiplied after each failure (capped at `max_delay`) and a random
//! jitter is added on top so disconnected clients don't stampede the
//! server in lockstep. `reset()` returns to the initial delay after a
//! stable connection.

use std::time::Duration;

use rand::Rng;

/// Default policy for a session that had reached the live state:
/// 60 s base plus 0–89 s of jitter, no exponential growth.
pub const RECONNECT_BASE_SECS: u64 = 60;
pub const RECONNECT_JITTER_SECS: u64 = 90;

pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
    /// Upper bound (exclusive) of the random addition, in seconds.
    jitter_secs: u64,
    current_delay: Duration,
    /// Number of consecutive attempts (resets on `reset()`).
    pub attempt: u32,
}

impl Backoff {
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
        jitter_secs: u64,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter_secs,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// The standard session reconnect policy.
    pub fn reconnect() -> Self {
        Self::new(
            Duration::from_secs(RECONNECT_BASE_SECS),
            Duration::from_secs(RECONNECT_BASE_SECS),
            1,
            RECONNECT_JITTER_SECS,
        )
    }

    /// Returns the delay to wait now and advances the state.
    pub fn next_delay(&mut self) -> Duration {
        let mut delay = self.current_delay;
        if self.jitter_secs > 0 {
            delay += Duration::from_secs(rand::thread_rng().gen_range(0..self.jitter_secs));
        }
        self.attempt += 1;
        self.current_delay = (self.current_delay * self.multiplier).min(self.max_delay);
        delay
    }

    /// Resets the backoff to its initial state.
    /// Called when a connection has been stable long enough.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns true if the consecutive attempt count has reached `max`.
    pub fn exceeded_max_attempts(&self, max: u32) -> bool {
        self.attempt >= max
    }
}
