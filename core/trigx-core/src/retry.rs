//! Bounded exponential backoff for administrative store I/O
//!
//! The system store may be briefly unreachable (no elected writer, disk
//! hiccup). Transient errors are retried with a growing delay until the total
//! window is spent; anything else fails immediately.

use crate::clock::Clock;
use crate::error::{TrigxError, TrigxResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub initial_backoff_ms: u64,
    /// Growth factor applied after each failed attempt
    pub multiplier: f64,
    /// Upper bound for a single delay
    pub max_backoff_ms: u64,
    /// Total time budget across all attempts
    pub max_elapsed_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 10_000,
            max_elapsed_ms: 5 * 60 * 1_000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_elapsed_ms: 0,
            ..Self::default()
        }
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        let grown = current.as_millis() as f64 * self.multiplier.max(1.0);
        Duration::from_millis((grown as u64).min(self.max_backoff_ms))
    }

    /// Run `op` until it succeeds, fails permanently, or the window closes.
    pub fn run<T, F>(&self, clock: &dyn Clock, operation: &str, mut op: F) -> TrigxResult<T>
    where
        F: FnMut() -> TrigxResult<T>,
    {
        let started = clock.now_millis();
        let mut delay = self.initial_backoff();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };

            let elapsed = Duration::from_millis(clock.now_millis().saturating_sub(started));
            if elapsed + delay > self.max_elapsed() {
                warn!(operation, attempt, elapsed_ms = elapsed.as_millis() as u64, error = %err,
                    "giving up on system store operation");
                return Err(TrigxError::RetryExhausted {
                    attempts: attempt,
                    elapsed,
                    last: Box::new(err),
                });
            }

            debug!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %err,
                "system store unavailable, retrying");
            clock.sleep(delay);
            delay = self.next_backoff(delay);
        }
    }
}
