//! Bounded retry for transient failures (mirror fetches, package manager locks).
//!
//! Fixed delay between attempts, no backoff. Deciding whether an error is
//! worth retrying at all is the caller's job: use [`RetryPolicy::retry_if`]
//! to stop early on deterministic failures.

use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt count and delay for one retried operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (0 behaves like 1)
    pub max_attempts: u32,
    /// Pause between two attempts
    #[serde(with = "duration_secs", rename = "delay_secs")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Policy that runs the operation exactly once
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn retry<T, E, F>(&self, operation: &str, op: F) -> Result<T>
    where
        E: Display,
        F: FnMut(u32) -> std::result::Result<T, E>,
    {
        self.retry_if(operation, op, |_| true)
    }

    /// Like [`retry`](Self::retry) but gives up immediately when
    /// `is_retryable` returns false for an error.
    pub fn retry_if<T, E, F, P>(&self, operation: &str, mut op: F, is_retryable: P) -> Result<T>
    where
        E: Display,
        F: FnMut(u32) -> std::result::Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let max = self.attempts();
        let mut attempt = 1;

        loop {
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}/{}", operation, attempt, max);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let fatal = !is_retryable(&e);
                    if fatal || attempt >= max {
                        if fatal {
                            warn!("{} failed with a non-retryable error: {}", operation, e);
                        }
                        return Err(ProvisionError::RetryExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }

                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation, attempt, max, e, self.delay
                    );
                    if !self.delay.is_zero() {
                        std::thread::sleep(self.delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

/// `Duration` stored as whole seconds in config files
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
