use crate::ReconcileError;
use std::time::{Duration, Instant};
use tracing::warn;

/// One invocation of the retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based.
    pub number: u32,
    /// Time left before the deadline, when one is set.
    pub remaining: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Calls `work` until it succeeds, fails with anything other than a lock timeout,
    /// or has been tried `max_retries + 1` times. No attempt starts after the deadline.
    pub fn run<T, F>(&self, mut work: F) -> Result<T, ReconcileError>
    where
        F: FnMut(Attempt) -> Result<T, ReconcileError>,
    {
        let started = Instant::now();
        let mut attempts = 0;

        loop {
            let remaining = match self.deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        return Err(ReconcileError::DeadlineExceeded { attempts });
                    }
                    Some(remaining)
                }
                None => None,
            };

            attempts += 1;
            match work(Attempt {
                number: attempts,
                remaining,
            }) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_lock_timeout() => {
                    if attempts >= self.max_attempts() {
                        return Err(err.exhausted(attempts));
                    }
                    warn!(
                        event = "reconcile_retry",
                        attempt = attempts,
                        max_attempts = self.max_attempts(),
                        error = %err
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_RETRIES)
    }
}
