//! Retry loop for transient I/O failures.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::{ErrorKind, Result};

/// Backoff schedule: attempt `n` (1-based) waits `n² · base_delay` plus up to
/// one `base_delay` of jitter before retrying.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `attempt`-th failure.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let square = attempt.saturating_mul(attempt);
        let jitter = if self.base_delay.is_zero() {
            Duration::ZERO
        } else {
            let nanos = self.base_delay.as_nanos().min(u64::MAX as u128) as u64;
            Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
        };
        self.base_delay.saturating_mul(square) + jitter
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget runs out. Only [`ErrorKind::TransientIo`] is retried.
    pub fn run<T, F>(&self, cancel: &CancelToken, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            cancel.check()?;
            attempt += 1;
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.kind() == ErrorKind::TransientIo && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(%what, attempt, ?delay, error = %e, "transient failure, retrying");
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::io;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::ZERO,
        }
    }

    #[test]
    fn delay_grows_quadratically() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
        };
        let d3 = policy.delay_for(3);
        assert!(d3 >= Duration::from_millis(90));
        assert!(d3 <= Duration::from_millis(100));
    }

    #[test]
    fn retries_transient_errors_until_success() {
        let mut calls = 0;
        let out = quick()
            .run(&CancelToken::new(), "flaky", || {
                calls += 1;
                if calls < 3 {
                    Err(Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
                } else {
                    Ok(calls)
                }
            })
            .unwrap();
        assert_eq!(out, 3);
    }

    #[test]
    fn gives_up_after_budget() {
        let mut calls = 0;
        let err = quick()
            .run(&CancelToken::new(), "broken", || -> Result<()> {
                calls += 1;
                Err(Error::Io(io::Error::new(io::ErrorKind::TimedOut, "slow")))
            })
            .unwrap_err();
        assert_eq!(calls, 4);
        assert_eq!(err.kind(), ErrorKind::TransientIo);
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let mut calls = 0;
        let err = quick()
            .run(&CancelToken::new(), "bad", || -> Result<()> {
                calls += 1;
                Err(Error::malformed("bad magic"))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }
}
