//! Retry with exponential backoff for local file I/O.
//!
//! Two policies are used:
//!
//! - [`RetryPolicy::steady_state`] for per-pass operations (bookmark reads and
//!   writes). Bounded: once the attempts are used up the caller gets an error
//!   and the pass is retried later as a whole.
//! - [`RetryPolicy::initialization`] for startup operations (creating working
//!   directories). Unbounded but with a capped interval, since a failure there
//!   would leave the pipeline disabled.

use crate::{Error, Result};
use std::time::Duration;
use tracing::warn;

/// Backoff policy for [`retry_io`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,

    /// Maximum number of attempts, or `None` to retry until success.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Bounded policy for steady-state operations.
    pub fn steady_state() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            max_attempts: Some(5),
        }
    }

    /// Unbounded policy for initialization-time operations.
    pub fn initialization() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts: Some(1),
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::steady_state()
    }
}

/// Run an I/O operation, retrying failures according to `policy`.
///
/// `description` names the operation in logs and in the error returned once
/// the attempts are exhausted.
pub fn retry_io<T, F>(policy: &RetryPolicy, description: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> std::io::Result<T>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(Error::RetriesExhausted {
                        operation: description.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }

                let delay = policy.delay_after(attempt);
                warn!(
                    "{} failed (attempt {}): {}; retrying in {:?}",
                    description, attempt, e, delay
                );
                std::thread::sleep(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    fn fast_policy(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts,
        }
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_attempts: None,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(10));
        assert_eq!(policy.delay_after(2), Duration::from_millis(20));
        assert_eq!(policy.delay_after(3), Duration::from_millis(40));
        assert_eq!(policy.delay_after(4), Duration::from_millis(50));
        assert_eq!(policy.delay_after(100), Duration::from_millis(50));
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let mut calls = 0;
        let value = retry_io(&fast_policy(Some(5)), "read bookmark", || {
            calls += 1;
            if calls < 3 {
                Err(IoError::new(ErrorKind::WouldBlock, "locked"))
            } else {
                Ok(42)
            }
        })
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_bounded_policy_gives_up() {
        let mut calls = 0;
        let err = retry_io(&fast_policy(Some(3)), "write bookmark", || -> std::io::Result<()> {
            calls += 1;
            Err(IoError::new(ErrorKind::PermissionDenied, "denied"))
        })
        .unwrap_err();

        assert_eq!(calls, 3);
        assert!(matches!(
            err,
            Error::RetriesExhausted { attempts: 3, .. }
        ));
    }

    #[test]
    fn test_unbounded_policy_keeps_trying() {
        let mut calls = 0;
        retry_io(&fast_policy(None), "create directory", || {
            calls += 1;
            if calls < 10 {
                Err(IoError::other("busy"))
            } else {
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(calls, 10);
    }

    #[test]
    fn test_no_retry_makes_one_attempt() {
        let mut calls = 0;
        let result = retry_io(&RetryPolicy::no_retry(), "probe", || -> std::io::Result<()> {
            calls += 1;
            Err(IoError::other("nope"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
