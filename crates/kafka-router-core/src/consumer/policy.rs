//! Failure policies applied by consumer workers.
//!
//! Two independent knobs exist:
//! - [`RetryPolicy`] governs callback *faults* (panics). The default retries
//!   the same message forever with a one-second pause, so a poison message
//!   cannot hot-loop the process but is never silently dropped.
//! - [`ErrorPolicy`] governs callback *errors* (an `Err` return). The default
//!   logs the error and moves on; the message still counts as consumed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry schedule: fixed backoff with an optional attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Total attempts allowed for one message, including the first.
    /// `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Pause between attempts in milliseconds.
    #[serde(default = "default_fault_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_fault_backoff_ms() -> u64 {
    1_000
}

impl RetryPolicy {
    /// Retry forever with a fixed delay.
    #[must_use]
    pub fn forever(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Retry until `max_attempts` attempts have been made.
    #[must_use]
    pub fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Pause between attempts.
    #[must_use]
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    #[must_use]
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        match self.max_attempts {
            None => true,
            Some(max) => attempts_made < max,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::forever(Duration::from_millis(default_fault_backoff_ms()))
    }
}

/// What a worker does when the callback returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Log, mark the message consumed, continue with the next one.
    #[default]
    Skip,

    /// Re-invoke the callback with the same message, then skip once the
    /// attempts are exhausted.
    Retry {
        #[serde(default = "default_error_attempts")]
        max_attempts: u32,
        #[serde(default = "default_error_backoff_ms")]
        backoff_ms: u64,
    },
}

fn default_error_attempts() -> u32 {
    3
}

fn default_error_backoff_ms() -> u64 {
    200
}

impl ErrorPolicy {
    /// Retry schedule for callback errors, if any.
    #[must_use]
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        match *self {
            Self::Skip => None,
            Self::Retry {
                max_attempts,
                backoff_ms,
            } => Some(RetryPolicy {
                max_attempts: Some(max_attempts.max(1)),
                backoff_ms,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_fault_policy_retries_forever() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(), Duration::from_secs(1));
        assert!(policy.allows_another(0));
        assert!(policy.allows_another(u32::MAX - 1));
    }

    #[test]
    fn test_bounded_policy() {
        let policy = RetryPolicy::bounded(3, Duration::from_millis(5));
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
    }

    #[test]
    fn test_huge_delay_saturates() {
        let policy = RetryPolicy::forever(Duration::MAX);
        assert_eq!(policy.backoff_ms, u64::MAX);

        let policy = RetryPolicy::bounded(2, Duration::from_secs(u64::MAX));
        assert_eq!(policy.backoff_ms, u64::MAX);
    }

    #[test]
    fn test_skip_has_no_retry() {
        assert_eq!(ErrorPolicy::Skip.retry_policy(), None);
    }

    #[test]
    fn test_retry_policy_never_zero_attempts() {
        let policy = ErrorPolicy::Retry {
            max_attempts: 0,
            backoff_ms: 10,
        }
        .retry_policy()
        .unwrap();
        assert_eq!(policy.max_attempts, Some(1));
    }

    #[test]
    fn test_error_policy_yaml() {
        let skip: ErrorPolicy = serde_yaml::from_str("action: skip").unwrap();
        assert_eq!(skip, ErrorPolicy::Skip);

        let retry: ErrorPolicy = serde_yaml::from_str("action: retry\nmax_attempts: 5").unwrap();
        assert_eq!(
            retry,
            ErrorPolicy::Retry {
                max_attempts: 5,
                backoff_ms: 200
            }
        );
    }
}
