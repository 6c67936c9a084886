// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! Retry policy shared by every remote operation.
//!
//! Classifies SDK errors as transient (retried with exponential backoff, up
//! to a configurable count) or permanent. Token errors are explicitly never
//! retried: a request signed with a token that's already expired will never
//! succeed no matter how many times it's repeated.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// An error observed on a remote call, tagged with whether it's worth
/// retrying.
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct RetryableError {
    pub message: String,
    pub transient: bool,
}

const TOKEN_ERROR_CODES: &[&str] = &["ExpiredToken", "ExpiredTokenException", "InvalidToken"];

const THROTTLING_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "RequestThrottled",
    "RequestThrottledException",
];

const RETRYABLE_CODES: &[&str] = &[
    "InternalError",
    "RequestTimeTooSkewed",
    "SlowDown",
    "RequestTimeout",
    "ResponseTimeout",
];

const RETRYABLE_SUBSTRINGS: &[&str] = &[
    "connection reset",
    "connection timed out",
    "use of closed network connection",
];

/// Classify an S3 error code and/or message, deciding whether a caller
/// should retry the request.
pub fn classify(code: Option<&str>, message: &str) -> bool {
    if let Some(code) = code {
        if TOKEN_ERROR_CODES.contains(&code) {
            return false;
        }
        if RETRYABLE_CODES.contains(&code) || THROTTLING_CODES.contains(&code) {
            return true;
        }
    }
    let lower = message.to_ascii_lowercase();
    RETRYABLE_SUBSTRINGS.iter().any(|s| lower.contains(s))
}

/// Exponential backoff policy: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(20),
        }
    }
}

impl Backoff {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        scaled.min(self.max)
    }
}

/// Run `op` with retry per the classification rules above. `op` is called
/// once, then up to `max_retries` more times on a retryable error.
pub async fn with_retry<T, F, Fut>(max_retries: u32, backoff: Backoff, mut op: F) -> Result<T, RetryableError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RetryableError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.transient && attempt < max_retries => {
                debug!(attempt, error = %e.message, "retrying after transient error");
                tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn token_errors_never_retried() {
        for code in TOKEN_ERROR_CODES {
            assert!(!classify(Some(code), "token is bad"));
        }
    }

    #[test]
    fn throttling_and_internal_errors_are_retried() {
        assert!(classify(Some("SlowDown"), ""));
        assert!(classify(Some("Throttling"), ""));
        assert!(classify(Some("InternalError"), ""));
        assert!(classify(Some("RequestLimitExceeded"), ""));
    }

    #[test]
    fn message_substrings_are_retried() {
        assert!(classify(None, "connection reset by peer"));
        assert!(classify(None, "Connection Timed Out while reading"));
        assert!(!classify(None, "access denied"));
    }

    #[test]
    fn backoff_caps_at_max() {
        let b = Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
        };
        assert_eq!(b.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(b.delay_for_attempt(20), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn with_retry_stops_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryableError> = with_retry(2, Backoff::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(RetryableError {
                    message: "SlowDown".into(),
                    transient: true,
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3); // initial + 2 retries
    }

    #[tokio::test]
    async fn with_retry_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryableError> = with_retry(5, Backoff::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(RetryableError {
                    message: "access denied".into(),
                    transient: false,
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
