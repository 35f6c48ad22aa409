//! Error taxonomy for the dispatch core.
//!
//! Every fallible operation in this crate returns a `DispatchError`. Errors
//! are additionally classified into an `ErrorCategory` so that retry policy
//! can be derived mechanically instead of re-decided at every call site.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("container pool stopped")]
    PoolStopped,

    #[error("container pool exhausted: no sandbox available within {0:?}")]
    ResourceExhausted(Duration),

    #[error("sandbox liveness check failed: {0}")]
    SandboxDead(String),

    #[error("sandbox protocol error: {0}")]
    SandboxProtocol(String),

    #[error("circuit open for datafeed {0}")]
    CircuitOpen(String),

    #[error("rate limit wait cancelled")]
    RateLimited,

    #[error("upstream responded with permanent error: {0}")]
    Permanent(String),

    #[error("record decode failed: {0}")]
    Decode(String),

    #[error("commit failed after exhausting retries: {0}")]
    CommitFailed(String),

    #[error("{0}")]
    Other(String),
}

/// Broad classification used to pick a retry strategy without re-deriving
/// it from the concrete error variant at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Likely to succeed if retried: network blips, 5xx, 429, commit races.
    Transient,
    /// Will never succeed if retried: bad input, 4xx "permanent" codes.
    Permanent,
    /// Transient, but the retry must honor a server-supplied delay.
    RateLimited,
}

impl DispatchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DispatchError::Redis(_) => ErrorCategory::Transient,
            DispatchError::Http(e) if e.is_timeout() || e.is_connect() => ErrorCategory::Transient,
            DispatchError::Http(_) => ErrorCategory::Transient,
            DispatchError::Serde(_) => ErrorCategory::Permanent,
            DispatchError::PoolStopped => ErrorCategory::Permanent,
            DispatchError::ResourceExhausted(_) => ErrorCategory::Transient,
            DispatchError::SandboxDead(_) => ErrorCategory::Transient,
            DispatchError::SandboxProtocol(_) => ErrorCategory::Transient,
            DispatchError::CircuitOpen(_) => ErrorCategory::Transient,
            DispatchError::RateLimited => ErrorCategory::RateLimited,
            DispatchError::Permanent(_) => ErrorCategory::Permanent,
            DispatchError::Decode(_) => ErrorCategory::Permanent,
            DispatchError::CommitFailed(_) => ErrorCategory::Transient,
            DispatchError::Other(_) => ErrorCategory::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Permanent)
    }
}

/// Retry policy attached to an `ErrorCategory`.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    NoRetry,
    ExponentialBackoff {
        base_delay_ms: u64,
        max_delay_ms: u64,
        max_retries: u32,
    },
}

impl ErrorCategory {
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            ErrorCategory::Transient => RetryStrategy::ExponentialBackoff {
                base_delay_ms: 500,
                max_delay_ms: 30_000,
                max_retries: 5,
            },
            ErrorCategory::RateLimited => RetryStrategy::ExponentialBackoff {
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
                max_retries: 8,
            },
            ErrorCategory::Permanent => RetryStrategy::NoRetry,
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.retry_strategy().should_retry(attempt)
    }
}

impl RetryStrategy {
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self {
            RetryStrategy::NoRetry => false,
            RetryStrategy::ExponentialBackoff { max_retries, .. } => attempt < *max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            RetryStrategy::NoRetry => 0,
            RetryStrategy::ExponentialBackoff { max_retries, .. } => *max_retries,
        }
    }

    /// Delay before the n-th retry attempt (0-indexed), with +/-25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::NoRetry => Duration::ZERO,
            RetryStrategy::ExponentialBackoff {
                base_delay_ms,
                max_delay_ms,
                ..
            } => {
                let raw = base_delay_ms.saturating_mul(1u64 << attempt.min(20));
                let capped = raw.min(*max_delay_ms);
                Duration::from_millis(apply_jitter(capped))
            }
        }
    }
}

/// Jitter a millisecond delay by +/-25%, deterministically seeded off the
/// current time so this stays free of external RNG dependencies.
fn apply_jitter(delay_ms: u64) -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    let hashed = RandomState::new().hash_one(std::time::Instant::now());
    let factor = (hashed % 50) as f64 / 100.0 + 0.75; // 0.75..=1.24
    ((delay_ms as f64) * factor) as u64
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_errors_never_retry() {
        let err = DispatchError::Decode("bad json".into());
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert!(!err.is_retryable());
        assert_eq!(err.category().retry_strategy(), RetryStrategy::NoRetry);
    }

    #[test]
    fn transient_errors_retry_with_backoff() {
        let strategy = ErrorCategory::Transient.retry_strategy();
        assert!(strategy.should_retry(0));
        assert!(strategy.should_retry(4));
        assert!(!strategy.should_retry(5));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let strategy = RetryStrategy::ExponentialBackoff {
            base_delay_ms: 100,
            max_delay_ms: 1000,
            max_retries: 10,
        };
        let d0 = strategy.delay_for_attempt(0).as_millis() as u64;
        let d5 = strategy.delay_for_attempt(5).as_millis() as u64;
        assert!(d0 <= 125 && d0 >= 75);
        assert!(d5 <= 1250); // capped at max_delay_ms plus jitter headroom
    }
}
