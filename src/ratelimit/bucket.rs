//! Token bucket state and refill math.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// Process-wide bucket parameters shared by every key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Tokens added per second
    rate: f64,
    /// Maximum tokens a bucket can hold
    capacity: f64,
}

impl BucketConfig {
    /// Create a bucket configuration.
    ///
    /// Both `rate` and `capacity` must be finite and strictly positive.
    pub fn new(rate: f64, capacity: f64) -> Result<Self> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(TollgateError::Config(format!(
                "rate must be a positive number, got {}",
                rate
            )));
        }
        if !(capacity.is_finite() && capacity > 0.0) {
            return Err(TollgateError::Config(format!(
                "capacity must be a positive number, got {}",
                capacity
            )));
        }
        Ok(Self { rate, capacity })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }
}

/// The admission budget for one bucket key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently available, `0 <= tokens <= capacity`
    pub tokens: f64,
    /// Timestamp of the last refill in milliseconds since the epoch
    #[serde(rename = "lastRefillTime")]
    pub last_refill_ms: i64,
}

impl BucketState {
    /// A fresh bucket starts with a full budget.
    pub fn full(config: &BucketConfig, now_ms: i64) -> Self {
        Self {
            tokens: config.capacity,
            last_refill_ms: now_ms,
        }
    }
}

/// Bring `state` forward to `now_ms`.
///
/// Negative elapsed time (clock skew, out-of-order observations) adds
/// nothing. The refill time always becomes `now_ms`, so accrual resumes from
/// the current clock after it steps backwards.
pub fn refill(state: BucketState, now_ms: i64, config: &BucketConfig) -> BucketState {
    let elapsed = now_ms.saturating_sub(state.last_refill_ms).max(0);
    let added = elapsed as f64 * config.rate / 1000.0;

    BucketState {
        tokens: (state.tokens + added).min(config.capacity),
        last_refill_ms: now_ms,
    }
}

/// Result of one admission attempt against a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    /// The state to persist
    pub state: BucketState,
    /// Whether a token was taken
    pub admitted: bool,
}

/// Refill `current` (or a fresh bucket when absent) and try to take one token.
///
/// A denial leaves the token count untouched but still carries the updated
/// refill timestamp, which must be persisted.
pub fn admit(current: Option<BucketState>, now_ms: i64, config: &BucketConfig) -> Admission {
    let current = current.unwrap_or_else(|| BucketState::full(config, now_ms));
    let mut state = refill(current, now_ms, config);

    let admitted = state.tokens >= 1.0;
    if admitted {
        state.tokens -= 1.0;
    }

    Admission { state, admitted }
}
