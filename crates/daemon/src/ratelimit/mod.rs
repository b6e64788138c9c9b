//! Rate limiting for signaling requests.
//!
//! Every signaling request passes a per-client, per-operation sliding window.
//! Repeated failures (wrong codes, failed verifications, window overruns)
//! accumulate in a reputation record that can block a client with
//! exponentially growing durations.

pub mod limiter;
pub mod reputation;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use limiter::{RateLimiter, SweepStats};
pub use reputation::{BlockPolicy, Reputation};

/// Signaling operations with their own window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitedOperation {
    /// Creating a session.
    Create,
    /// Joining with a code.
    Join,
    /// Verifying a fingerprint.
    Verify,
    /// Heartbeats and session teardown.
    Heartbeat,
}

impl std::fmt::Display for RateLimitedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RateLimitedOperation::Create => "create",
            RateLimitedOperation::Join => "join",
            RateLimitedOperation::Verify => "verify",
            RateLimitedOperation::Heartbeat => "heartbeat",
        };
        f.write_str(s)
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    /// The attempt fits in the window and was recorded.
    Allowed,
    /// The window is full.
    LimitExceeded {
        /// Time until the oldest attempt leaves the window.
        retry_after: Duration,
    },
    /// The client is blocked.
    Blocked {
        /// When the block lifts.
        until: Instant,
        /// Why the client was blocked.
        reason: String,
    },
}

impl RateDecision {
    /// Returns true for [`RateDecision::Allowed`].
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }

    /// How long the caller should wait, if refused.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateDecision::Allowed => None,
            RateDecision::LimitExceeded { retry_after } => Some(*retry_after),
            RateDecision::Blocked { until, .. } => {
                Some(until.saturating_duration_since(Instant::now()))
            }
        }
    }
}
