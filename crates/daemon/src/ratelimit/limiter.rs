//! Sliding-window rate limiter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::reputation::{BlockPolicy, Reputation};
use super::{RateDecision, RateLimitedOperation};
use crate::config::{RateLimitConfig, WindowConfig};

/// What a sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Windows with no attempts left.
    pub windows_dropped: usize,
    /// Blocks that had elapsed.
    pub unblocked: usize,
    /// Idle reputations forgotten.
    pub reputations_dropped: usize,
}

/// Per-client, per-operation rate limiter with reputation tracking.
///
/// Windows and reputations live in separate concurrent maps; each check
/// locks only the entries it touches.
pub struct RateLimiter {
    windows: DashMap<(String, RateLimitedOperation), VecDeque<Instant>>,
    reputations: DashMap<String, Reputation>,
    config: RateLimitConfig,
    policy: BlockPolicy,
}

impl RateLimiter {
    /// Creates a rate limiter from configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let policy = BlockPolicy::from_config(&config);
        Self {
            windows: DashMap::new(),
            reputations: DashMap::new(),
            config,
            policy,
        }
    }

    fn limits(&self, operation: RateLimitedOperation) -> WindowConfig {
        match operation {
            RateLimitedOperation::Create => self.config.create,
            RateLimitedOperation::Join => self.config.join,
            RateLimitedOperation::Verify => self.config.verify,
            RateLimitedOperation::Heartbeat => self.config.heartbeat,
        }
    }

    /// Checks and records `cost` attempts of `operation` by `client_id`.
    ///
    /// Refused attempts are not recorded in the window. Overrunning the
    /// window counts as a failed attempt. A `cost` larger than the whole
    /// window can never pass; it is refused with `retry_after` equal to the
    /// window and leaves the reputation untouched.
    pub fn is_allowed(
        &self,
        client_id: &str,
        operation: RateLimitedOperation,
        cost: u32,
    ) -> RateDecision {
        let now = Instant::now();

        if let Some(mut rep) = self.reputations.get_mut(client_id) {
            if let Some(until) = rep.blocked_at(now) {
                return RateDecision::Blocked {
                    until,
                    reason: format!(
                        "blocked after repeated failures ({} blocks so far)",
                        rep.block_count
                    ),
                };
            }
            if rep.refresh_block(now) {
                tracing::info!(client_id = %client_id, "Client block lifted");
            }
        }

        let limits = self.limits(operation);
        let window = limits.window();
        if cost > limits.max_attempts {
            tracing::debug!(
                client_id = %client_id,
                operation = %operation,
                cost,
                max_attempts = limits.max_attempts,
                "Cost exceeds window capacity"
            );
            return RateDecision::LimitExceeded { retry_after: window };
        }

        let decision = {
            let mut attempts = self
                .windows
                .entry((client_id.to_string(), operation))
                .or_default();
            prune(&mut attempts, now, window);

            if attempts.len() + cost as usize > limits.max_attempts as usize {
                let oldest = attempts.front().copied().unwrap_or(now);
                RateDecision::LimitExceeded {
                    retry_after: (oldest + window).saturating_duration_since(now),
                }
            } else {
                attempts.extend(std::iter::repeat(now).take(cost as usize));
                RateDecision::Allowed
            }
        };

        if let RateDecision::LimitExceeded { retry_after } = &decision {
            tracing::warn!(
                client_id = %client_id,
                operation = %operation,
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            self.record_failed_attempt(client_id);
        }

        decision
    }

    /// Records a failed attempt. Returns the block deadline if the client
    /// just got blocked.
    pub fn record_failed_attempt(&self, client_id: &str) -> Option<Instant> {
        let now = Instant::now();
        let mut rep = self
            .reputations
            .entry(client_id.to_string())
            .or_insert_with(|| Reputation::new(now));

        let blocked = rep.record_failure(now, &self.policy);
        if let Some(until) = blocked {
            tracing::warn!(
                client_id = %client_id,
                block_count = rep.block_count,
                block_secs = until.duration_since(now).as_secs(),
                "Client blocked"
            );
        }
        blocked
    }

    /// Records a successful attempt.
    pub fn record_success(&self, client_id: &str) {
        let now = Instant::now();
        self.reputations
            .entry(client_id.to_string())
            .or_insert_with(|| Reputation::new(now))
            .record_success(now, &self.policy);
    }

    /// Snapshot of a client's reputation.
    pub fn reputation(&self, client_id: &str) -> Option<Reputation> {
        self.reputations.get(client_id).map(|rep| rep.clone())
    }

    /// Number of clients with a reputation record.
    pub fn tracked_clients(&self) -> usize {
        self.reputations.len()
    }

    /// Prunes stale attempts, lifts elapsed blocks and forgets idle clients.
    pub fn cleanup(&self) -> SweepStats {
        let now = Instant::now();
        let retention = Duration::from_secs(self.config.retention_secs);
        let mut stats = SweepStats::default();

        self.windows.retain(|(_, operation), attempts| {
            prune(attempts, now, self.limits(*operation).window());
            let keep = !attempts.is_empty();
            if !keep {
                stats.windows_dropped += 1;
            }
            keep
        });

        self.reputations.retain(|_, rep| {
            if rep.refresh_block(now) {
                stats.unblocked += 1;
            }
            let keep = rep.is_blocked || now.duration_since(rep.last_seen) < retention;
            if !keep {
                stats.reputations_dropped += 1;
            }
            keep
        });

        if stats != SweepStats::default() {
            tracing::debug!(
                windows_dropped = stats.windows_dropped,
                unblocked = stats.unblocked,
                reputations_dropped = stats.reputations_dropped,
                "Rate limiter sweep"
            );
        }
        stats
    }

    /// Starts a background task that periodically calls
    /// [`RateLimiter::cleanup`] until `cancel` fires.
    pub fn start_cleanup_task(
        self: &Arc<Self>,
        interval_secs: u64,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        limiter.cleanup();
                    }
                }
            }
            tracing::debug!("Rate limiter sweep task stopped");
        })
    }
}

fn prune(attempts: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = attempts.front() {
        if now.duration_since(oldest) >= window {
            attempts.pop_front();
        } else {
            break;
        }
    }
}
