//! Per-client reputation and blocking.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::RateLimitConfig;

/// When and for how long clients are blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPolicy {
    /// Failures that trigger a block.
    pub failure_threshold: u32,
    /// First block length.
    pub base_block: Duration,
    /// Cap on any single block.
    pub max_block: Duration,
    /// Successes that forgive one failure.
    pub success_decay: u32,
}

impl BlockPolicy {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            base_block: Duration::from_secs(config.base_block_secs),
            max_block: Duration::from_secs(config.max_block_secs),
            success_decay: config.success_decay,
        }
    }

    /// Length of the block following `previous_blocks` earlier ones:
    /// `base * 2^previous_blocks`, capped at `max_block`.
    pub fn block_duration(&self, previous_blocks: u32) -> Duration {
        1u32.checked_shl(previous_blocks)
            .and_then(|factor| self.base_block.checked_mul(factor))
            .map_or(self.max_block, |d| d.min(self.max_block))
    }
}

/// Failure and success history of one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reputation {
    /// Failures since the last block.
    pub failed_attempts: u32,
    /// Successes since the record was created.
    pub successful_attempts: u64,
    /// Whether a block is in force.
    pub is_blocked: bool,
    /// When the current block lifts.
    pub blocked_until: Option<Instant>,
    /// Blocks imposed so far.
    pub block_count: u32,
    /// Last failure or success.
    pub last_seen: Instant,
}

impl Reputation {
    pub fn new(now: Instant) -> Self {
        Self {
            failed_attempts: 0,
            successful_attempts: 0,
            is_blocked: false,
            blocked_until: None,
            block_count: 0,
            last_seen: now,
        }
    }

    /// Records a failure. Returns the block deadline if this failure caused
    /// a block.
    pub fn record_failure(&mut self, now: Instant, policy: &BlockPolicy) -> Option<Instant> {
        self.last_seen = now;
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        if self.failed_attempts < policy.failure_threshold {
            return None;
        }

        let until = now + policy.block_duration(self.block_count);
        self.is_blocked = true;
        self.blocked_until = Some(until);
        self.block_count = self.block_count.saturating_add(1);
        self.failed_attempts = 0;
        Some(until)
    }

    /// Records a success; every `success_decay` successes forgive one failure.
    pub fn record_success(&mut self, now: Instant, policy: &BlockPolicy) {
        self.last_seen = now;
        self.successful_attempts = self.successful_attempts.saturating_add(1);
        if policy.success_decay > 0 && self.successful_attempts % policy.success_decay as u64 == 0
        {
            self.failed_attempts = self.failed_attempts.saturating_sub(1);
        }
    }

    /// Lifts an elapsed block. Returns true if a block was lifted.
    pub fn refresh_block(&mut self, now: Instant) -> bool {
        match self.blocked_until {
            Some(until) if self.is_blocked && now >= until => {
                self.is_blocked = false;
                self.blocked_until = None;
                true
            }
            _ => false,
        }
    }

    /// The block deadline if a block is in force at `now`.
    pub fn blocked_at(&self, now: Instant) -> Option<Instant> {
        match self.blocked_until {
            Some(until) if self.is_blocked && now < until => Some(until),
            _ => None,
        }
    }
}
