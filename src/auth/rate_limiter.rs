//! Rate limiting and throttling.
//!
//! Token bucket per subject: each bucket holds up to `capacity` tokens and
//! gains `refill_amount` tokens every `refill_interval`. A request consumes one
//! token; an empty bucket rejects with the time until the next refill.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::types::{Error, Result};

/// Token bucket configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_amount: u32,
    #[serde(with = "humantime_serde")]
    pub refill_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            refill_amount: 1,
            refill_interval: Duration::from_secs(1),
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || self.refill_amount == 0 {
            return Err(Error::config(
                "rate_limit capacity and refill_amount must be non-zero",
            ));
        }
        if self.refill_interval.is_zero() {
            return Err(Error::config("rate_limit refill_interval must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: u32,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn full(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: config.capacity,
            last_refill: now,
            last_seen: now,
        }
    }

    /// Add every whole interval's worth of tokens accrued since the last refill.
    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let intervals = elapsed.as_nanos() / config.refill_interval.as_nanos();
        if intervals == 0 {
            return;
        }

        let added = intervals.saturating_mul(u128::from(config.refill_amount));
        let tokens = (u128::from(self.tokens) + added).min(u128::from(config.capacity));
        self.tokens = tokens as u32;

        if self.tokens == config.capacity {
            self.last_refill = now;
        } else {
            // Below capacity means fewer than `capacity` intervals elapsed.
            self.last_refill += config.refill_interval * intervals as u32;
        }
    }

    fn try_consume(
        &mut self,
        config: &RateLimitConfig,
        now: Instant,
    ) -> std::result::Result<(), Duration> {
        self.refill(config, now);
        self.last_seen = now;
        if self.tokens > 0 {
            self.tokens -= 1;
            return Ok(());
        }
        let since_refill = now.saturating_duration_since(self.last_refill);
        Err(config.refill_interval.saturating_sub(since_refill))
    }
}

/// Rate limiter - enforces request rate limits per subject.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    /// Build a limiter, rejecting configs that could never refill.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::unchecked(config))
    }

    fn unchecked(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, TokenBucket>> {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Consume one token for `subject`, or fail with `RateLimited`.
    pub fn check_and_consume(&self, subject: &str) -> Result<()> {
        self.check_and_consume_at(subject, Instant::now())
    }

    pub fn check_and_consume_at(&self, subject: &str, now: Instant) -> Result<()> {
        let mut buckets = self.buckets();
        let bucket = buckets
            .entry(subject.to_string())
            .or_insert_with(|| TokenBucket::full(&self.config, now));

        bucket.try_consume(&self.config, now).map_err(|retry_after| {
            tracing::debug!(subject, ?retry_after, "rate_limited");
            Error::rate_limited(subject, retry_after)
        })
    }

    /// Tokens currently available to `subject` (a full bucket if unseen).
    pub fn remaining(&self, subject: &str) -> u32 {
        self.remaining_at(subject, Instant::now())
    }

    pub fn remaining_at(&self, subject: &str, now: Instant) -> u32 {
        let mut buckets = self.buckets();
        match buckets.get_mut(subject) {
            Some(bucket) => {
                bucket.refill(&self.config, now);
                bucket.tokens
            }
            None => self.config.capacity,
        }
    }

    /// Clear the bucket for a subject.
    pub fn reset(&self, subject: &str) {
        self.buckets().remove(subject);
    }

    /// Drop buckets unused for at least `idle`. Returns how many were removed.
    ///
    /// Dropping a bucket is equivalent to refilling it, so only buckets that
    /// would be full again by now are removed.
    pub fn cleanup_idle(&self, idle: Duration) -> usize {
        self.cleanup_idle_at(idle, Instant::now())
    }

    pub fn cleanup_idle_at(&self, idle: Duration, now: Instant) -> usize {
        let config = &self.config;
        let mut buckets = self.buckets();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            bucket.refill(config, now);
            let idle_long_enough = now.saturating_duration_since(bucket.last_seen) >= idle;
            !(idle_long_enough && bucket.tokens == config.capacity)
        });
        before - buckets.len()
    }

    pub fn tracked_subjects(&self) -> usize {
        self.buckets().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unchecked(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, refill_amount: u32, interval_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            capacity,
            refill_amount,
            refill_interval: Duration::from_millis(interval_ms),
        })
        .unwrap()
    }

    #[test]
    fn test_allows_up_to_capacity() {
        let limiter = limiter(3, 1, 1000);
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check_and_consume_at("alice", now).is_ok());
        }
        let err = limiter.check_and_consume_at("alice", now).unwrap_err();
        match err {
            Error::RateLimited {
                subject,
                retry_after,
            } => {
                assert_eq!(subject, "alice");
                assert_eq!(retry_after, Duration::from_millis(1000));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_refills_on_fixed_schedule() {
        let limiter = limiter(2, 1, 100);
        let t0 = Instant::now();

        limiter.check_and_consume_at("alice", t0).unwrap();
        limiter.check_and_consume_at("alice", t0).unwrap();
        assert!(limiter.check_and_consume_at("alice", t0).is_err());

        // Partial interval adds nothing.
        let t1 = t0 + Duration::from_millis(60);
        assert!(limiter.check_and_consume_at("alice", t1).is_err());

        // One full interval adds exactly one token.
        let t2 = t0 + Duration::from_millis(100);
        assert!(limiter.check_and_consume_at("alice", t2).is_ok());
        assert!(limiter.check_and_consume_at("alice", t2).is_err());

        // Long idle refills to capacity, never above.
        let t3 = t0 + Duration::from_secs(60);
        assert_eq!(limiter.remaining_at("alice", t3), 2);
    }

    #[test]
    fn test_retry_after_counts_down() {
        let limiter = limiter(1, 1, 1000);
        let t0 = Instant::now();
        limiter.check_and_consume_at("alice", t0).unwrap();

        let err = limiter
            .check_and_consume_at("alice", t0 + Duration::from_millis(300))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RateLimited { retry_after, .. } if retry_after == Duration::from_millis(700)
        ));
    }

    #[test]
    fn test_subjects_are_independent() {
        let limiter = limiter(1, 1, 1000);
        let now = Instant::now();
        limiter.check_and_consume_at("alice", now).unwrap();
        assert!(limiter.check_and_consume_at("alice", now).is_err());
        assert!(limiter.check_and_consume_at("bob", now).is_ok());
    }

    #[test]
    fn test_reset_restores_capacity() {
        let limiter = limiter(1, 1, 1000);
        let now = Instant::now();
        limiter.check_and_consume_at("alice", now).unwrap();
        limiter.reset("alice");
        assert!(limiter.check_and_consume_at("alice", now).is_ok());
    }

    #[test]
    fn test_cleanup_idle_keeps_drained_buckets() {
        let limiter = limiter(2, 1, 1000);
        let t0 = Instant::now();
        limiter.check_and_consume_at("idle", t0).unwrap();
        limiter.check_and_consume_at("busy", t0).unwrap();
        limiter.check_and_consume_at("busy", t0).unwrap();

        // After 1s "idle" is full again, "busy" still has one token missing.
        let later = t0 + Duration::from_secs(1);
        let removed = limiter.cleanup_idle_at(Duration::from_millis(500), later);
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_subjects(), 1);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(RateLimitConfig::default().validate().is_ok());
        let zero_capacity = RateLimitConfig {
            capacity: 0,
            ..Default::default()
        };
        assert!(zero_capacity.validate().is_err());
        let zero_interval = RateLimitConfig {
            refill_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(zero_interval.validate().is_err());

        let err = RateLimiter::new(zero_interval).unwrap_err();
        assert_eq!(err.kind(), crate::types::ErrorKind::Config);
    }
}
