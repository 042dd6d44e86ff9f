use std::time::{Duration, Instant};

use dashmap::DashMap;
use fleet_core::config::RateLimitSettings;
use tracing::warn;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// A depleted bucket refuses the request immediately. Nothing queues:
/// callers surface `retry_after` to their own callers instead of waiting.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit exceeded for `{key}`, retry after {retry_after:?}")]
    Exceeded {
        key: String,
        retry_after: Duration,
    },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub tokens_per_second: f64,
    /// Bucket capacity (maximum burst).
    pub max_burst: f64,
}

impl RateLimitConfig {
    /// Allow `count` requests per minute.
    pub fn per_minute(count: u64) -> Self {
        Self {
            tokens_per_second: count as f64 / 60.0,
            max_burst: count as f64,
        }
    }

    /// Allow `count` requests per second.
    pub fn per_second(count: u64) -> Self {
        Self {
            tokens_per_second: count as f64,
            max_burst: count as f64,
        }
    }

    /// Override the burst capacity.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.max_burst = burst as f64;
        self
    }
}

// ---------------------------------------------------------------------------
// Bucket (per-key state)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_burst: f64) -> Self {
        Self {
            tokens: max_burst,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, tokens_per_second: f64, max_burst: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * tokens_per_second).min(max_burst);
        self.last_refill = now;
    }

    fn try_consume(&mut self, tokens_per_second: f64, max_burst: f64) -> Result<(), Duration> {
        self.refill(tokens_per_second, max_burst);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / tokens_per_second))
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Keyed token buckets sharing one config.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Consume one token for `key`, or refuse with a retry hint.
    pub fn check(&self, key: &str) -> Result<(), RateLimitError> {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.config.max_burst));

        match bucket.try_consume(self.config.tokens_per_second, self.config.max_burst) {
            Ok(()) => Ok(()),
            Err(retry_after) => {
                warn!(key, ?retry_after, "rate limit exceeded");
                Err(RateLimitError::Exceeded {
                    key: key.to_string(),
                    retry_after,
                })
            }
        }
    }

    /// Approximate tokens remaining for `key`.
    pub fn remaining(&self, key: &str) -> f64 {
        match self.buckets.get(key) {
            Some(bucket) => {
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                (bucket.tokens + elapsed * self.config.tokens_per_second).min(self.config.max_burst)
            }
            None => self.config.max_burst,
        }
    }
}

// ---------------------------------------------------------------------------
// FleetRateLimiter
// ---------------------------------------------------------------------------

/// Two-tier limiter for command dispatch: a global bucket across the whole
/// fleet plus one bucket per target. The global check runs first so a noisy
/// batch cannot starve the per-target budgets unnoticed.
#[derive(Debug)]
pub struct FleetRateLimiter {
    global: RateLimiter,
    per_target: RateLimiter,
}

impl FleetRateLimiter {
    pub fn new(global: RateLimitConfig, per_target: RateLimitConfig) -> Self {
        Self {
            global: RateLimiter::new(global),
            per_target: RateLimiter::new(per_target),
        }
    }

    /// Build from config settings: the configured rate is the global budget,
    /// targets each get the same rate with the configured burst.
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        let global = RateLimitConfig::per_minute(settings.requests_per_minute);
        let per_target =
            RateLimitConfig::per_minute(settings.requests_per_minute).with_burst(settings.burst);
        Self::new(global, per_target)
    }

    /// Consume one token from both tiers. The first refusal wins.
    pub fn check(&self, target: &str) -> Result<(), RateLimitError> {
        self.global.check("global")?;
        self.per_target.check(target)?;
        Ok(())
    }

    pub fn remaining_for(&self, target: &str) -> f64 {
        self.per_target.remaining(target)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_allows_then_refuses() {
        let limiter = RateLimiter::new(RateLimitConfig::per_minute(60).with_burst(10));
        for _ in 0..10 {
            limiter.check("web-01").unwrap();
        }
        let err = limiter.check("web-01").unwrap_err();
        let RateLimitError::Exceeded { key, retry_after } = err;
        assert_eq!(key, "web-01");
        assert!(retry_after > Duration::ZERO);
    }

    #[test]
    fn keys_have_independent_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig::per_minute(60).with_burst(1));
        limiter.check("web-01").unwrap();
        assert!(limiter.check("web-01").is_err());
        limiter.check("web-02").unwrap();
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(RateLimitConfig::per_second(10).with_burst(1));
        limiter.check("k").unwrap();
        assert!(limiter.check("k").is_err());
        std::thread::sleep(Duration::from_millis(150));
        limiter.check("k").unwrap();
    }

    #[test]
    fn remaining_reports_capacity_for_unseen_key() {
        let limiter = RateLimiter::new(RateLimitConfig::per_minute(60).with_burst(10));
        assert_eq!(limiter.remaining("never-seen"), 10.0);
        limiter.check("seen").unwrap();
        assert!(limiter.remaining("seen") < 10.0);
    }

    #[test]
    fn fleet_limiter_per_target_tier() {
        let limiter = FleetRateLimiter::new(
            RateLimitConfig::per_minute(1000),
            RateLimitConfig::per_minute(60).with_burst(2),
        );
        limiter.check("web-01").unwrap();
        limiter.check("web-01").unwrap();
        assert!(limiter.check("web-01").is_err());
        // Other targets unaffected by web-01's depletion
        limiter.check("web-02").unwrap();
    }

    #[test]
    fn fleet_limiter_global_tier_caps_everything() {
        let limiter = FleetRateLimiter::new(
            RateLimitConfig::per_minute(60).with_burst(3),
            RateLimitConfig::per_minute(1000),
        );
        limiter.check("a").unwrap();
        limiter.check("b").unwrap();
        limiter.check("c").unwrap();
        let err = limiter.check("d").unwrap_err();
        let RateLimitError::Exceeded { key, .. } = err;
        assert_eq!(key, "global");
    }

    #[test]
    fn from_settings_uses_configured_burst() {
        let settings = RateLimitSettings {
            requests_per_minute: 60,
            burst: 2,
        };
        let limiter = FleetRateLimiter::from_settings(&settings);
        limiter.check("t").unwrap();
        limiter.check("t").unwrap();
        assert!(limiter.check("t").is_err());
    }
}
