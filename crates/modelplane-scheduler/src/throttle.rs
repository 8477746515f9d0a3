//! Token-bucket admission throttles

use modelplane_core::{ModelPlaneError, ModelPlaneResult, RateLimiterConfig};
use std::sync::Mutex;
use std::time::Instant;

/// Token bucket with a refill rate and a burst capacity
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Current number of tokens
    tokens: f64,
    /// Last time tokens were added
    last_update: Instant,
    /// Maximum tokens (burst capacity)
    max_tokens: f64,
    /// Tokens added per second
    refill_rate: f64,
}

impl TokenBucket {
    /// A full bucket
    pub fn new(refill_rate: f64, max_tokens: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_update: Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    /// Try to consume a token, returning true if successful
    pub fn try_consume(&mut self) -> bool {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Refill tokens based on elapsed time
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update);
        let new_tokens = elapsed.as_secs_f64() * self.refill_rate;

        self.tokens = (self.tokens + new_tokens).min(self.max_tokens);
        self.last_update = now;
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn burst(&self) -> f64 {
        self.max_tokens
    }
}

/// Per-node share of a cluster-wide rate limit
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Split `config` evenly over `eligible_nodes`.
    ///
    /// Steady rate is `limit / N / unit_secs` tokens per second and the burst
    /// is `max(limit / N, 1)`.
    pub fn for_nodes(config: &RateLimiterConfig, eligible_nodes: usize) -> ModelPlaneResult<Self> {
        if eligible_nodes == 0 {
            return Err(ModelPlaneError::NoEligibleNodes(
                "cannot size a rate limiter over zero nodes".to_string(),
            ));
        }
        if config.limit.is_nan() || config.limit <= 0.0 || config.unit_secs == 0 {
            return Err(ModelPlaneError::validation(format!(
                "invalid rate limit {} per {}s",
                config.limit, config.unit_secs
            )));
        }
        let per_node = config.limit / eligible_nodes as f64;
        let refill_rate = per_node / config.unit_secs as f64;
        Ok(Self {
            bucket: Mutex::new(TokenBucket::new(refill_rate, per_node.max(1.0))),
        })
    }

    /// Take one token; false when throttled
    pub fn try_acquire(&self) -> bool {
        match self.bucket.lock() {
            Ok(mut bucket) => bucket.try_consume(),
            Err(poisoned) => poisoned.into_inner().try_consume(),
        }
    }

    fn with_bucket<T>(&self, f: impl FnOnce(&TokenBucket) -> T) -> T {
        match self.bucket.lock() {
            Ok(bucket) => f(&bucket),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    pub fn refill_rate(&self) -> f64 {
        self.with_bucket(TokenBucket::refill_rate)
    }

    pub fn burst(&self) -> f64 {
        self.with_bucket(TokenBucket::burst)
    }
}
