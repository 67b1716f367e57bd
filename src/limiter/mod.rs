//! Per-domain throttling: rate limiter and circuit breaker.

pub mod breaker;
pub mod bucket;

use dashmap::DashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::config::{RateLimitConfig, RateLimitStrategy};
use bucket::DomainBucket;

/// Longest single cooperative sleep while waiting for a slot, so strategy
/// swaps take effect promptly on waiting tasks.
const MAX_WAIT_SLICE: Duration = Duration::from_secs(5);

/// Domain-keyed rate limiter. Each domain gets its own bucket; entries
/// lock independently so domains throttle in parallel.
pub struct RateLimiter {
    buckets: DashMap<String, DomainBucket>,
    config: RwLock<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config: RwLock::new(config),
        }
    }

    /// Non-blocking acquisition. `Err` carries the wait until the next
    /// slot, for callers that surface `RateLimitExceeded` instead of
    /// sleeping.
    pub fn try_acquire(&self, domain: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut bucket = self.bucket_for(domain, now);
        if bucket.try_acquire(now) {
            Ok(())
        } else {
            Err(bucket.wait_time(now))
        }
    }

    /// Cooperative acquisition: sleeps until a slot opens. Other tasks are
    /// never blocked by this wait.
    pub async fn acquire(&self, domain: &str) {
        loop {
            let wait = match self.try_acquire(domain) {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tokio::time::sleep(wait.min(MAX_WAIT_SLICE).max(Duration::from_millis(10))).await;
        }
    }

    /// Seconds until a request to `domain` would be admitted.
    pub fn recommended_wait(&self, domain: &str) -> Duration {
        let now = Instant::now();
        self.bucket_for(domain, now).wait_time(now)
    }

    /// Feed a crawl outcome to the adaptive controller for `domain`.
    pub fn record_outcome(&self, domain: &str, success: bool) {
        let now = Instant::now();
        self.bucket_for(domain, now).record_outcome(success);
    }

    /// Swap algorithm or parameters at runtime. Applies to existing
    /// buckets in place and to every bucket created afterwards.
    pub fn set_strategy(&self, strategy: &RateLimitStrategy) {
        {
            let mut config = self.config.write().expect("rate limit config poisoned");
            if let Some(algo) = strategy.algorithm {
                config.algorithm = algo;
            }
            if let Some(rps) = strategy.requests_per_second {
                config.requests_per_second = rps;
            }
            if let Some(burst) = strategy.burst_size {
                config.burst_size = burst;
            }
        }
        for mut entry in self.buckets.iter_mut() {
            entry.reconfigure(
                strategy.algorithm,
                strategy.requests_per_second,
                strategy.burst_size,
            );
        }
    }

    /// Drop all per-domain pacing state.
    pub fn reset(&self) {
        self.buckets.clear();
    }

    fn bucket_for(
        &self,
        domain: &str,
        now: Instant,
    ) -> dashmap::mapref::one::RefMut<'_, String, DomainBucket> {
        self.buckets
            .entry(domain.to_string())
            .or_insert_with(|| {
                let config = self.config.read().expect("rate limit config poisoned");
                let (rps, burst) = match config.per_domain.get(domain) {
                    Some(rate) => (rate.requests_per_second, rate.burst_size),
                    None => (config.requests_per_second, config.burst_size),
                };
                DomainBucket::new(config.algorithm, rps, burst, &config, now)
            })
    }
}
