//! Per-domain pacing state — token bucket and its siblings.
//!
//! Buckets are refilled lazily from elapsed wall-clock time at request
//! time; there is no background timer. All methods take an explicit `now`
//! so the algorithms are testable without sleeping.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::{RateLimitAlgorithm, RateLimitConfig};

/// Pacing state for a single domain.
#[derive(Debug)]
pub struct DomainBucket {
    algorithm: RateLimitAlgorithm,
    requests_per_second: f64,
    burst_size: f64,
    /// Token bucket: available tokens, bounded by `burst_size`.
    tokens: f64,
    last_refill: Instant,
    /// Leaky bucket: current queue depth.
    depth: f64,
    last_leak: Instant,
    /// Sliding window: request timestamps within the last second.
    window: VecDeque<Instant>,
    /// Adaptive mode bounds and streak counter.
    min_rps: f64,
    max_rps: f64,
    raise_after: u32,
    success_streak: u32,
}

impl DomainBucket {
    pub fn new(
        algorithm: RateLimitAlgorithm,
        requests_per_second: f64,
        burst_size: u32,
        config: &RateLimitConfig,
        now: Instant,
    ) -> Self {
        Self {
            algorithm,
            requests_per_second: requests_per_second.max(f64::EPSILON),
            burst_size: f64::from(burst_size.max(1)),
            tokens: f64::from(burst_size.max(1)),
            last_refill: now,
            depth: 0.0,
            last_leak: now,
            window: VecDeque::new(),
            min_rps: config.min_requests_per_second,
            max_rps: config.max_requests_per_second,
            raise_after: config.raise_after_successes.max(1),
            success_streak: 0,
        }
    }

    /// Swap algorithm or parameters in place, keeping pacing history.
    pub fn reconfigure(
        &mut self,
        algorithm: Option<RateLimitAlgorithm>,
        requests_per_second: Option<f64>,
        burst_size: Option<u32>,
    ) {
        if let Some(algo) = algorithm {
            self.algorithm = algo;
        }
        if let Some(rps) = requests_per_second {
            self.requests_per_second = rps.max(f64::EPSILON);
        }
        if let Some(burst) = burst_size {
            self.burst_size = f64::from(burst.max(1));
            self.tokens = self.tokens.min(self.burst_size);
        }
    }

    /// Try to take a slot. Returns `true` when the request may proceed.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.algorithm {
            RateLimitAlgorithm::TokenBucket | RateLimitAlgorithm::Adaptive => {
                self.refill(now);
                if self.tokens >= 1.0 {
                    self.tokens -= 1.0;
                    true
                } else {
                    false
                }
            }
            RateLimitAlgorithm::LeakyBucket => {
                self.leak(now);
                if self.depth + 1.0 <= self.burst_size {
                    self.depth += 1.0;
                    true
                } else {
                    false
                }
            }
            RateLimitAlgorithm::SlidingWindow => {
                self.trim_window(now);
                if (self.window.len() as f64) < self.requests_per_second + self.burst_size {
                    self.window.push_back(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Time until the next slot opens. Zero when a request would be
    /// admitted right now.
    pub fn wait_time(&mut self, now: Instant) -> Duration {
        match self.algorithm {
            RateLimitAlgorithm::TokenBucket | RateLimitAlgorithm::Adaptive => {
                self.refill(now);
                if self.tokens >= 1.0 {
                    Duration::ZERO
                } else {
                    Duration::from_secs_f64((1.0 - self.tokens) / self.requests_per_second)
                }
            }
            RateLimitAlgorithm::LeakyBucket => {
                self.leak(now);
                if self.depth + 1.0 <= self.burst_size {
                    Duration::ZERO
                } else {
                    let overflow = self.depth + 1.0 - self.burst_size;
                    Duration::from_secs_f64(overflow / self.requests_per_second)
                }
            }
            RateLimitAlgorithm::SlidingWindow => {
                self.trim_window(now);
                if (self.window.len() as f64) < self.requests_per_second + self.burst_size {
                    Duration::ZERO
                } else {
                    match self.window.front() {
                        Some(oldest) => {
                            (*oldest + Duration::from_secs(1)).saturating_duration_since(now)
                        }
                        None => Duration::ZERO,
                    }
                }
            }
        }
    }

    /// Feed an outcome to the adaptive controller. Sustained success raises
    /// the rate gently; a failure cuts it in half. Both stay inside the
    /// configured bounds. Outcomes are ignored by the fixed algorithms.
    pub fn record_outcome(&mut self, success: bool) {
        if self.algorithm != RateLimitAlgorithm::Adaptive {
            return;
        }
        if success {
            self.success_streak += 1;
            if self.success_streak >= self.raise_after {
                self.success_streak = 0;
                self.requests_per_second =
                    (self.requests_per_second * 1.25).min(self.max_rps);
            }
        } else {
            self.success_streak = 0;
            self.requests_per_second = (self.requests_per_second * 0.5).max(self.min_rps);
        }
    }

    pub fn requests_per_second(&self) -> f64 {
        self.requests_per_second
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.requests_per_second).min(self.burst_size);
        self.last_refill = now;
    }

    fn leak(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_leak).as_secs_f64();
        self.depth = (self.depth - elapsed * self.requests_per_second).max(0.0);
        self.last_leak = now;
    }

    fn trim_window(&mut self, now: Instant) {
        let cutoff = now.checked_sub(Duration::from_secs(1));
        while let (Some(front), Some(cutoff)) = (self.window.front(), cutoff) {
            if *front < cutoff {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn tokens(&self) -> f64 {
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(algorithm: RateLimitAlgorithm, rps: f64, burst: u32, now: Instant) -> DomainBucket {
        DomainBucket::new(algorithm, rps, burst, &RateLimitConfig::default(), now)
    }

    #[test]
    fn token_bucket_starts_full() {
        let now = Instant::now();
        let b = bucket(RateLimitAlgorithm::TokenBucket, 2.0, 10, now);
        assert_eq!(b.tokens(), 10.0);
    }

    #[test]
    fn token_bucket_consumes_and_blocks_when_empty() {
        let now = Instant::now();
        let mut b = bucket(RateLimitAlgorithm::TokenBucket, 1.0, 5, now);
        for _ in 0..5 {
            assert!(b.try_acquire(now));
        }
        assert!(!b.try_acquire(now));
    }

    #[test]
    fn token_bucket_refills_over_time_and_caps_at_burst() {
        let now = Instant::now();
        let mut b = bucket(RateLimitAlgorithm::TokenBucket, 5.0, 10, now);
        for _ in 0..10 {
            assert!(b.try_acquire(now));
        }

        // One second refills five tokens.
        let later = now + Duration::from_secs(1);
        assert_eq!(b.wait_time(later), Duration::ZERO);
        assert!((b.tokens() - 5.0).abs() < 0.01);

        // A long idle period never exceeds burst capacity.
        let much_later = now + Duration::from_secs(1_000);
        b.wait_time(much_later);
        assert!(b.tokens() <= 10.0);
    }

    #[test]
    fn token_bucket_wait_time_matches_rate() {
        let now = Instant::now();
        let mut b = bucket(RateLimitAlgorithm::TokenBucket, 1.0, 5, now);
        for _ in 0..5 {
            b.try_acquire(now);
        }
        let wait = b.wait_time(now);
        assert!((wait.as_secs_f64() - 1.0).abs() < 0.05);
    }

    #[test]
    fn leaky_bucket_fills_and_drains() {
        let now = Instant::now();
        let mut b = bucket(RateLimitAlgorithm::LeakyBucket, 1.0, 3, now);
        assert!(b.try_acquire(now));
        assert!(b.try_acquire(now));
        assert!(b.try_acquire(now));
        assert!(!b.try_acquire(now));

        // After two seconds at 1 rps, two slots have drained.
        let later = now + Duration::from_secs(2);
        assert!(b.try_acquire(later));
        assert!(b.try_acquire(later));
        assert!(!b.try_acquire(later));
    }

    #[test]
    fn sliding_window_bounds_one_second_throughput() {
        let now = Instant::now();
        let mut b = bucket(RateLimitAlgorithm::SlidingWindow, 2.0, 3, now);
        let capacity = 5; // rps + burst
        let mut admitted = 0;
        for i in 0..20 {
            let t = now + Duration::from_millis(i * 10);
            if b.try_acquire(t) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, capacity);

        // The window frees up once the oldest entries age out.
        let later = now + Duration::from_millis(1_500);
        assert!(b.try_acquire(later));
    }

    #[test]
    fn adaptive_raises_on_sustained_success_and_cuts_on_failure() {
        let now = Instant::now();
        let mut b = bucket(RateLimitAlgorithm::Adaptive, 2.0, 10, now);

        for _ in 0..10 {
            b.record_outcome(true);
        }
        assert!((b.requests_per_second() - 2.5).abs() < 0.01);

        b.record_outcome(false);
        assert!((b.requests_per_second() - 1.25).abs() < 0.01);

        // Bounded below by the configured floor.
        for _ in 0..20 {
            b.record_outcome(false);
        }
        assert!(b.requests_per_second() >= 0.1);

        // Bounded above by the ceiling.
        for _ in 0..500 {
            b.record_outcome(true);
        }
        assert!(b.requests_per_second() <= 8.0);
    }

    #[test]
    fn fixed_algorithms_ignore_outcomes() {
        let now = Instant::now();
        let mut b = bucket(RateLimitAlgorithm::TokenBucket, 2.0, 10, now);
        b.record_outcome(false);
        assert_eq!(b.requests_per_second(), 2.0);
    }
}
