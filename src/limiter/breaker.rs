//! Per-domain circuit breaker.
//!
//! State machine: CLOSED → (failure_threshold failures inside the tracking
//! window) → OPEN → (cool-down elapses) → HALF_OPEN, which admits exactly
//! `half_open_requests` probes. `success_threshold` probe successes close
//! the breaker; any probe failure reopens it. The cycle never terminates.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use crate::config::BreakerConfig;

/// Observable breaker state for a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct DomainBreaker {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    probes_admitted: u32,
    probe_successes: u32,
}

impl DomainBreaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            last_failure: None,
            opened_at: None,
            probes_admitted: 0,
            probe_successes: 0,
        }
    }
}

/// Failure-isolation table keyed by domain. Entries lock independently,
/// so one domain tripping never stalls traffic to another.
pub struct CircuitBreaker {
    table: DashMap<String, DomainBreaker>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            table: DashMap::new(),
            config,
        }
    }

    /// Ask permission to issue a request. `Err` carries the remaining
    /// cool-down; callers surface it as `CircuitOpen` without touching the
    /// network.
    pub fn admit(&self, domain: &str) -> Result<(), Duration> {
        self.admit_at(domain, Instant::now())
    }

    pub fn record_success(&self, domain: &str) {
        let mut entry = self
            .table
            .entry(domain.to_string())
            .or_insert_with(DomainBreaker::new);
        match entry.state {
            BreakerState::Closed => {
                entry.failures = 0;
            }
            BreakerState::HalfOpen => {
                entry.probe_successes += 1;
                if entry.probe_successes >= self.config.success_threshold {
                    entry.state = BreakerState::Closed;
                    entry.failures = 0;
                    entry.opened_at = None;
                    entry.probes_admitted = 0;
                    entry.probe_successes = 0;
                }
            }
            // A straggler response from before the breaker opened.
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self, domain: &str) {
        self.record_failure_at(domain, Instant::now());
    }

    /// Current state for a domain; CLOSED for domains never seen.
    pub fn state(&self, domain: &str) -> BreakerState {
        self.table
            .get(domain)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Drop all per-domain state.
    pub fn reset(&self) {
        self.table.clear();
    }

    fn admit_at(&self, domain: &str, now: Instant) -> Result<(), Duration> {
        let mut entry = self
            .table
            .entry(domain.to_string())
            .or_insert_with(DomainBreaker::new);
        match entry.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = entry.opened_at.unwrap_or(now);
                let cool_down = Duration::from_secs(self.config.timeout_secs);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= cool_down {
                    // This caller becomes the first half-open probe.
                    entry.state = BreakerState::HalfOpen;
                    entry.probes_admitted = 1;
                    entry.probe_successes = 0;
                    Ok(())
                } else {
                    Err(cool_down - elapsed)
                }
            }
            BreakerState::HalfOpen => {
                if entry.probes_admitted < self.config.half_open_requests {
                    entry.probes_admitted += 1;
                    Ok(())
                } else {
                    // Probe budget spent; wait for the probes to resolve.
                    Err(Duration::from_secs(self.config.timeout_secs))
                }
            }
        }
    }

    fn record_failure_at(&self, domain: &str, now: Instant) {
        let mut entry = self
            .table
            .entry(domain.to_string())
            .or_insert_with(DomainBreaker::new);
        match entry.state {
            BreakerState::Closed => {
                let window = Duration::from_secs(self.config.window_secs);
                let stale = entry
                    .last_failure
                    .map(|t| now.saturating_duration_since(t) > window)
                    .unwrap_or(false);
                entry.failures = if stale { 1 } else { entry.failures + 1 };
                entry.last_failure = Some(now);
                if entry.failures >= self.config.failure_threshold {
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                // Any probe failure reopens immediately.
                entry.state = BreakerState::Open;
                entry.opened_at = Some(now);
                entry.probes_admitted = 0;
                entry.probe_successes = 0;
            }
            BreakerState::Open => {
                entry.last_failure = Some(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            window_secs: 60,
            timeout_secs: 60,
            half_open_requests: 3,
            success_threshold: 2,
        }
    }

    #[test]
    fn opens_after_failure_threshold() {
        let cb = CircuitBreaker::new(config());
        let now = Instant::now();
        for _ in 0..4 {
            cb.record_failure_at("example.com", now);
        }
        assert_eq!(cb.state("example.com"), BreakerState::Closed);
        cb.record_failure_at("example.com", now);
        assert_eq!(cb.state("example.com"), BreakerState::Open);

        // The immediately following call is rejected with no side effects.
        assert!(cb.admit_at("example.com", now).is_err());
    }

    #[test]
    fn failures_outside_tracking_window_do_not_accumulate() {
        let cb = CircuitBreaker::new(config());
        let now = Instant::now();
        for i in 0..10 {
            // One failure every 2 minutes: window (60s) resets the count.
            cb.record_failure_at("example.com", now + Duration::from_secs(i * 120));
        }
        assert_eq!(cb.state("example.com"), BreakerState::Closed);
    }

    #[test]
    fn cool_down_admits_exactly_half_open_requests_probes() {
        let cb = CircuitBreaker::new(config());
        let now = Instant::now();
        for _ in 0..5 {
            cb.record_failure_at("example.com", now);
        }
        assert!(cb.admit_at("example.com", now).is_err());

        let after = now + Duration::from_secs(61);
        assert!(cb.admit_at("example.com", after).is_ok());
        assert_eq!(cb.state("example.com"), BreakerState::HalfOpen);
        assert!(cb.admit_at("example.com", after).is_ok());
        assert!(cb.admit_at("example.com", after).is_ok());
        // Fourth probe exceeds the budget.
        assert!(cb.admit_at("example.com", after).is_err());
    }

    #[test]
    fn probe_successes_close_the_breaker() {
        let cb = CircuitBreaker::new(config());
        let now = Instant::now();
        for _ in 0..5 {
            cb.record_failure_at("example.com", now);
        }
        let after = now + Duration::from_secs(61);
        for _ in 0..3 {
            cb.admit_at("example.com", after).unwrap();
        }

        cb.record_success("example.com");
        assert_eq!(cb.state("example.com"), BreakerState::HalfOpen);
        cb.record_success("example.com");
        assert_eq!(cb.state("example.com"), BreakerState::Closed);

        // A failure after closing counts toward a fresh threshold.
        cb.record_failure_at("example.com", after);
        assert_eq!(cb.state("example.com"), BreakerState::Closed);
    }

    #[test]
    fn probe_failure_reopens() {
        let cb = CircuitBreaker::new(config());
        let now = Instant::now();
        for _ in 0..5 {
            cb.record_failure_at("example.com", now);
        }
        let after = now + Duration::from_secs(61);
        cb.admit_at("example.com", after).unwrap();
        cb.record_success("example.com");
        cb.admit_at("example.com", after).unwrap();
        cb.record_failure_at("example.com", after);

        assert_eq!(cb.state("example.com"), BreakerState::Open);
        assert!(cb.admit_at("example.com", after).is_err());

        // It cools down and probes again — the cycle never terminates.
        let again = after + Duration::from_secs(61);
        assert!(cb.admit_at("example.com", again).is_ok());
    }

    #[test]
    fn domains_are_isolated() {
        let cb = CircuitBreaker::new(config());
        let now = Instant::now();
        for _ in 0..5 {
            cb.record_failure_at("a.com", now);
        }
        assert_eq!(cb.state("a.com"), BreakerState::Open);
        assert_eq!(cb.state("b.com"), BreakerState::Closed);
        assert!(cb.admit_at("b.com", now).is_ok());
    }
}
