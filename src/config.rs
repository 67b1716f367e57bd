//! Construction-time configuration for the engine.
//!
//! Every knob the crawler, limiter, breaker, and profile pool accept lives
//! here so a deployment can be described by a single JSON file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Aggressiveness of anti-detection effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StealthLevel {
    Low,
    Medium,
    #[default]
    High,
    Extreme,
}

impl StealthLevel {
    /// Scale factor applied to behavior-simulator delays.
    pub fn delay_multiplier(self) -> f64 {
        match self {
            StealthLevel::Low => 0.5,
            StealthLevel::Medium => 1.0,
            StealthLevel::High => 1.5,
            StealthLevel::Extreme => 2.5,
        }
    }

    /// Whether every crawl must check out a fresh identity.
    pub fn force_new_profile(self) -> bool {
        matches!(self, StealthLevel::Extreme)
    }
}

impl std::str::FromStr for StealthLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(StealthLevel::Low),
            "medium" => Ok(StealthLevel::Medium),
            "high" => Ok(StealthLevel::High),
            "extreme" => Ok(StealthLevel::Extreme),
            other => Err(format!("unknown stealth level: {other}")),
        }
    }
}

/// Rate-limiting algorithm selectable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    TokenBucket,
    LeakyBucket,
    SlidingWindow,
    Adaptive,
}

/// Per-domain override for the rate limiter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DomainRate {
    pub requests_per_second: f64,
    pub burst_size: u32,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub algorithm: RateLimitAlgorithm,
    pub requests_per_second: f64,
    pub burst_size: u32,
    /// Adaptive-mode floor.
    pub min_requests_per_second: f64,
    /// Adaptive-mode ceiling.
    pub max_requests_per_second: f64,
    /// Successes in a row before adaptive mode raises the rate.
    pub raise_after_successes: u32,
    pub per_domain: HashMap<String, DomainRate>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::TokenBucket,
            requests_per_second: 2.0,
            burst_size: 10,
            min_requests_per_second: 0.1,
            max_requests_per_second: 8.0,
            raise_after_successes: 10,
            per_domain: HashMap::new(),
        }
    }
}

/// Runtime strategy swap accepted by `Crawler::set_rate_limit_strategy`.
/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitStrategy {
    pub algorithm: Option<RateLimitAlgorithm>,
    pub requests_per_second: Option<f64>,
    pub burst_size: Option<u32>,
}

/// Circuit breaker thresholds, applied per domain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures inside the tracking window that trip the breaker.
    pub failure_threshold: u32,
    /// Tracking window for consecutive failures, in seconds.
    pub window_secs: u64,
    /// Cool-down before an open breaker admits probes, in seconds.
    pub timeout_secs: u64,
    /// Probes admitted while half-open.
    pub half_open_requests: u32,
    /// Probe successes needed to close again.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            timeout_secs: 60,
            half_open_requests: 3,
            success_threshold: 2,
        }
    }
}

/// Retry policy for retryable failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Profile pool sizing and lifecycle thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_profiles: usize,
    /// A profile used this many times is excluded from selection.
    pub rotation_after: u32,
    /// Success-rate floor; profiles below it are banned once observed enough.
    pub ban_threshold: f64,
    /// Outcomes observed before the ban threshold applies.
    pub ban_min_observations: u32,
    /// EMA weight for success-rate updates.
    pub success_alpha: f64,
    pub cleanup_after_days: i64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_profiles: 100,
            rotation_after: 100,
            ban_threshold: 0.5,
            ban_min_observations: 5,
            success_alpha: 0.2,
            cleanup_after_days: 30,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CrawlerConfig {
    pub stealth: StealthLevel,
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub pool: PoolConfig,
    pub limits: RequestLimits,
    /// Append-only JSONL audit trail, if set.
    pub audit_log: Option<PathBuf>,
}

/// Concurrency and timeout bounds for outbound requests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestLimits {
    pub max_concurrent_requests: usize,
    pub connect_timeout_ms: u64,
    pub total_timeout_ms: u64,
    /// Operational cap on the behavior-simulator pre-request delay.
    pub max_pre_request_delay_ms: u64,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 4,
            connect_timeout_ms: 10_000,
            total_timeout_ms: 30_000,
            max_pre_request_delay_ms: 120_000,
        }
    }
}

impl CrawlerConfig {
    /// Load configuration from a JSON file. Missing fields fall back to
    /// defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config: {}", path.display()))
    }
}
