//! Crawl orchestration.
//!
//! `Crawler` wires the profile pool, behavior simulator, rate limiter, and
//! circuit breaker around an exchangeable `Fetcher`. Each crawl runs the
//! same pipeline: resolve domain, gate on the breaker and limiter, check
//! out an identity, wait a human-like delay, fetch, classify, then fan the
//! outcome back out to every component.

pub mod detect;
pub mod extract;
pub mod fetch;

use futures::stream::{self, StreamExt};
use rand::Rng;
use serde_json::json;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use url::Url;
use uuid::Uuid;

use crate::audit::CrawlLog;
use crate::behavior::{ActionType, BehaviorFeedback, BehaviorSimulator, SessionStats};
use crate::config::{CrawlerConfig, PoolConfig, RateLimitStrategy, RequestLimits, RetryConfig, StealthLevel};
use crate::error::CrawlError;
use crate::limiter::breaker::CircuitBreaker;
use crate::limiter::RateLimiter;
use crate::profile::store::{MemoryStore, ProfileStore};
use crate::profile::{ProfileLease, ProfileManager};
use crate::render::{RenderRequest, RenderedPage, Renderer, NoopRenderer};
use detect::{BypassStrategy, ChallengeSolver, DetectionInfo, NoopSolver, ProtectionSystem, Verdict};
use fetch::{FetchRequest, FetchResponse, Fetcher, HttpMethod, ReqwestFetcher};

/// Per-call options for `crawl` and `crawl_batch`.
#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub method: HttpMethod,
    /// Extra headers merged over the profile's fingerprint headers.
    pub headers: Vec<(String, String)>,
    /// Action type driving the behavior-simulator delay.
    pub action: ActionType,
    /// Surface `RateLimitExceeded` instead of waiting for a slot.
    pub fail_fast_on_rate_limit: bool,
    pub force_new_profile: bool,
    /// Batch concurrency override (bounded by the global limit).
    pub concurrency: Option<usize>,
    /// Cooperative deadline for the whole batch.
    pub deadline: Option<Duration>,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            method: HttpMethod::Get,
            headers: Vec::new(),
            action: ActionType::Navigate,
            fail_fast_on_rate_limit: false,
            force_new_profile: false,
            concurrency: None,
            deadline: None,
        }
    }
}

/// Outcome of a single crawl. Immutable once returned.
#[derive(Debug, Clone)]
pub struct CrawlResult {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    /// Network time for the final attempt.
    pub duration: Duration,
    pub bytes: usize,
    pub attempts: u32,
    pub profile_id: Uuid,
    pub correlation_id: String,
    /// Present when a protection system was identified but the page was
    /// still usable.
    pub detection: Option<DetectionInfo>,
}

/// One entry of a batch result.
#[derive(Debug)]
pub struct BatchItem {
    pub url: String,
    pub correlation_id: String,
    pub outcome: Result<CrawlResult, CrawlError>,
}

/// Result of `crawl_batch`. A single item's failure never aborts its
/// siblings; every item is recorded here either way.
#[derive(Debug)]
pub struct BatchReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub items: Vec<BatchItem>,
}

/// Counters exposed by `get_metrics`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CrawlerMetrics {
    pub requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub detected: u64,
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
    pub detection_rate: f64,
}

#[derive(Debug, Default)]
struct MetricsInner {
    requests: u64,
    successful: u64,
    failed: u64,
    detected: u64,
    total_response_secs: f64,
}

/// Verdict of `handle_failure` for one failed attempt.
#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub wait: Duration,
    pub next_attempt: u32,
}

/// Outcome of a bypass orchestration.
#[derive(Debug)]
pub struct BypassOutcome {
    pub success: bool,
    pub strategy: Option<BypassStrategy>,
    pub detail: String,
}

/// The stealth crawling engine.
pub struct Crawler {
    fetcher: Arc<dyn Fetcher>,
    renderer: Arc<dyn Renderer>,
    solver: Arc<dyn ChallengeSolver>,
    profiles: Arc<ProfileManager>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    behavior: Mutex<BehaviorSimulator>,
    semaphore: Arc<Semaphore>,
    stealth: RwLock<StealthLevel>,
    metrics: Mutex<MetricsInner>,
    retry: RetryConfig,
    limits: RequestLimits,
    pool_config: PoolConfig,
    log: CrawlLog,
}

impl Crawler {
    /// Build a crawler with the production fetcher and in-memory profile
    /// persistence. Swap collaborators with the `with_*` builders.
    pub fn new(config: CrawlerConfig, log: CrawlLog) -> Self {
        let log = match &config.audit_log {
            Some(path) => match log.clone().with_sink(path) {
                Ok(with_sink) => with_sink,
                Err(e) => {
                    log.warning(
                        "failed to open audit sink, continuing without",
                        json!({ "error": e.to_string() }),
                    );
                    log
                }
            },
            None => log,
        };

        let store: Arc<dyn ProfileStore> = Arc::new(MemoryStore::new());
        let profiles = Arc::new(ProfileManager::new(
            store,
            config.pool.clone(),
            log.clone(),
        ));

        Self {
            fetcher: Arc::new(ReqwestFetcher::new(Duration::from_millis(
                config.limits.connect_timeout_ms,
            ))),
            renderer: Arc::new(NoopRenderer),
            solver: Arc::new(NoopSolver),
            profiles,
            limiter: RateLimiter::new(config.rate_limit.clone()),
            breaker: CircuitBreaker::new(config.breaker),
            behavior: Mutex::new(BehaviorSimulator::new(log.clone())),
            semaphore: Arc::new(Semaphore::new(config.limits.max_concurrent_requests.max(1))),
            stealth: RwLock::new(config.stealth),
            metrics: Mutex::new(MetricsInner::default()),
            retry: config.retry,
            limits: config.limits,
            pool_config: config.pool,
            log,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_solver(mut self, solver: Arc<dyn ChallengeSolver>) -> Self {
        self.solver = solver;
        self
    }

    /// Replace profile persistence; rebuilds the pool from the store.
    pub fn with_store(mut self, store: Arc<dyn ProfileStore>) -> Self {
        self.profiles = Arc::new(ProfileManager::new(
            store,
            self.pool_config.clone(),
            self.log.clone(),
        ));
        self
    }

    pub fn profiles(&self) -> &Arc<ProfileManager> {
        &self.profiles
    }

    /// Crawl a single URL through the full anti-detection pipeline.
    pub async fn crawl(&self, url: &str, options: &CrawlOptions) -> Result<CrawlResult, CrawlError> {
        let correlation_id = Uuid::new_v4().simple().to_string();
        self.crawl_with_correlation(url, options, &correlation_id).await
    }

    async fn crawl_with_correlation(
        &self,
        url: &str,
        options: &CrawlOptions,
        correlation_id: &str,
    ) -> Result<CrawlResult, CrawlError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| CrawlError::Cancelled)?;

        let log = self.log.fork(correlation_id).child("url", url);
        let domain = authority_of(url)?;
        let stealth = *self.stealth.read().expect("stealth lock poisoned");
        let mut force_new = options.force_new_profile || stealth.force_new_profile();

        let mut attempt: u32 = 1;
        loop {
            // Fail fast while the breaker is open: zero network attempts.
            if let Err(retry_after) = self.breaker.admit(&domain) {
                log.warning(
                    "circuit open, failing fast",
                    json!({ "domain": domain, "retry_after_ms": retry_after.as_millis() as u64 }),
                );
                return Err(CrawlError::CircuitOpen {
                    domain,
                    retry_after,
                });
            }

            // Rate gate: cooperative wait or immediate surfacing,
            // depending on caller mode.
            if options.fail_fast_on_rate_limit {
                if let Err(wait) = self.limiter.try_acquire(&domain) {
                    return Err(CrawlError::RateLimitExceeded { domain, wait });
                }
            } else {
                self.limiter.acquire(&domain).await;
            }

            let lease = self.profiles.get_profile(force_new)?;

            // Human-like pre-request delay, scaled by stealth level.
            let delay = {
                let mut behavior = self.behavior.lock().expect("behavior lock poisoned");
                behavior.get_inter_request_delay(options.action)
            }
            .mul_f64(stealth.delay_multiplier())
            .min(Duration::from_millis(self.limits.max_pre_request_delay_ms));
            log.debug(
                "pre-request delay",
                json!({ "delay_ms": delay.as_millis() as u64, "attempt": attempt }),
            );
            tokio::time::sleep(delay).await;

            let mut headers = lease.profile().fingerprint.headers();
            headers.extend(options.headers.iter().cloned());
            let request = FetchRequest {
                url: url.to_string(),
                method: options.method,
                headers,
                total_timeout: Duration::from_millis(self.limits.total_timeout_ms),
            };

            match self.fetcher.fetch(&request).await {
                Ok(response) => match detect::classify(&response) {
                    Verdict::Clean => {
                        return Ok(self.finish_success(
                            url,
                            response,
                            attempt,
                            &lease,
                            &domain,
                            options.action,
                            correlation_id,
                            &log,
                        ));
                    }
                    Verdict::Retryable(status) => {
                        self.finish_failure(&lease, &domain, options.action, -0.5);
                        let error = CrawlError::Status(status);
                        let decision = self.handle_failure(url, &error, attempt);
                        log.warning(
                            "retryable failure",
                            json!({
                                "status": status,
                                "attempt": attempt,
                                "will_retry": decision.should_retry,
                                "backoff_ms": decision.wait.as_millis() as u64,
                            }),
                        );
                        if !decision.should_retry {
                            return Err(error);
                        }
                        tokio::time::sleep(decision.wait).await;
                        attempt = decision.next_attempt;
                    }
                    Verdict::Detected(info) => {
                        self.finish_detection(&lease, &domain, options.action, &info, &log);
                        let error = CrawlError::Detection {
                            system: info.system.as_str().to_string(),
                            confidence: info.confidence,
                        };
                        if attempt >= self.retry.max_attempts {
                            return Err(error);
                        }
                        // Never the same identity again: next attempt runs
                        // under a fresh profile.
                        force_new = true;
                        attempt += 1;
                    }
                    Verdict::Rejected(status) => {
                        // Hard 4xx: burn the identity and surface without
                        // retrying.
                        self.finish_failure(&lease, &domain, options.action, -0.5);
                        let _ = self.profiles.rotate_fingerprint(lease.id());
                        log.warning(
                            "request rejected",
                            json!({ "status": status, "attempt": attempt }),
                        );
                        return Err(CrawlError::Status(status));
                    }
                },
                Err(error) => {
                    self.finish_failure(&lease, &domain, options.action, -0.5);
                    let decision = self.handle_failure(url, &error, attempt);
                    log.warning(
                        "transport failure",
                        json!({
                            "error": error.to_string(),
                            "attempt": attempt,
                            "will_retry": decision.should_retry,
                        }),
                    );
                    if !decision.should_retry {
                        return Err(error);
                    }
                    tokio::time::sleep(decision.wait).await;
                    attempt = decision.next_attempt;
                }
            }
        }
    }

    /// Crawl many URLs concurrently. Items run the full pipeline
    /// independently; one item's terminal failure never aborts siblings.
    pub async fn crawl_batch(&self, urls: &[String], options: &CrawlOptions) -> BatchReport {
        let concurrency = options
            .concurrency
            .unwrap_or(self.limits.max_concurrent_requests)
            .clamp(1, self.limits.max_concurrent_requests.max(1));
        let started = Instant::now();
        let deadline = options.deadline;

        self.log.info(
            "batch crawl started",
            json!({ "total_urls": urls.len(), "concurrency": concurrency }),
        );

        let items: Vec<BatchItem> = stream::iter(urls.iter().cloned())
            .map(|url| {
                let correlation_id = Uuid::new_v4().simple().to_string();
                async move {
                    let outcome = match deadline {
                        Some(limit) => {
                            let remaining = limit.saturating_sub(started.elapsed());
                            if remaining.is_zero() {
                                Err(CrawlError::Cancelled)
                            } else {
                                match tokio::time::timeout(
                                    remaining,
                                    self.crawl_with_correlation(&url, options, &correlation_id),
                                )
                                .await
                                {
                                    Ok(result) => result,
                                    Err(_) => Err(CrawlError::Cancelled),
                                }
                            }
                        }
                        None => {
                            self.crawl_with_correlation(&url, options, &correlation_id)
                                .await
                        }
                    };
                    BatchItem {
                        url,
                        correlation_id,
                        outcome,
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let successful = items.iter().filter(|i| i.outcome.is_ok()).count();
        let report = BatchReport {
            total: urls.len(),
            successful,
            failed: items.len() - successful,
            items,
        };

        self.log.info(
            "batch crawl finished",
            json!({
                "total": report.total,
                "successful": report.successful,
                "failed": report.failed,
                "elapsed_ms": started.elapsed().as_millis() as u64,
            }),
        );
        report
    }

    /// Extract structured fields from HTML using CSS selectors.
    pub fn extract(
        &self,
        html: &str,
        selectors: &[(String, String)],
    ) -> serde_json::Map<String, serde_json::Value> {
        extract::extract(html, selectors)
    }

    /// Probe a URL for bot protection without going through the full
    /// pipeline. HEAD first; falls back to GET when headers alone are
    /// inconclusive.
    pub async fn detect_bot_protection(&self, url: &str) -> DetectionInfo {
        let headers = self.profiles.generate_advanced_fingerprint().headers();
        let probe = |method: HttpMethod| FetchRequest {
            url: url.to_string(),
            method,
            headers: headers.clone(),
            total_timeout: Duration::from_millis(self.limits.total_timeout_ms),
        };

        let head = match self.fetcher.fetch(&probe(HttpMethod::Head)).await {
            Ok(response) => detect::identify_protection(&response.headers, &response.body),
            Err(_) => DetectionInfo {
                system: ProtectionSystem::Unknown,
                confidence: 0.0,
                bypass_strategy: None,
            },
        };
        if head.system != ProtectionSystem::None && head.system != ProtectionSystem::Unknown {
            return head;
        }

        match self.fetcher.fetch(&probe(HttpMethod::Get)).await {
            Ok(response) => detect::identify_protection(&response.headers, &response.body),
            Err(_) => head,
        }
    }

    /// Orchestrate a bypass for a detected protection system. Actual
    /// challenge solving is delegated to the attached solver or renderer.
    pub async fn bypass_protection(&self, url: &str, info: &DetectionInfo) -> BypassOutcome {
        let strategy = match info.bypass_strategy {
            Some(s) => s,
            None => {
                return BypassOutcome {
                    success: false,
                    strategy: None,
                    detail: "unknown system, no strategy".to_string(),
                }
            }
        };

        let outcome = match strategy {
            BypassStrategy::FingerprintRotation | BypassStrategy::AdvancedFingerprinting => {
                let options = CrawlOptions {
                    force_new_profile: true,
                    ..CrawlOptions::default()
                };
                match self.crawl(url, &options).await {
                    Ok(_) => (true, "succeeded under a fresh identity".to_string()),
                    Err(e) => (false, e.to_string()),
                }
            }
            BypassStrategy::SolverService => match self.solver.solve(url, info).await {
                Ok(solved) => {
                    let mut headers = solved.headers;
                    if !solved.cookies.is_empty() {
                        let cookie = solved
                            .cookies
                            .iter()
                            .map(|(k, v)| format!("{k}={v}"))
                            .collect::<Vec<_>>()
                            .join("; ");
                        headers.push(("Cookie".to_string(), cookie));
                    }
                    let options = CrawlOptions {
                        headers,
                        force_new_profile: true,
                        ..CrawlOptions::default()
                    };
                    match self.crawl(url, &options).await {
                        Ok(_) => (true, "solver tokens accepted".to_string()),
                        Err(e) => (false, format!("solver tokens rejected: {e}")),
                    }
                }
                Err(e) => (false, e.to_string()),
            },
            BypassStrategy::RenderChallenge => {
                match self.renderer.render(&RenderRequest::new(url)).await {
                    Ok(_) => (true, "challenge rendered".to_string()),
                    Err(e) => (false, e.to_string()),
                }
            }
        };

        self.log.security_event(
            "bypass_attempted",
            json!({
                "url": url,
                "system": info.system.as_str(),
                "strategy": format!("{strategy:?}"),
                "success": outcome.0,
            }),
        );

        BypassOutcome {
            success: outcome.0,
            strategy: Some(strategy),
            detail: outcome.1,
        }
    }

    /// Hand a JavaScript-heavy page to the external render service.
    pub async fn render_javascript(
        &self,
        request: &RenderRequest,
    ) -> Result<RenderedPage, CrawlError> {
        self.renderer.render(request).await
    }

    pub fn set_stealth_level(&self, level: StealthLevel) {
        *self.stealth.write().expect("stealth lock poisoned") = level;
        self.log
            .info("stealth level changed", json!({ "level": format!("{level:?}") }));
    }

    pub fn stealth_level(&self) -> StealthLevel {
        *self.stealth.read().expect("stealth lock poisoned")
    }

    /// Swap the rate-limiting algorithm or parameters at runtime.
    pub fn set_rate_limit_strategy(&self, strategy: &RateLimitStrategy) {
        self.limiter.set_strategy(strategy);
        self.log.info(
            "rate limit strategy updated",
            json!({
                "algorithm": strategy.algorithm.map(|a| format!("{a:?}")),
                "requests_per_second": strategy.requests_per_second,
                "burst_size": strategy.burst_size,
            }),
        );
    }

    /// Seconds until a request to `domain` would be admitted.
    pub fn get_recommended_wait_time(&self, domain: &str) -> f64 {
        self.limiter.recommended_wait(domain).as_secs_f64()
    }

    /// Decide whether a failed attempt should be retried, and after how
    /// long. Exponential backoff with jitter, capped by configuration.
    pub fn handle_failure(&self, url: &str, error: &CrawlError, attempt: u32) -> RetryDecision {
        if !error.is_retryable() || attempt >= self.retry.max_attempts {
            self.log.debug(
                "no retry",
                json!({ "url": url, "attempt": attempt, "error": error.to_string() }),
            );
            return RetryDecision {
                should_retry: false,
                wait: Duration::ZERO,
                next_attempt: attempt,
            };
        }

        let base = self
            .retry
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
            .min(self.retry.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0..=base / 4 + 1);
        RetryDecision {
            should_retry: true,
            wait: Duration::from_millis(base + jitter),
            next_attempt: attempt + 1,
        }
    }

    pub fn get_metrics(&self) -> CrawlerMetrics {
        let inner = self.metrics.lock().expect("metrics lock poisoned");
        let requests = inner.requests;
        CrawlerMetrics {
            requests,
            successful: inner.successful,
            failed: inner.failed,
            detected: inner.detected,
            avg_response_time_ms: if requests > 0 {
                inner.total_response_secs / requests as f64 * 1_000.0
            } else {
                0.0
            },
            success_rate: if requests > 0 {
                inner.successful as f64 / requests as f64 * 100.0
            } else {
                0.0
            },
            detection_rate: if requests > 0 {
                inner.detected as f64 / requests as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    /// Behavior session statistics (persona, fatigue, pages visited).
    pub fn session_stats(&self) -> SessionStats {
        self.behavior
            .lock()
            .expect("behavior lock poisoned")
            .get_session_stats()
    }

    /// Drop all pacing, breaker, metric, and behavior-session state.
    /// Profile history survives.
    pub fn reset(&self) {
        self.limiter.reset();
        self.breaker.reset();
        *self.metrics.lock().expect("metrics lock poisoned") = MetricsInner::default();
        self.behavior
            .lock()
            .expect("behavior lock poisoned")
            .reset_session();
        self.log.info("crawler state reset", json!({}));
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_success(
        &self,
        url: &str,
        response: FetchResponse,
        attempts: u32,
        lease: &ProfileLease,
        domain: &str,
        action: ActionType,
        correlation_id: &str,
        log: &CrawlLog,
    ) -> CrawlResult {
        self.breaker.record_success(domain);
        self.limiter.record_outcome(domain, true);
        lease.complete(true);
        {
            let mut behavior = self.behavior.lock().expect("behavior lock poisoned");
            behavior.learn_from_feedback(BehaviorFeedback {
                action,
                reward: 1.0,
            });
        }
        {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            metrics.requests += 1;
            metrics.successful += 1;
            metrics.total_response_secs += response.elapsed.as_secs_f64();
        }

        log.info(
            "crawl successful",
            json!({
                "status": response.status,
                "bytes": response.bytes,
                "duration_ms": response.elapsed.as_millis() as u64,
                "attempts": attempts,
            }),
        );
        log.performance("crawl", response.elapsed.as_millis() as u64);

        let detection = detect::identify_protection(&response.headers, &response.body);
        CrawlResult {
            url: url.to_string(),
            final_url: response.final_url,
            status: response.status,
            headers: response.headers,
            bytes: response.bytes,
            body: response.body,
            duration: response.elapsed,
            attempts,
            profile_id: lease.id(),
            correlation_id: correlation_id.to_string(),
            detection: (detection.system != ProtectionSystem::None).then_some(detection),
        }
    }

    fn finish_failure(&self, lease: &ProfileLease, domain: &str, action: ActionType, reward: f64) {
        self.breaker.record_failure(domain);
        self.limiter.record_outcome(domain, false);
        lease.complete(false);
        {
            let mut behavior = self.behavior.lock().expect("behavior lock poisoned");
            behavior.learn_from_feedback(BehaviorFeedback { action, reward });
        }
        let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
        metrics.requests += 1;
        metrics.failed += 1;
    }

    fn finish_detection(
        &self,
        lease: &ProfileLease,
        domain: &str,
        action: ActionType,
        info: &DetectionInfo,
        log: &CrawlLog,
    ) {
        self.breaker.record_failure(domain);
        self.limiter.record_outcome(domain, false);
        lease.complete(false);
        {
            let mut behavior = self.behavior.lock().expect("behavior lock poisoned");
            behavior.learn_from_feedback(BehaviorFeedback {
                action,
                reward: -1.0,
            });
        }
        {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            metrics.requests += 1;
            metrics.failed += 1;
            metrics.detected += 1;
        }

        log.security_event(
            "bot_protection_detected",
            json!({
                "domain": domain,
                "system": info.system.as_str(),
                "confidence": info.confidence,
                "profile_id": lease.id().to_string(),
            }),
        );

        // Repeated detections sink the EMA until the automatic ban fires;
        // a one-off gets its browser signals rotated instead.
        let burned = self
            .profiles
            .assess_detection_risk(lease.id())
            .map(|risk| risk.score >= 70)
            .unwrap_or(false);
        if burned {
            self.profiles.ban_profile(lease.id());
        } else {
            let _ = self.profiles.rotate_fingerprint(lease.id());
        }
    }
}

/// Rate-limit and breaker state are keyed by URL authority, so distinct
/// ports (local test servers) stay isolated.
fn authority_of(url: &str) -> Result<String, CrawlError> {
    let parsed = Url::parse(url).map_err(|e| CrawlError::InvalidUrl(format!("{url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| CrawlError::InvalidUrl(format!("{url}: no host")))?;
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted fetcher: pops one canned outcome per call and records when
    /// each URL actually hit the "network".
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<FetchResponse, CrawlError>>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<FetchResponse, CrawlError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn fetch_times(&self, url_prefix: &str) -> Vec<Instant> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter(|(url, _)| url.starts_with(url_prefix))
                .map(|(_, t)| *t)
                .collect()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, CrawlError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((request.url.clone(), Instant::now()));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ok_response(&request.url, 200, "<html>fallback</html>")))
        }
    }

    fn ok_response(url: &str, status: u16, body: &str) -> FetchResponse {
        FetchResponse {
            url: url.to_string(),
            final_url: url.to_string(),
            status,
            headers: vec![("content-type".to_string(), "text/html".to_string())],
            body: body.to_string(),
            elapsed: Duration::from_millis(25),
            bytes: body.len(),
        }
    }

    fn fast_config() -> CrawlerConfig {
        let mut config = CrawlerConfig::default();
        config.rate_limit.requests_per_second = 1_000.0;
        config.rate_limit.burst_size = 1_000;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        config.stealth = StealthLevel::Low;
        config.limits.max_pre_request_delay_ms = 10;
        config
    }

    fn crawler(fetcher: Arc<dyn Fetcher>) -> Crawler {
        Crawler::new(fast_config(), CrawlLog::with_correlation_id("test")).with_fetcher(fetcher)
    }

    #[tokio::test]
    async fn successful_crawl_reports_to_every_component() {
        let fetcher = ScriptedFetcher::new(vec![Ok(ok_response(
            "https://shop.example/p/1",
            200,
            "<html><h1>ok</h1></html>",
        ))]);
        let crawler = crawler(fetcher.clone());

        let result = crawler
            .crawl("https://shop.example/p/1", &CrawlOptions::default())
            .await
            .unwrap();

        assert_eq!(result.status, 200);
        assert_eq!(result.attempts, 1);
        assert!(result.detection.is_none());
        assert_eq!(fetcher.calls(), 1);

        let metrics = crawler.get_metrics();
        assert_eq!(metrics.requests, 1);
        assert_eq!(metrics.successful, 1);
        assert_eq!(metrics.success_rate, 100.0);
    }

    #[tokio::test]
    async fn retryable_status_retries_then_succeeds() {
        let url = "https://shop.example/p/2";
        let fetcher = ScriptedFetcher::new(vec![
            Ok(ok_response(url, 503, "")),
            Ok(ok_response(url, 200, "<html>recovered</html>")),
        ]);
        let crawler = crawler(fetcher.clone());

        let result = crawler.crawl(url, &CrawlOptions::default()).await.unwrap();
        assert_eq!(result.status, 200);
        assert_eq!(result.attempts, 2);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn hard_4xx_is_terminal_and_never_retried() {
        let url = "https://shop.example/gone";
        let fetcher = ScriptedFetcher::new(vec![Ok(ok_response(url, 404, "nope"))]);
        let crawler = crawler(fetcher.clone());

        let err = crawler.crawl(url, &CrawlOptions::default()).await.unwrap_err();
        assert!(matches!(err, CrawlError::Status(404)));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn detection_rotates_identity_before_any_retry() {
        let url = "https://guarded.example/";
        let challenge = FetchResponse {
            headers: vec![("cf-ray".to_string(), "deadbeef-SYD".to_string())],
            ..ok_response(url, 403, "<html>Checking your browser before accessing</html>")
        };
        let fetcher = ScriptedFetcher::new(vec![
            Ok(challenge),
            Ok(ok_response(url, 200, "<html>through</html>")),
        ]);
        let crawler = crawler(fetcher.clone());

        let first_profile;
        {
            // Warm the pool so the first crawl has an identity to burn.
            let lease = crawler.profiles().get_profile(false).unwrap();
            first_profile = lease.id();
            lease.complete(true);
        }

        let result = crawler.crawl(url, &CrawlOptions::default()).await.unwrap();
        assert_eq!(result.attempts, 2);
        // The retry ran under a different identity.
        assert_ne!(result.profile_id, first_profile);

        let metrics = crawler.get_metrics();
        assert_eq!(metrics.detected, 1);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_fails_fast() {
        let url = "https://down.example/";
        let mut script = Vec::new();
        for _ in 0..15 {
            script.push(Ok(ok_response(url, 500, "")));
        }
        let fetcher = ScriptedFetcher::new(script);

        let mut config = fast_config();
        config.retry.max_attempts = 1; // one attempt per crawl call
        config.breaker.failure_threshold = 5;
        config.breaker.timeout_secs = 60;
        let crawler = Crawler::new(config, CrawlLog::with_correlation_id("test"))
            .with_fetcher(fetcher.clone());

        for _ in 0..5 {
            let err = crawler.crawl(url, &CrawlOptions::default()).await.unwrap_err();
            assert!(matches!(err, CrawlError::Status(500)));
        }
        assert_eq!(fetcher.calls(), 5);

        // Sixth call short-circuits: no additional network attempt.
        let err = crawler.crawl(url, &CrawlOptions::default()).await.unwrap_err();
        assert!(matches!(err, CrawlError::CircuitOpen { .. }));
        assert_eq!(fetcher.calls(), 5);
    }

    #[tokio::test]
    async fn rate_limit_fail_fast_mode_surfaces_immediately() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let mut config = fast_config();
        config.rate_limit.requests_per_second = 0.5;
        config.rate_limit.burst_size = 1;
        let crawler = Crawler::new(config, CrawlLog::with_correlation_id("test"))
            .with_fetcher(fetcher.clone());

        let options = CrawlOptions {
            fail_fast_on_rate_limit: true,
            ..Default::default()
        };

        crawler.crawl("https://slow.example/a", &options).await.unwrap();
        let err = crawler
            .crawl("https://slow.example/b", &options)
            .await
            .unwrap_err();
        match err {
            CrawlError::RateLimitExceeded { domain, wait } => {
                assert_eq!(domain, "slow.example");
                assert!(wait > Duration::ZERO);
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
        // Only the first call reached the network.
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn batch_isolates_item_failures() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let crawler = crawler(fetcher);

        let urls = vec![
            "https://ok.example/1".to_string(),
            "not a url".to_string(),
            "https://ok.example/2".to_string(),
        ];
        let report = crawler.crawl_batch(&urls, &CrawlOptions::default()).await;

        assert_eq!(report.total, 3);
        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 1);

        let bad = report.items.iter().find(|i| i.url == "not a url").unwrap();
        assert!(matches!(bad.outcome, Err(CrawlError::InvalidUrl(_))));
        assert!(!bad.correlation_id.is_empty());
    }

    #[tokio::test]
    async fn batch_throttles_domains_under_independent_buckets() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let mut config = fast_config();
        // a.com gets a tight bucket; everything else stays generous.
        config.rate_limit.per_domain.insert(
            "a.com".to_string(),
            crate::config::DomainRate {
                requests_per_second: 2.0,
                burst_size: 1,
            },
        );
        let crawler = Crawler::new(config, CrawlLog::with_correlation_id("test"))
            .with_fetcher(fetcher.clone());

        let urls = vec![
            "https://a.com/1".to_string(),
            "https://a.com/2".to_string(),
            "https://b.com/1".to_string(),
        ];
        let options = CrawlOptions {
            concurrency: Some(2),
            ..Default::default()
        };
        let report = crawler.crawl_batch(&urls, &options).await;
        assert_eq!(report.successful, 3);

        let a_times = fetcher.fetch_times("https://a.com/");
        let b_times = fetcher.fetch_times("https://b.com/");
        assert_eq!(a_times.len(), 2);
        assert_eq!(b_times.len(), 1);

        // The two a.com items shared one bucket: the second waited for a
        // token refill.
        let a_first = *a_times.iter().min().unwrap();
        let a_second = *a_times.iter().max().unwrap();
        assert!(a_second.duration_since(a_first) >= Duration::from_millis(350));

        // b.com proceeded unaffected by a.com's bucket.
        assert!(b_times[0] < a_second - Duration::from_millis(200));
    }

    #[tokio::test]
    async fn batch_deadline_cancels_pending_items() {
        let url = "https://slow.example/";
        // Endless 503s keep each item retrying until the deadline hits.
        let fetcher = ScriptedFetcher::new(
            (0..100).map(|_| Ok(ok_response(url, 503, ""))).collect(),
        );
        let mut config = fast_config();
        config.retry.base_delay_ms = 5_000;
        config.retry.max_delay_ms = 10_000;
        let crawler = Crawler::new(config, CrawlLog::with_correlation_id("test"))
            .with_fetcher(fetcher);

        let options = CrawlOptions {
            deadline: Some(Duration::from_millis(1_500)),
            ..Default::default()
        };
        let report = crawler
            .crawl_batch(&[url.to_string(), url.to_string()], &options)
            .await;

        assert_eq!(report.total, 2);
        assert_eq!(report.successful, 0);
        for item in &report.items {
            assert!(matches!(
                item.outcome,
                Err(CrawlError::Cancelled) | Err(CrawlError::Status(_))
            ));
        }
    }

    #[tokio::test]
    async fn recommended_wait_time_reflects_bucket_state() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let mut config = fast_config();
        config.rate_limit.requests_per_second = 1.0;
        config.rate_limit.burst_size = 1;
        let crawler = Crawler::new(config, CrawlLog::with_correlation_id("test"))
            .with_fetcher(fetcher);

        assert_eq!(crawler.get_recommended_wait_time("fresh.example"), 0.0);

        let options = CrawlOptions {
            fail_fast_on_rate_limit: true,
            ..Default::default()
        };
        crawler.crawl("https://fresh.example/", &options).await.unwrap();
        let wait = crawler.get_recommended_wait_time("fresh.example");
        assert!(wait > 0.5 && wait <= 1.0, "wait was {wait}");
    }

    #[tokio::test]
    async fn reset_clears_state_but_keeps_profiles() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let crawler = crawler(fetcher);
        crawler
            .crawl("https://shop.example/", &CrawlOptions::default())
            .await
            .unwrap();
        assert_eq!(crawler.get_metrics().requests, 1);

        let profiles_before = crawler.profiles().stats().total;
        crawler.reset();

        assert_eq!(crawler.get_metrics().requests, 0);
        assert_eq!(crawler.profiles().stats().total, profiles_before);
    }

    #[tokio::test]
    async fn handle_failure_backs_off_exponentially() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let mut config = CrawlerConfig::default();
        config.retry.max_attempts = 4;
        config.retry.base_delay_ms = 1_000;
        config.retry.max_delay_ms = 30_000;
        let crawler = Crawler::new(config, CrawlLog::with_correlation_id("test"))
            .with_fetcher(fetcher);

        let error = CrawlError::Status(500);
        let first = crawler.handle_failure("https://x.example/", &error, 1);
        let second = crawler.handle_failure("https://x.example/", &error, 2);
        assert!(first.should_retry && second.should_retry);
        assert!(first.wait >= Duration::from_millis(1_000));
        assert!(second.wait >= Duration::from_millis(2_000));
        assert_eq!(second.next_attempt, 3);

        // Attempt cap.
        let last = crawler.handle_failure("https://x.example/", &error, 4);
        assert!(!last.should_retry);

        // Non-retryable taxonomy.
        let detection = CrawlError::Detection {
            system: "cloudflare".to_string(),
            confidence: 0.95,
        };
        assert!(!crawler.handle_failure("https://x.example/", &detection, 1).should_retry);
    }

    #[test]
    fn authority_keys_include_port() {
        assert_eq!(authority_of("https://example.com/p").unwrap(), "example.com");
        assert_eq!(
            authority_of("http://127.0.0.1:8081/p").unwrap(),
            "127.0.0.1:8081"
        );
        assert!(authority_of("nonsense").is_err());
    }
}
