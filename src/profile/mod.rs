//! Session and profile management — the pool of reusable crawling
//! identities.
//!
//! A `Profile` bundles a fingerprint with its historical success record.
//! Selection is success-rate-weighted but probabilistic, so traffic never
//! herds onto a single identity. A checked-out profile is exclusively held
//! by one task through a `ProfileLease` until the lease drops.

pub mod fingerprint;
pub mod proxy;
pub mod store;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::{DashMap, DashSet};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::CrawlLog;
use crate::config::PoolConfig;
use crate::error::CrawlError;
use fingerprint::{Fingerprint, TlsProfile, Viewport};
use proxy::{ProxyRequirements, ProxySchedule};
use store::ProfileStore;

/// A reusable crawling identity. Never deleted on failure — only banned,
/// or aged out by `cleanup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
    pub fingerprint: Fingerprint,
    pub usage_count: u32,
    /// Rolling success estimate in [0, 1], EMA-updated.
    pub success_rate: f64,
    pub banned: bool,
    pub last_used: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Concrete request configuration materialized from a profile.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub headers: Vec<(String, String)>,
    pub viewport: Viewport,
    pub timezone: String,
    pub locale: String,
    pub tls: TlsProfile,
}

/// Risk classification buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Outcome of `assess_detection_risk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: u8,
    pub level: RiskLevel,
    pub reasons: Vec<String>,
}

/// Aggregate pool statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub banned: usize,
    pub avg_success_rate: f64,
    pub avg_usage_count: f64,
}

/// Exclusive checkout of a profile. Dropping the lease releases the
/// identity; a lease dropped without `complete` marks the crawl
/// interrupted, which does not count as a failure.
pub struct ProfileLease {
    manager: Arc<ProfileManager>,
    profile: Profile,
    completed: AtomicBool,
}

impl std::fmt::Debug for ProfileLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileLease")
            .field("profile", &self.profile)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

impl ProfileLease {
    pub fn id(&self) -> Uuid {
        self.profile.id
    }

    /// Snapshot of the profile taken at checkout. Stable for the lifetime
    /// of the lease even if the pool record changes underneath.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Report the crawl outcome and release interest in the identity.
    pub fn complete(&self, success: bool) {
        if !self.completed.swap(true, Ordering::SeqCst) {
            self.manager.update_profile_success(self.profile.id, success);
        }
    }
}

impl Drop for ProfileLease {
    fn drop(&mut self) {
        self.manager.checked_out.remove(&self.profile.id);
        if !self.completed.load(Ordering::SeqCst) {
            self.manager.log.debug(
                "profile released as interrupted",
                json!({ "profile_id": self.profile.id.to_string() }),
            );
        }
    }
}

/// Owner of the profile and fingerprint tables.
pub struct ProfileManager {
    store: Arc<dyn ProfileStore>,
    pool: DashMap<Uuid, Profile>,
    checked_out: DashSet<Uuid>,
    config: PoolConfig,
    log: CrawlLog,
}

impl ProfileManager {
    /// Create a manager over the given store, loading any persisted pool.
    pub fn new(store: Arc<dyn ProfileStore>, config: PoolConfig, log: CrawlLog) -> Self {
        let pool = DashMap::new();
        match store.load_all() {
            Ok(profiles) => {
                for profile in profiles {
                    pool.insert(profile.id, profile);
                }
            }
            Err(e) => {
                log.warning(
                    "failed to load persisted profiles, starting empty",
                    json!({ "error": e.to_string() }),
                );
            }
        }
        Self {
            store,
            pool,
            checked_out: DashSet::new(),
            config,
            log,
        }
    }

    /// Check out an identity. Selection favors higher success rates
    /// probabilistically; a fresh profile is generated when the pool is
    /// empty, every candidate is risky, or `force_new` is set.
    pub fn get_profile(
        self: &Arc<Self>,
        force_new: bool,
    ) -> Result<ProfileLease, CrawlError> {
        let mut rng = rand::thread_rng();

        let selected = if force_new {
            None
        } else {
            self.select_weighted(&mut rng)
        };

        let profile = match selected {
            // A concurrent checkout can win the race between selection and
            // insert; fall through to a fresh identity when it does.
            Some(profile) if self.checked_out.insert(profile.id) => profile,
            _ => {
                let profile = self.create_profile(&mut rng)?;
                self.checked_out.insert(profile.id);
                profile
            }
        };

        let profile = self.touch(profile.id).unwrap_or(profile);

        self.log.debug(
            "profile selected",
            json!({
                "profile_id": profile.id.to_string(),
                "profile_name": profile.name,
                "usage_count": profile.usage_count,
                "success_rate": profile.success_rate,
            }),
        );

        Ok(ProfileLease {
            manager: Arc::clone(self),
            profile,
            completed: AtomicBool::new(false),
        })
    }

    /// Materialize the concrete request configuration for a profile.
    pub fn get_profile_config(&self, profile: &Profile) -> RequestConfig {
        RequestConfig {
            headers: profile.fingerprint.headers(),
            viewport: profile.fingerprint.viewport,
            timezone: profile.fingerprint.timezone.clone(),
            locale: profile.fingerprint.locale.clone(),
            tls: profile.fingerprint.tls.clone(),
        }
    }

    /// Fold an outcome into the rolling success estimate. EMA only — never
    /// a full-history recompute. Profiles sinking under the ban threshold
    /// after enough observations are banned automatically.
    pub fn update_profile_success(&self, id: Uuid, success: bool) {
        let mut should_ban = false;
        if let Some(mut entry) = self.pool.get_mut(&id) {
            let alpha = self.config.success_alpha;
            let outcome = if success { 1.0 } else { 0.0 };
            entry.success_rate = alpha * outcome + (1.0 - alpha) * entry.success_rate;
            should_ban = !entry.banned
                && entry.usage_count >= self.config.ban_min_observations
                && entry.success_rate < self.config.ban_threshold;
            let snapshot = entry.clone();
            drop(entry);
            self.persist(&snapshot);
        }
        if should_ban {
            self.ban_profile(id);
        }
    }

    /// Permanently exclude an identity from the pool. `get_profile` never
    /// returns a banned profile again, whatever `force_new` is.
    pub fn ban_profile(&self, id: Uuid) {
        if let Some(mut entry) = self.pool.get_mut(&id) {
            entry.banned = true;
            let snapshot = entry.clone();
            drop(entry);
            self.persist(&snapshot);
            self.log
                .security_event("profile_banned", json!({ "profile_id": id.to_string() }));
        }
    }

    /// Produce a fresh jointly-consistent fingerprint bundle.
    pub fn generate_advanced_fingerprint(&self) -> Fingerprint {
        Fingerprint::generate(&mut rand::thread_rng())
    }

    /// Replace only the browser-level signals of a profile, preserving its
    /// identity and history.
    pub fn rotate_fingerprint(&self, id: Uuid) -> Result<Fingerprint, CrawlError> {
        let mut entry = self
            .pool
            .get_mut(&id)
            .ok_or_else(|| CrawlError::Store(format!("unknown profile {id}")))?;
        entry
            .fingerprint
            .rotate_browser_signals(&mut rand::thread_rng());
        let snapshot = entry.clone();
        drop(entry);
        self.persist(&snapshot);
        self.log.info(
            "fingerprint rotated",
            json!({ "profile_id": id.to_string() }),
        );
        Ok(snapshot.fingerprint)
    }

    /// Score detection risk for a profile from failure rate, reuse
    /// breadth, and request velocity. `None` for unknown ids.
    pub fn assess_detection_risk(&self, id: Uuid) -> Option<RiskAssessment> {
        let profile = self.pool.get(&id)?.clone();
        let mut score: i32 = 0;
        let mut reasons = Vec::new();

        if profile.usage_count > 80 {
            score += 30;
            reasons.push(format!("heavy reuse: {} requests", profile.usage_count));
        } else if profile.usage_count > 50 {
            score += 15;
            reasons.push(format!("elevated reuse: {} requests", profile.usage_count));
        }

        if profile.success_rate < 0.7 {
            score += 40;
            reasons.push(format!("low success rate: {:.2}", profile.success_rate));
        } else if profile.success_rate < 0.85 {
            score += 20;
            reasons.push(format!("sinking success rate: {:.2}", profile.success_rate));
        }

        let age_hours = (Utc::now() - profile.created_at).num_minutes() as f64 / 60.0;
        let velocity = f64::from(profile.usage_count) / age_hours.max(1.0);
        if velocity > 30.0 {
            score += 15;
            reasons.push(format!("request velocity anomaly: {velocity:.1}/hour"));
        }

        let idle_hours = (Utc::now() - profile.last_used).num_minutes() as f64 / 60.0;
        if idle_hours < 1.0 {
            score -= 10;
        }

        let score = score.clamp(0, 100) as u8;
        let level = match score {
            71..=100 => RiskLevel::Critical,
            51..=70 => RiskLevel::High,
            31..=50 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        };

        Some(RiskAssessment {
            score,
            level,
            reasons,
        })
    }

    /// Purge profiles unused beyond the retention window, lowest-usage
    /// first. Checked-out profiles are never touched. Running it twice in
    /// a row removes nothing the second time.
    pub fn cleanup(&self, older_than_days: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::days(older_than_days);
        let mut candidates: Vec<Profile> = self
            .pool
            .iter()
            .filter(|e| e.last_used < cutoff && !self.checked_out.contains(&e.id))
            .map(|e| e.clone())
            .collect();
        candidates.sort_by(|a, b| {
            a.usage_count
                .cmp(&b.usage_count)
                .then(a.last_used.cmp(&b.last_used))
        });

        let mut removed = 0;
        for profile in candidates {
            self.pool.remove(&profile.id);
            if let Err(e) = self.store.remove(profile.id) {
                self.log.warning(
                    "failed to remove profile from store",
                    json!({ "profile_id": profile.id.to_string(), "error": e.to_string() }),
                );
            }
            removed += 1;
        }

        self.log
            .info("profile cleanup complete", json!({ "removed": removed }));
        removed
    }

    /// Plan proxy rotation; endpoint acquisition is the provider's job.
    pub fn create_proxy_schedule(&self, requirements: &ProxyRequirements) -> ProxySchedule {
        proxy::plan(requirements, &mut rand::thread_rng())
    }

    pub fn stats(&self) -> PoolStats {
        let total = self.pool.len();
        let banned = self.pool.iter().filter(|e| e.banned).count();
        let (sum_rate, sum_usage) = self.pool.iter().fold((0.0, 0.0), |(r, u), e| {
            (r + e.success_rate, u + f64::from(e.usage_count))
        });
        PoolStats {
            total,
            active: total - banned,
            banned,
            avg_success_rate: if total > 0 { sum_rate / total as f64 } else { 0.0 },
            avg_usage_count: if total > 0 { sum_usage / total as f64 } else { 0.0 },
        }
    }

    fn select_weighted<R: Rng>(&self, rng: &mut R) -> Option<Profile> {
        let candidates: Vec<Profile> = self
            .pool
            .iter()
            .filter(|e| {
                !e.banned
                    && !self.checked_out.contains(&e.id)
                    && e.usage_count < self.config.rotation_after
                    && e.success_rate >= self.config.ban_threshold
            })
            .map(|e| e.clone())
            .collect();

        if candidates.is_empty() {
            return None;
        }

        // Favor high success rates without starving the rest of the pool.
        let weights: Vec<f64> = candidates.iter().map(|p| 0.1 + p.success_rate).collect();
        let dist = WeightedIndex::new(&weights).ok()?;
        Some(candidates[dist.sample(rng)].clone())
    }

    fn create_profile<R: Rng>(&self, rng: &mut R) -> Result<Profile, CrawlError> {
        let active = self.pool.iter().filter(|e| !e.banned).count();
        if active >= self.config.max_profiles {
            return Err(CrawlError::ProfileExhausted);
        }

        let id = Uuid::new_v4();
        let profile = Profile {
            id,
            name: format!("profile_{}", id.simple()),
            fingerprint: Fingerprint::generate(rng),
            usage_count: 0,
            success_rate: 1.0,
            banned: false,
            last_used: Utc::now(),
            created_at: Utc::now(),
        };
        self.pool.insert(id, profile.clone());
        self.persist(&profile);
        self.log.info(
            "new profile created",
            json!({
                "profile_id": id.to_string(),
                "profile_name": profile.name,
                "device_class": format!("{:?}", profile.fingerprint.device_class),
            }),
        );
        Ok(profile)
    }

    fn touch(&self, id: Uuid) -> Option<Profile> {
        let mut entry = self.pool.get_mut(&id)?;
        entry.usage_count += 1;
        entry.last_used = Utc::now();
        let snapshot = entry.clone();
        drop(entry);
        self.persist(&snapshot);
        Some(snapshot)
    }

    fn persist(&self, profile: &Profile) {
        if let Err(e) = self.store.upsert(profile) {
            self.log.warning(
                "failed to persist profile",
                json!({ "profile_id": profile.id.to_string(), "error": e.to_string() }),
            );
        }
    }
}
