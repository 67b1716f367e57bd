//! Proxy rotation planning.
//!
//! Only the plan lives here; acquiring actual endpoints is delegated to an
//! external provider which fills in credentials against the opaque
//! handles. Credentials are masked in every textual representation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// What the caller needs from a rotation plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyRequirements {
    /// Geographic regions to spread traffic across.
    pub regions: Vec<String>,
    /// Distinct ISP buckets per region.
    pub isp_variety: usize,
    /// How long one endpoint is used before rotating.
    pub rotation_interval_secs: u64,
    /// Total number of slots to plan.
    pub slots: usize,
}

/// Opaque reference to a provider-supplied endpoint. The credential is
/// write-only from this crate's perspective and never rendered.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProxyHandle {
    pub id: Uuid,
    pub region: String,
    pub isp_bucket: usize,
    credential: Option<String>,
}

impl ProxyHandle {
    pub fn new(region: &str, isp_bucket: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            region: region.to_string(),
            isp_bucket,
            credential: None,
        }
    }

    /// Attach a provider-issued credential.
    pub fn set_credential(&mut self, credential: String) {
        self.credential = Some(credential);
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("id", &self.id)
            .field("region", &self.region)
            .field("isp_bucket", &self.isp_bucket)
            .field("credential", &self.credential.as_ref().map(|_| "****"))
            .finish()
    }
}

impl fmt::Display for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy:{}@{}", self.id.simple(), self.region)
    }
}

/// One entry in the rotation plan.
#[derive(Debug, Clone)]
pub struct ProxySlot {
    pub handle: ProxyHandle,
    /// Offset from plan start at which this slot becomes active.
    pub starts_after: Duration,
}

/// A rotation plan across geography, ISP buckets, and time.
#[derive(Debug, Clone)]
pub struct ProxySchedule {
    pub slots: Vec<ProxySlot>,
    pub rotation_interval: Duration,
    pub regions: Vec<String>,
}

/// Build a rotation plan satisfying the requirements: regions round-robin,
/// ISP buckets cycle within each region, and slot boundaries carry jitter
/// so rotation does not happen on a metronome.
pub fn plan<R: Rng + ?Sized>(requirements: &ProxyRequirements, rng: &mut R) -> ProxySchedule {
    let interval = Duration::from_secs(requirements.rotation_interval_secs.max(1));
    let regions: Vec<String> = if requirements.regions.is_empty() {
        vec!["any".to_string()]
    } else {
        requirements.regions.clone()
    };
    let isp_variety = requirements.isp_variety.max(1);

    let mut slots = Vec::with_capacity(requirements.slots);
    for i in 0..requirements.slots {
        let region = &regions[i % regions.len()];
        let isp_bucket = (i / regions.len()) % isp_variety;
        let jitter = rng.gen_range(0.0..0.25);
        let starts_after = interval.mul_f64(i as f64 + jitter);
        slots.push(ProxySlot {
            handle: ProxyHandle::new(region, isp_bucket),
            starts_after,
        });
    }

    ProxySchedule {
        slots,
        rotation_interval: interval,
        regions,
    }
}
