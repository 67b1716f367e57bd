//! Response classification and bot-protection heuristics.
//!
//! Every response is sorted into success, retryable failure, or detection
//! event using status codes plus header and body signatures. Solving an
//! actual challenge is delegated through the `ChallengeSolver` boundary.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::crawler::fetch::FetchResponse;
use crate::error::CrawlError;

/// Known anti-automation systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionSystem {
    None,
    Cloudflare,
    RecaptchaV3,
    HCaptcha,
    PerimeterX,
    DataDome,
    Unknown,
}

impl ProtectionSystem {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtectionSystem::None => "none",
            ProtectionSystem::Cloudflare => "cloudflare",
            ProtectionSystem::RecaptchaV3 => "recaptcha_v3",
            ProtectionSystem::HCaptcha => "hcaptcha",
            ProtectionSystem::PerimeterX => "perimeterx",
            ProtectionSystem::DataDome => "datadome",
            ProtectionSystem::Unknown => "unknown",
        }
    }
}

/// Recommended counter-move for a detected system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassStrategy {
    FingerprintRotation,
    SolverService,
    AdvancedFingerprinting,
    RenderChallenge,
}

/// Identification result for a protection system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionInfo {
    pub system: ProtectionSystem,
    pub confidence: f64,
    pub bypass_strategy: Option<BypassStrategy>,
}

impl DetectionInfo {
    pub fn none() -> Self {
        Self {
            system: ProtectionSystem::None,
            confidence: 0.0,
            bypass_strategy: None,
        }
    }
}

/// Classification of a completed response.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Usable content.
    Clean,
    /// Transient server-side condition; retry with backoff.
    Retryable(u16),
    /// Bot protection fired — burn-the-profile territory.
    Detected(DetectionInfo),
    /// Hard client-side rejection (4xx other than 429).
    Rejected(u16),
}

fn challenge_body_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(checking your browser|just a moment|verify you are (a )?human|access denied|unusual traffic)")
            .expect("challenge regex compiles")
    })
}

/// Sort a response into the pipeline's three outcome classes.
pub fn classify(response: &FetchResponse) -> Verdict {
    let detection = identify_protection(&response.headers, &response.body);

    match response.status {
        status if status >= 500 => Verdict::Retryable(status),
        429 => Verdict::Retryable(429),
        401 | 403 => {
            if detection.system != ProtectionSystem::None {
                Verdict::Detected(detection)
            } else {
                Verdict::Rejected(response.status)
            }
        }
        status if (400..500).contains(&status) => Verdict::Rejected(status),
        _ => {
            // 2xx with a challenge interstitial is still a detection.
            if detection.system != ProtectionSystem::None && detection.confidence >= 0.9 {
                Verdict::Detected(detection)
            } else if challenge_body_re().is_match(&response.body)
                && response.body.len() < 20_000
            {
                Verdict::Detected(DetectionInfo {
                    system: ProtectionSystem::Unknown,
                    confidence: 0.6,
                    bypass_strategy: Some(BypassStrategy::FingerprintRotation),
                })
            } else {
                Verdict::Clean
            }
        }
    }
}

/// Identify which protection system produced a response, from header and
/// body signatures.
pub fn identify_protection(headers: &[(String, String)], body: &str) -> DetectionInfo {
    let has_header = |name: &str| {
        headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case(name))
    };

    if has_header("cf-ray") || has_header("cf-cache-status") || has_header("cf-mitigated") {
        // Presence of Cloudflare headers alone is weak; the challenge
        // interstitial makes it definite.
        let challenged = challenge_body_re().is_match(body) || body.contains("cf-chl");
        return DetectionInfo {
            system: ProtectionSystem::Cloudflare,
            confidence: if challenged { 0.95 } else { 0.5 },
            bypass_strategy: Some(if challenged {
                BypassStrategy::RenderChallenge
            } else {
                BypassStrategy::FingerprintRotation
            }),
        };
    }
    if has_header("x-px-uuid") || body.contains("_pxCaptcha") {
        return DetectionInfo {
            system: ProtectionSystem::PerimeterX,
            confidence: 0.95,
            bypass_strategy: Some(BypassStrategy::AdvancedFingerprinting),
        };
    }
    if has_header("x-datadome") || has_header("x-dd-b") || body.contains("datadome") {
        return DetectionInfo {
            system: ProtectionSystem::DataDome,
            confidence: 0.9,
            bypass_strategy: Some(BypassStrategy::AdvancedFingerprinting),
        };
    }
    if body.contains("hcaptcha") {
        return DetectionInfo {
            system: ProtectionSystem::HCaptcha,
            confidence: 0.9,
            bypass_strategy: Some(BypassStrategy::SolverService),
        };
    }
    if body.contains("recaptcha") || body.contains("grecaptcha") {
        return DetectionInfo {
            system: ProtectionSystem::RecaptchaV3,
            confidence: 0.9,
            bypass_strategy: Some(BypassStrategy::SolverService),
        };
    }

    DetectionInfo::none()
}

/// Tokens handed back by an external challenge solver.
#[derive(Debug, Clone, Default)]
pub struct SolvedChallenge {
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
}

/// External challenge/CAPTCHA solving boundary. This engine's job ends at
/// detection and orchestration.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    async fn solve(
        &self,
        url: &str,
        detection: &DetectionInfo,
    ) -> Result<SolvedChallenge, CrawlError>;
}

/// Stand-in used when no solver service is attached.
pub struct NoopSolver;

#[async_trait]
impl ChallengeSolver for NoopSolver {
    async fn solve(
        &self,
        url: &str,
        detection: &DetectionInfo,
    ) -> Result<SolvedChallenge, CrawlError> {
        Err(CrawlError::Detection {
            system: format!("{} (no solver attached for {url})", detection.system.as_str()),
            confidence: detection.confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn response(status: u16, headers: Vec<(&str, &str)>, body: &str) -> FetchResponse {
        FetchResponse {
            url: "https://example.com/".to_string(),
            final_url: "https://example.com/".to_string(),
            status,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.to_string(),
            elapsed: Duration::from_millis(10),
            bytes: body.len(),
        }
    }

    #[test]
    fn plain_success_is_clean() {
        let verdict = classify(&response(200, vec![], "<html><body>products</body></html>"));
        assert!(matches!(verdict, Verdict::Clean));
    }

    #[test]
    fn server_errors_and_429_are_retryable() {
        assert!(matches!(
            classify(&response(503, vec![], "")),
            Verdict::Retryable(503)
        ));
        assert!(matches!(
            classify(&response(429, vec![], "slow down")),
            Verdict::Retryable(429)
        ));
    }

    #[test]
    fn hard_4xx_is_rejected() {
        assert!(matches!(
            classify(&response(404, vec![], "not found")),
            Verdict::Rejected(404)
        ));
        assert!(matches!(
            classify(&response(403, vec![], "forbidden")),
            Verdict::Rejected(403)
        ));
    }

    #[test]
    fn cloudflare_challenge_is_detected() {
        let verdict = classify(&response(
            403,
            vec![("cf-ray", "8a1b2c3d4e5f6789-SYD")],
            "<html>Checking your browser before accessing</html>",
        ));
        match verdict {
            Verdict::Detected(info) => {
                assert_eq!(info.system, ProtectionSystem::Cloudflare);
                assert!(info.confidence >= 0.9);
                assert_eq!(info.bypass_strategy, Some(BypassStrategy::RenderChallenge));
            }
            other => panic!("expected detection, got {other:?}"),
        }
    }

    #[test]
    fn recaptcha_interstitial_on_200_is_detected() {
        let verdict = classify(&response(
            200,
            vec![],
            "<html><script src='https://www.google.com/recaptcha/api.js'></script></html>",
        ));
        assert!(matches!(verdict, Verdict::Detected(_)));
    }

    #[test]
    fn perimeterx_header_is_detected() {
        let info = identify_protection(
            &[("x-px-uuid".to_string(), "abc".to_string())],
            "",
        );
        assert_eq!(info.system, ProtectionSystem::PerimeterX);
        assert_eq!(
            info.bypass_strategy,
            Some(BypassStrategy::AdvancedFingerprinting)
        );
    }

    #[test]
    fn large_pages_mentioning_challenges_stay_clean() {
        // A long article that happens to discuss bot checks is content,
        // not an interstitial.
        let body = format!(
            "{}{}",
            "x".repeat(30_000),
            "this article explains how sites verify you are human"
        );
        assert!(matches!(classify(&response(200, vec![], &body)), Verdict::Clean));
    }

    #[tokio::test]
    async fn noop_solver_surfaces_detection() {
        let solver = NoopSolver;
        let err = solver
            .solve(
                "https://example.com",
                &DetectionInfo {
                    system: ProtectionSystem::Cloudflare,
                    confidence: 0.95,
                    bypass_strategy: Some(BypassStrategy::SolverService),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Detection { .. }));
    }
}
