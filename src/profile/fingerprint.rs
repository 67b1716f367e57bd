//! Fingerprint generation — jointly-plausible browser/device/network
//! signal bundles.
//!
//! Fields are drawn from paired device-class templates, never randomized
//! independently: a mobile user agent always comes with a mobile viewport,
//! touch support, and a mobile platform string. Rotation replaces only the
//! browser-level signals and keeps the device and network axes stable.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Broad device family a fingerprint presents as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Desktop,
    Mobile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebGlInfo {
    pub vendor: String,
    pub renderer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsProfile {
    pub version: String,
    pub cipher_suites: Vec<String>,
}

/// The composite signal set presented to a target site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fingerprint {
    pub user_agent: String,
    pub device_class: DeviceClass,
    pub platform: String,
    pub viewport: Viewport,
    pub timezone: String,
    pub locale: String,
    pub canvas_seed: String,
    pub canvas_noise: u8,
    pub webgl: WebGlInfo,
    pub audio_sample_rate: u32,
    pub hardware_concurrency: u8,
    pub device_memory_gb: u8,
    pub max_touch_points: u8,
    pub tls: TlsProfile,
    pub generated_at: DateTime<Utc>,
}

struct DeviceTemplate {
    class: DeviceClass,
    platform: &'static str,
    user_agents: &'static [&'static str],
    viewports: &'static [(u32, u32)],
    webgl: &'static [(&'static str, &'static str)],
    touch_points: &'static [u8],
    memory_gb: &'static [u8],
    concurrency: &'static [u8],
}

const WINDOWS: DeviceTemplate = DeviceTemplate {
    class: DeviceClass::Desktop,
    platform: "Win32",
    user_agents: &[
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    ],
    viewports: &[(1920, 1080), (1366, 768), (1536, 864), (2560, 1440)],
    webgl: &[
        ("Google Inc. (Intel)", "ANGLE (Intel, Intel(R) UHD Graphics 630, D3D11)"),
        ("Google Inc. (NVIDIA)", "ANGLE (NVIDIA, NVIDIA GeForce RTX 3060, D3D11)"),
    ],
    touch_points: &[0],
    memory_gb: &[8, 16, 32],
    concurrency: &[4, 8, 12, 16],
};

const MACOS: DeviceTemplate = DeviceTemplate {
    class: DeviceClass::Desktop,
    platform: "MacIntel",
    user_agents: &[
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    ],
    viewports: &[(1440, 900), (1680, 1050), (2560, 1600)],
    webgl: &[
        ("Google Inc. (Apple)", "ANGLE (Apple, Apple M2, OpenGL 4.1)"),
        ("Google Inc. (Apple)", "ANGLE (Apple, Apple M1 Pro, OpenGL 4.1)"),
    ],
    touch_points: &[0],
    memory_gb: &[8, 16, 32],
    concurrency: &[8, 10, 12],
};

const LINUX: DeviceTemplate = DeviceTemplate {
    class: DeviceClass::Desktop,
    platform: "Linux x86_64",
    user_agents: &[
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        "Mozilla/5.0 (X11; Linux x86_64; rv:133.0) Gecko/20100101 Firefox/133.0",
    ],
    viewports: &[(1920, 1080), (1366, 768), (2560, 1440)],
    webgl: &[
        ("Google Inc. (Intel)", "ANGLE (Intel, Mesa Intel(R) UHD Graphics 620, OpenGL 4.6)"),
    ],
    touch_points: &[0],
    memory_gb: &[8, 16],
    concurrency: &[4, 8, 16],
};

const ANDROID: DeviceTemplate = DeviceTemplate {
    class: DeviceClass::Mobile,
    platform: "Linux armv8l",
    user_agents: &[
        "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Mobile Safari/537.36",
        "Mozilla/5.0 (Linux; Android 13; SM-G991B) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Mobile Safari/537.36",
    ],
    viewports: &[(412, 915), (384, 854), (360, 800)],
    webgl: &[
        ("Qualcomm", "Adreno (TM) 740"),
        ("ARM", "Mali-G715-Immortalis MC11"),
    ],
    touch_points: &[5, 10],
    memory_gb: &[4, 8],
    concurrency: &[8],
};

const IPHONE: DeviceTemplate = DeviceTemplate {
    class: DeviceClass::Mobile,
    platform: "iPhone",
    user_agents: &[
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1",
    ],
    viewports: &[(390, 844), (393, 852), (430, 932)],
    webgl: &[("Apple Inc.", "Apple GPU")],
    touch_points: &[5],
    memory_gb: &[4, 8],
    concurrency: &[6],
};

const TEMPLATES: &[DeviceTemplate] = &[WINDOWS, MACOS, LINUX, ANDROID, IPHONE];

/// Timezone and locale are sampled as a pair so they stay consistent.
const LOCALE_PAIRS: &[(&str, &str)] = &[
    ("America/New_York", "en-US"),
    ("America/Chicago", "en-US"),
    ("America/Los_Angeles", "en-US"),
    ("Europe/London", "en-GB"),
    ("Pacific/Auckland", "en-NZ"),
    ("Australia/Sydney", "en-AU"),
];

const CIPHER_SUITES: &[&str] = &[
    "TLS_AES_128_GCM_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
];

impl Fingerprint {
    /// Generate a jointly-consistent bundle across browser, device,
    /// network, and behavioral axes.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let template = TEMPLATES.choose(rng).expect("template table is non-empty");
        Self::from_template(template, rng)
    }

    /// Replace only the browser-level signals (user agent revision, canvas
    /// noise, audio, TLS ordering). The device and network axes — and with
    /// them the owning profile's history — are preserved.
    pub fn rotate_browser_signals<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let template = TEMPLATES
            .iter()
            .find(|t| t.platform == self.platform)
            .unwrap_or(&WINDOWS);
        self.user_agent = (*template.user_agents.choose(rng).expect("user agents")).to_string();
        self.canvas_seed = random_seed(rng);
        self.canvas_noise = rng.gen_range(1..=5);
        self.audio_sample_rate = *[44_100u32, 48_000].choose(rng).expect("rates");
        self.tls = random_tls(rng);
        self.generated_at = Utc::now();
    }

    /// Check the joint-plausibility invariant: no desktop user agent with
    /// a mobile viewport, no touch-free mobile device, and so on.
    pub fn is_plausible(&self) -> bool {
        let ua_mobile = self.user_agent.contains("Mobile")
            || self.user_agent.contains("Android")
            || self.user_agent.contains("iPhone");
        match self.device_class {
            DeviceClass::Desktop => {
                !ua_mobile && self.viewport.width >= 1024 && self.max_touch_points == 0
            }
            DeviceClass::Mobile => {
                ua_mobile && self.viewport.width < 1024 && self.max_touch_points > 0
            }
        }
    }

    /// Materialize the request headers this fingerprint presents.
    pub fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("User-Agent".to_string(), self.user_agent.clone()),
            (
                "Accept".to_string(),
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8"
                    .to_string(),
            ),
            (
                "Accept-Language".to_string(),
                format!("{},en;q=0.5", self.locale),
            ),
            ("Accept-Encoding".to_string(), "gzip, deflate, br".to_string()),
            ("DNT".to_string(), "1".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            (
                "Upgrade-Insecure-Requests".to_string(),
                "1".to_string(),
            ),
        ]
    }

    fn from_template<R: Rng + ?Sized>(template: &DeviceTemplate, rng: &mut R) -> Self {
        let (width, height) = *template.viewports.choose(rng).expect("viewports");
        let (vendor, renderer) = *template.webgl.choose(rng).expect("webgl");
        let (timezone, locale) = *LOCALE_PAIRS.choose(rng).expect("locales");

        Self {
            user_agent: (*template.user_agents.choose(rng).expect("user agents")).to_string(),
            device_class: template.class,
            platform: template.platform.to_string(),
            viewport: Viewport { width, height },
            timezone: timezone.to_string(),
            locale: locale.to_string(),
            canvas_seed: random_seed(rng),
            canvas_noise: rng.gen_range(1..=5),
            webgl: WebGlInfo {
                vendor: vendor.to_string(),
                renderer: renderer.to_string(),
            },
            audio_sample_rate: *[44_100u32, 48_000].choose(rng).expect("rates"),
            hardware_concurrency: *template.concurrency.choose(rng).expect("concurrency"),
            device_memory_gb: *template.memory_gb.choose(rng).expect("memory"),
            max_touch_points: *template.touch_points.choose(rng).expect("touch"),
            tls: random_tls(rng),
            generated_at: Utc::now(),
        }
    }
}

fn random_seed<R: Rng + ?Sized>(rng: &mut R) -> String {
    let bytes: [u8; 8] = rng.gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn random_tls<R: Rng + ?Sized>(rng: &mut R) -> TlsProfile {
    let mut suites: Vec<String> = CIPHER_SUITES.iter().map(|s| s.to_string()).collect();
    suites.shuffle(rng);
    suites.truncate(rng.gen_range(3..=5));
    TlsProfile {
        version: "TLS 1.3".to_string(),
        cipher_suites: suites,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_fingerprints_are_jointly_plausible() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let fp = Fingerprint::generate(&mut rng);
            assert!(
                fp.is_plausible(),
                "implausible bundle: {} / {}x{} / touch {}",
                fp.user_agent,
                fp.viewport.width,
                fp.viewport.height,
                fp.max_touch_points
            );
        }
    }

    #[test]
    fn rotation_preserves_device_and_network_axes() {
        let mut rng = rand::thread_rng();
        let mut fp = Fingerprint::generate(&mut rng);
        let before = fp.clone();

        fp.rotate_browser_signals(&mut rng);

        assert_eq!(fp.device_class, before.device_class);
        assert_eq!(fp.platform, before.platform);
        assert_eq!(fp.viewport, before.viewport);
        assert_eq!(fp.timezone, before.timezone);
        assert_eq!(fp.locale, before.locale);
        assert_eq!(fp.max_touch_points, before.max_touch_points);
        assert!(fp.is_plausible());
    }

    #[test]
    fn rotation_refreshes_canvas_seed() {
        let mut rng = rand::thread_rng();
        let mut fp = Fingerprint::generate(&mut rng);
        let seed = fp.canvas_seed.clone();
        fp.rotate_browser_signals(&mut rng);
        assert_ne!(fp.canvas_seed, seed);
    }

    #[test]
    fn headers_reflect_the_fingerprint() {
        let mut rng = rand::thread_rng();
        let fp = Fingerprint::generate(&mut rng);
        let headers = fp.headers();
        let ua = headers.iter().find(|(k, _)| k == "User-Agent").unwrap();
        assert_eq!(ua.1, fp.user_agent);
        let lang = headers.iter().find(|(k, _)| k == "Accept-Language").unwrap();
        assert!(lang.1.starts_with(&fp.locale));
    }

    #[test]
    fn tls_suites_stay_within_known_set() {
        let mut rng = rand::thread_rng();
        let fp = Fingerprint::generate(&mut rng);
        assert!((3..=5).contains(&fp.tls.cipher_suites.len()));
        for suite in &fp.tls.cipher_suites {
            assert!(CIPHER_SUITES.contains(&suite.as_str()));
        }
    }
}
