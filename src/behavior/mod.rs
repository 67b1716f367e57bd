//! Behavior simulator — human-plausible pacing for a crawl session.
//!
//! A session adopts a persona (reading speed, patience, endurance), builds
//! fatigue as pages accumulate, and recovers as wall time passes. All
//! timing is drawn from right-skewed distributions and nudged by online
//! feedback from crawl outcomes; nothing here is a trained model.

pub mod interaction;
pub mod sampling;

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::audit::CrawlLog;
use interaction::{KeyEvent, MousePoint, ScrollStep};

/// Lower bound on any inter-request delay — the human floor.
const MIN_DELAY_SECS: f64 = 0.2;
/// Upper bound on any inter-request delay.
const MAX_DELAY_SECS: f64 = 120.0;
/// Fatigue halves roughly every 30 minutes of wall time.
const FATIGUE_HALF_LIFE_SECS: f64 = 1_800.0;
/// Step size for feedback nudges to the delay bias.
const FEEDBACK_RATE: f64 = 0.15;

/// The kind of action a delay precedes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Click,
    Scroll,
    Navigate,
    Search,
    Compare,
    Checkout,
}

impl ActionType {
    /// Base delay range in seconds before this kind of action.
    fn delay_range(self) -> (f64, f64) {
        match self {
            ActionType::Click => (0.3, 1.2),
            ActionType::Scroll => (0.5, 2.0),
            ActionType::Navigate => (1.5, 4.5),
            ActionType::Search => (2.0, 8.0),
            ActionType::Compare => (3.0, 12.0),
            ActionType::Checkout => (5.0, 20.0),
        }
    }
}

/// Personality traits adopted for one session.
#[derive(Debug, Clone, Serialize)]
pub struct Persona {
    pub name: &'static str,
    /// Multiplier on reading and typing speed.
    pub reading_speed: f64,
    pub scroll_speed: f64,
    /// Multiplier on attention span and pause lengths.
    pub attention_span: f64,
    /// Probability of leaving after the first page.
    pub bounce_rate: f64,
    pub pages_per_session: (u32, u32),
}

/// Persona table with population weights: casual browsers dominate,
/// thorough researchers are rare.
pub(crate) static PERSONAS: &[(Persona, f64)] = &[
    (
        Persona {
            name: "casual_browser",
            reading_speed: 1.0,
            scroll_speed: 1.0,
            attention_span: 1.0,
            bounce_rate: 0.50,
            pages_per_session: (3, 8),
        },
        0.35,
    ),
    (
        Persona {
            name: "quick_scanner",
            reading_speed: 1.8,
            scroll_speed: 1.5,
            attention_span: 0.6,
            bounce_rate: 0.35,
            pages_per_session: (2, 5),
        },
        0.25,
    ),
    (
        Persona {
            name: "mobile_user",
            reading_speed: 0.85,
            scroll_speed: 1.3,
            attention_span: 0.5,
            bounce_rate: 0.55,
            pages_per_session: (2, 6),
        },
        0.20,
    ),
    (
        Persona {
            name: "price_hunter",
            reading_speed: 2.0,
            scroll_speed: 1.8,
            attention_span: 0.4,
            bounce_rate: 0.40,
            pages_per_session: (5, 12),
        },
        0.15,
    ),
    (
        Persona {
            name: "thorough_researcher",
            reading_speed: 0.7,
            scroll_speed: 0.6,
            attention_span: 2.0,
            bounce_rate: 0.15,
            pages_per_session: (8, 20),
        },
        0.05,
    ),
];

/// Average adult reading speed in words per minute.
const AVG_READING_SPEED_WPM: f64 = 238.0;
const MIN_ATTENTION_SPAN_SECS: f64 = 8.0;
const MAX_ATTENTION_SPAN_SECS: f64 = 45.0;

/// Content metrics driving the reading-time model.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageMetrics {
    pub word_count: u32,
    pub image_count: u32,
    /// 1 = trivial, 10 = dense.
    pub complexity: u8,
}

/// Context used for next-page relevance scoring.
#[derive(Debug, Clone, Default)]
pub struct PageContext {
    pub url: String,
    pub category: Option<String>,
    pub keywords: Vec<String>,
    pub price: Option<f64>,
    pub brand: Option<String>,
}

/// Outcome signal fed back into the delay model.
#[derive(Debug, Clone, Copy)]
pub struct BehaviorFeedback {
    pub action: ActionType,
    /// Positive on success, negative on failure or detection.
    pub reward: f64,
}

/// Session statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub persona: &'static str,
    pub pages_visited: u32,
    pub session_secs: f64,
    pub fatigue: f64,
    pub avg_secs_per_page: f64,
}

/// Session-scoped behavior state. Owns nothing beyond the session; a
/// `reset_session` discards it wholesale.
pub struct BehaviorSimulator {
    persona: Persona,
    session_start: Instant,
    pages_visited: u32,
    fatigue: f64,
    fatigue_updated: Instant,
    /// Per-action multiplier nudged by feedback, clamped to [0.5, 3.0].
    delay_bias: HashMap<ActionType, f64>,
    log: CrawlLog,
}

impl BehaviorSimulator {
    pub fn new(log: CrawlLog) -> Self {
        let persona = pick_persona(&mut rand::thread_rng());
        log.debug(
            "behavior persona selected",
            json!({ "persona": persona.name }),
        );
        Self {
            persona,
            session_start: Instant::now(),
            pages_visited: 0,
            fatigue: 0.0,
            fatigue_updated: Instant::now(),
            delay_bias: HashMap::new(),
            log,
        }
    }

    /// Seconds a human would plausibly spend reading this page. Scales
    /// with word and image count, content complexity, the persona's
    /// reading speed, and current fatigue, with log-normal jitter.
    /// Visiting a page adds fatigue.
    pub fn calculate_reading_time(&mut self, metrics: &PageMetrics) -> Duration {
        let mut rng = rand::thread_rng();

        let words = if metrics.word_count > 0 {
            f64::from(metrics.word_count)
        } else {
            rng.gen_range(185.0..815.0)
        };
        let images = if metrics.image_count > 0 {
            f64::from(metrics.image_count)
        } else {
            rng.gen_range(2.0..16.0)
        };
        let complexity = f64::from(metrics.complexity.clamp(1, 10));

        let wpm = AVG_READING_SPEED_WPM * rng.gen_range(0.85..1.15) * self.persona.reading_speed;
        let base = words / wpm * 60.0;

        // Fast scanners glance at images, careful readers dwell.
        let per_image = if self.persona.reading_speed > 1.5 {
            rng.gen_range(1.0..3.0)
        } else {
            rng.gen_range(2.5..7.0)
        };
        let image_time = images * per_image;

        let complexity_mult = 1.0 + complexity * rng.gen_range(0.08..0.15);
        let fatigue_mult = 1.0 + self.effective_fatigue() * 0.2;

        let mut total = (base + image_time) * complexity_mult * fatigue_mult;
        total *= sampling::log_normal(&mut rng, 0.0, 0.25);

        let min = MIN_ATTENTION_SPAN_SECS * self.persona.attention_span * rng.gen_range(0.7..1.3);
        let max = MAX_ATTENTION_SPAN_SECS * self.persona.attention_span * rng.gen_range(0.8..1.2);
        total = total.clamp(min, max.max(min + 0.1));

        self.update_fatigue(0.1);

        Duration::from_secs_f64(total)
    }

    /// Delay before the next action, drawn from a Gamma distribution
    /// parameterized per action type and nudged by recent feedback.
    ///
    /// Always within [0.2s, 120s]; never deterministic.
    pub fn get_inter_request_delay(&mut self, action: ActionType) -> Duration {
        let mut rng = rand::thread_rng();
        let (lo, hi) = action.delay_range();

        // Gamma(2, 1) has mean 2; scaled to sit inside the action range
        // with a right tail beyond it.
        let skew = sampling::gamma(&mut rng, 2.0, 1.0) / 2.0;
        let mut delay = lo + skew * (hi - lo);

        delay *= 1.0 + self.effective_fatigue() * 0.3;
        delay /= self.persona.reading_speed;
        delay *= self.delay_bias.get(&action).copied().unwrap_or(1.0);

        // Occasional distraction spike.
        if rng.gen::<f64>() < 0.05 {
            delay *= rng.gen_range(2.0..3.0);
        }
        // Occasional impatience drop.
        if rng.gen::<f64>() < 0.10 {
            delay *= rng.gen_range(0.4..0.6);
        }

        Duration::from_secs_f64(delay.clamp(MIN_DELAY_SECS, MAX_DELAY_SECS))
    }

    /// Ordered scroll pattern for a page of the given height.
    pub fn generate_scroll_pattern(&mut self, page_height: u32) -> Vec<ScrollStep> {
        interaction::scroll_pattern(
            &mut rand::thread_rng(),
            &self.persona,
            page_height,
            self.effective_fatigue(),
        )
    }

    /// Curved pointer path between two points.
    pub fn generate_mouse_movement(
        &mut self,
        start: (f64, f64),
        target: (f64, f64),
    ) -> Vec<MousePoint> {
        interaction::mouse_path(
            &mut rand::thread_rng(),
            start,
            target,
            self.persona.reading_speed,
        )
    }

    /// Keystroke timing trace for the given text.
    pub fn generate_typing_pattern(&mut self, text: &str) -> Vec<KeyEvent> {
        interaction::typing_pattern(
            &mut rand::thread_rng(),
            text,
            self.persona.reading_speed,
            self.effective_fatigue(),
        )
    }

    /// Gate on accumulated fatigue versus the persona's endurance, with
    /// stochastic noise. Counts the page visit.
    pub fn should_continue_browsing(&mut self) -> bool {
        let mut rng = rand::thread_rng();
        self.pages_visited += 1;

        let (lo, hi) = self.persona.pages_per_session;
        let target = f64::from(rng.gen_range(lo..=hi));

        let mut chance = if self.pages_visited == 1 {
            1.0 - self.persona.bounce_rate
        } else {
            (1.0 - f64::from(self.pages_visited) / target).max(0.0)
        };
        chance -= self.effective_fatigue() * 0.2;
        chance += rng.gen_range(-0.05..0.05);

        let decision = rng.gen::<f64>() < chance;
        self.log.debug(
            "session continuation evaluated",
            json!({
                "pages_visited": self.pages_visited,
                "chance": (chance * 100.0).round() / 100.0,
                "decision": if decision { "continue" } else { "exit" },
            }),
        );
        decision
    }

    /// Choose the next page by blending relevance with weighted random
    /// exploration. Roughly one in five choices "presses back" and returns
    /// the current page.
    pub fn get_next_page(
        &mut self,
        current: &PageContext,
        available: &[PageContext],
    ) -> Option<PageContext> {
        let mut rng = rand::thread_rng();
        if available.is_empty() {
            return None;
        }
        if self.pages_visited > 1 && rng.gen::<f64>() < 0.20 {
            return Some(current.clone());
        }

        let mut scored: Vec<(f64, &PageContext)> = available
            .iter()
            .map(|page| {
                let mut score = 0.0;
                if page.category.is_some() && page.category == current.category {
                    score += 50.0;
                }
                let overlap = page
                    .keywords
                    .iter()
                    .filter(|k| current.keywords.contains(k))
                    .count();
                score += (overlap as f64 * 5.0).min(25.0);
                if let (Some(a), Some(b)) = (page.price, current.price) {
                    score += (30.0 - (a - b).abs()).max(0.0);
                }
                if page.brand.is_some() && page.brand == current.brand {
                    score += 25.0;
                }
                score += rng.gen_range(0.0..20.0);
                (score, page)
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let top = &scored[..scored.len().min(5)];
        top.choose_weighted(&mut rng, |(score, _)| score.max(1.0))
            .ok()
            .map(|(_, page)| (*page).clone())
    }

    /// Add fatigue; the increment is clamped to [0, 1] and the level decays
    /// with elapsed wall time.
    pub fn update_fatigue(&mut self, increment: f64) {
        let decayed = self.effective_fatigue();
        self.fatigue = (decayed + increment.clamp(0.0, 1.0)).min(1.0);
        self.fatigue_updated = Instant::now();
    }

    /// Incrementally adjust the delay model from observed outcomes:
    /// success lets the bias relax toward faster pacing, failure or
    /// detection pushes it up. Bandit-style nudging only.
    pub fn learn_from_feedback(&mut self, feedback: BehaviorFeedback) {
        let bias = self.delay_bias.entry(feedback.action).or_insert(1.0);
        *bias = (*bias * (1.0 - FEEDBACK_RATE * feedback.reward)).clamp(0.5, 3.0);
        self.log.debug(
            "behavior feedback applied",
            json!({
                "action": format!("{:?}", feedback.action),
                "reward": feedback.reward,
                "bias": (*bias * 1000.0).round() / 1000.0,
            }),
        );
    }

    pub fn get_current_profile(&self) -> &Persona {
        &self.persona
    }

    pub fn get_session_stats(&self) -> SessionStats {
        let elapsed = self.session_start.elapsed().as_secs_f64();
        SessionStats {
            persona: self.persona.name,
            pages_visited: self.pages_visited,
            session_secs: elapsed,
            fatigue: self.effective_fatigue(),
            avg_secs_per_page: if self.pages_visited > 0 {
                elapsed / f64::from(self.pages_visited)
            } else {
                0.0
            },
        }
    }

    /// Discard all session-scoped state and adopt a fresh persona.
    /// Profile history elsewhere is untouched.
    pub fn reset_session(&mut self) {
        self.persona = pick_persona(&mut rand::thread_rng());
        self.session_start = Instant::now();
        self.pages_visited = 0;
        self.fatigue = 0.0;
        self.fatigue_updated = Instant::now();
        self.delay_bias.clear();
        self.log.info(
            "behavior session reset",
            json!({ "persona": self.persona.name }),
        );
    }

    fn effective_fatigue(&self) -> f64 {
        let elapsed = self.fatigue_updated.elapsed().as_secs_f64();
        self.fatigue * 0.5f64.powf(elapsed / FATIGUE_HALF_LIFE_SECS)
    }
}

fn pick_persona<R: Rng>(rng: &mut R) -> Persona {
    let weights: Vec<f64> = PERSONAS.iter().map(|(_, w)| *w).collect();
    let dist = WeightedIndex::new(&weights).expect("persona weights are valid");
    PERSONAS[dist.sample(rng)].0.clone()
}
