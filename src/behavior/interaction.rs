//! Interaction pattern synthesis — scrolling, pointer paths, keystrokes.
//!
//! Everything here is stochastic by construction: repeated calls with the
//! same inputs must never produce the same trace.

use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;

use super::Persona;

/// One scroll action in a generated pattern.
#[derive(Debug, Clone)]
pub struct ScrollStep {
    /// Absolute position after this scroll, in pixels.
    pub position: u32,
    /// Distance covered by this scroll.
    pub distance: u32,
    /// Reading pause after the scroll settles.
    pub pause: Duration,
    /// Pixels per second during the scroll.
    pub velocity: f64,
}

/// Generate an ordered scroll pattern down a page. Velocity falls off as
/// the scroll position nears the bottom, the way a reader slows into a
/// shrinking target.
pub fn scroll_pattern<R: Rng + ?Sized>(
    rng: &mut R,
    persona: &Persona,
    page_height: u32,
    fatigue: f64,
) -> Vec<ScrollStep> {
    let mut steps = Vec::new();
    let mut position: u32 = 0;
    let page_height = page_height.max(200);

    while position < page_height {
        let roll: f64 = rng.gen_range(0.0..100.0);
        let distance = if roll < rng.gen_range(8.0..13.0) {
            rng.gen_range(40..200)
        } else if roll < rng.gen_range(55.0..65.0) {
            rng.gen_range(180..660)
        } else if roll < rng.gen_range(80.0..88.0) {
            rng.gen_range(640..1_220)
        } else {
            rng.gen_range(1_200..2_500)
        };
        let distance = ((f64::from(distance) * persona.scroll_speed) as u32).max(30);
        position = (position + distance).min(page_height);

        let mut pause = rng.gen_range(0.3..5.5);
        let interest: f64 = rng.gen_range(0.0..100.0);
        pause *= if interest < 15.0 {
            rng.gen_range(3.0..8.0)
        } else if interest < 30.0 {
            rng.gen_range(1.5..3.0)
        } else if interest < 85.0 {
            rng.gen_range(0.8..1.5)
        } else {
            rng.gen_range(0.2..0.5)
        };
        pause *= persona.attention_span * rng.gen_range(0.7..1.4);
        pause *= 1.0 + fatigue * 0.3;

        // Approach profile: fast across the middle of the page, slowing as
        // the remaining distance shrinks.
        let remaining = f64::from(page_height - position) / f64::from(page_height);
        let approach = 0.3 + 0.7 * remaining;
        let velocity =
            f64::from(distance) / rng.gen_range(0.15..1.2) * approach * persona.scroll_speed;

        steps.push(ScrollStep {
            position,
            distance,
            pause: Duration::from_secs_f64(pause),
            velocity,
        });
    }

    steps
}

/// A timestamped pointer position.
#[derive(Debug, Clone)]
pub struct MousePoint {
    pub x: f64,
    pub y: f64,
    pub t: Duration,
}

/// Generate a curved pointer path from `start` to `target` with a slight
/// overshoot-and-correct near the target and a bell-shaped speed profile.
///
/// Movement time follows Fitts's law: T = a + b * log2(D/W + 1).
pub fn mouse_path<R: Rng + ?Sized>(
    rng: &mut R,
    start: (f64, f64),
    target: (f64, f64),
    speed: f64,
) -> Vec<MousePoint> {
    let dx = target.0 - start.0;
    let dy = target.1 - start.1;
    let distance = (dx * dx + dy * dy).sqrt();

    let (a, b, width) = (0.1, 0.15, 50.0);
    let total = (a + b * (distance / width + 1.0).log2()) / speed.max(0.1);

    let points = ((distance / 90.0) as usize).clamp(6, 60);
    let curve = rng.gen_range(-0.15..0.15) * distance;
    let overshoot = rng.gen_range(5.0..20.0);

    let mut path = Vec::with_capacity(points + 2);
    for i in 0..=points {
        let raw = i as f64 / points as f64;
        // Smoothstep easing gives the bell-shaped speed profile: slow
        // start, fast middle, slow settle.
        let eased = raw * raw * (3.0 - 2.0 * raw);

        // Perpendicular bow plus a late overshoot past the target.
        let bow = (raw * std::f64::consts::PI).sin() * curve / distance.max(1.0);
        let over = if raw > 0.8 {
            ((raw - 0.8) / 0.2 * std::f64::consts::PI).sin() * overshoot
        } else {
            0.0
        };

        let ux = dx / distance.max(1.0);
        let uy = dy / distance.max(1.0);
        path.push(MousePoint {
            x: start.0 + dx * eased - uy * bow * distance + ux * over,
            y: start.1 + dy * eased + ux * bow * distance + uy * over,
            t: Duration::from_secs_f64(total * raw),
        });
    }

    // Correction lands exactly on target.
    path.push(MousePoint {
        x: target.0,
        y: target.1,
        t: Duration::from_secs_f64(total * rng.gen_range(1.05..1.15)),
    });

    path
}

/// A key press in a generated typing pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Backspace,
}

#[derive(Debug, Clone)]
pub struct KeyEvent {
    pub key: Key,
    /// Delay before this key is pressed.
    pub delay: Duration,
    /// True for keys erased by the correction burst that follows them.
    pub typo: bool,
}

/// Generate per-character typing timings with occasional typo-and-correct
/// insertions. Skill level is drawn per call from a population-shaped
/// distribution (roughly 23–120 WPM). Sometimes a typo goes unnoticed for
/// a key or two, so the correction arrives as a multi-backspace burst.
pub fn typing_pattern<R: Rng + ?Sized>(
    rng: &mut R,
    text: &str,
    speed: f64,
    fatigue: f64,
) -> Vec<KeyEvent> {
    let skill: f64 = rng.gen_range(0.0..100.0);
    let (wpm, error_rate) = if skill < 20.0 {
        (rng.gen_range(23.0..35.0), rng.gen_range(0.04..0.08))
    } else if skill < 80.0 {
        (rng.gen_range(36.0..60.0), rng.gen_range(0.015..0.04))
    } else if skill < 95.0 {
        (rng.gen_range(61.0..80.0), rng.gen_range(0.02..0.05))
    } else {
        (rng.gen_range(81.0..120.0), rng.gen_range(0.005..0.015))
    };

    let wpm = wpm * speed / (1.0 + fatigue * 0.15);
    let chars_per_sec = (wpm * 5.0 / 60.0).max(0.5);

    let chars: Vec<char> = text.chars().collect();
    let mut events = Vec::with_capacity(chars.len() + 8);
    let mut prev: Option<char> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let mut delay = 1.0 / chars_per_sec * rng.gen_range(0.6..1.4);

        if c == ' ' {
            delay *= rng.gen_range(1.5..4.5);
        } else if c.is_uppercase() {
            delay *= rng.gen_range(1.2..2.0);
        } else if c.is_ascii_digit() {
            delay *= rng.gen_range(1.4..2.2);
        } else if !c.is_alphanumeric() {
            delay *= rng.gen_range(1.3..2.8);
        }
        if prev.is_none() || prev == Some('.') {
            // Thinking pause at a sentence start.
            delay *= rng.gen_range(2.0..5.0);
        }
        if rng.gen::<f64>() < 0.05 {
            // Burst typing: muscle memory kicks in.
            delay *= rng.gen_range(0.3..0.5);
        }
        if rng.gen::<f64>() < 0.03 {
            // Mid-typing distraction.
            delay *= rng.gen_range(3.0..8.0);
        }

        if rng.gen::<f64>() < error_rate {
            events.push(KeyEvent {
                key: Key::Char(nearby_key(rng, c)),
                delay: Duration::from_secs_f64(delay),
                typo: true,
            });

            // A few more keys may land before the mistake registers.
            let unnoticed = if rng.gen::<f64>() < 0.3 {
                rng.gen_range(1..=2).min(chars.len() - i - 1)
            } else {
                0
            };
            for follow in &chars[i + 1..i + 1 + unnoticed] {
                events.push(KeyEvent {
                    key: Key::Char(*follow),
                    delay: Duration::from_secs_f64(
                        1.0 / chars_per_sec * rng.gen_range(0.6..1.4),
                    ),
                    typo: true,
                });
            }

            // Noticing takes a beat; the backspaces after it are rapid.
            let mut pause = delay * rng.gen_range(0.3..2.0);
            for _ in 0..=unnoticed {
                events.push(KeyEvent {
                    key: Key::Backspace,
                    delay: Duration::from_secs_f64(pause),
                    typo: false,
                });
                pause = 1.0 / chars_per_sec * rng.gen_range(0.4..0.9);
            }
            // Retyping resumes from the mistyped character.
        }

        events.push(KeyEvent {
            key: Key::Char(c),
            delay: Duration::from_secs_f64(delay),
            typo: false,
        });
        prev = Some(c);
        i += 1;
    }

    events
}

/// QWERTY adjacency for plausible fat-finger typos.
fn nearby_key<R: Rng + ?Sized>(rng: &mut R, c: char) -> char {
    const ROWS: [&str; 3] = ["qwertyuiop", "asdfghjkl", "zxcvbnm"];

    let lower = c.to_ascii_lowercase();
    for (r, row) in ROWS.iter().enumerate() {
        if let Some(i) = row.find(lower) {
            let mut neighbors: Vec<char> = Vec::new();
            let row_bytes = row.as_bytes();
            if i > 0 {
                neighbors.push(row_bytes[i - 1] as char);
            }
            if i + 1 < row_bytes.len() {
                neighbors.push(row_bytes[i + 1] as char);
            }
            if r + 1 < ROWS.len() {
                if let Some(&below) = ROWS[r + 1].as_bytes().get(i.min(ROWS[r + 1].len() - 1)) {
                    neighbors.push(below as char);
                }
            }
            if let Some(&picked) = neighbors.choose(rng) {
                return if c.is_uppercase() {
                    picked.to_ascii_uppercase()
                } else {
                    picked
                };
            }
        }
    }
    c
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::PERSONAS;

    fn persona() -> Persona {
        PERSONAS[0].0.clone()
    }

    #[test]
    fn scroll_reaches_page_bottom_monotonically() {
        let mut rng = rand::thread_rng();
        let steps = scroll_pattern(&mut rng, &persona(), 5_000, 0.0);
        assert!(steps.len() >= 2);
        let mut last = 0;
        for step in &steps {
            assert!(step.position > last);
            assert!(step.velocity > 0.0);
            last = step.position;
        }
        assert_eq!(last, 5_000);
    }

    #[test]
    fn scroll_velocity_falls_toward_the_target() {
        let mut rng = rand::thread_rng();
        // Average over runs; a single pattern is too noisy.
        let mut first_sum = 0.0;
        let mut last_sum = 0.0;
        for _ in 0..50 {
            let steps = scroll_pattern(&mut rng, &persona(), 20_000, 0.0);
            first_sum += steps.first().unwrap().velocity / steps.first().unwrap().distance as f64;
            last_sum += steps.last().unwrap().velocity / steps.last().unwrap().distance as f64;
        }
        assert!(last_sum < first_sum);
    }

    #[test]
    fn mouse_path_starts_and_ends_correctly() {
        let mut rng = rand::thread_rng();
        let path = mouse_path(&mut rng, (10.0, 10.0), (800.0, 400.0), 1.0);
        let first = path.first().unwrap();
        let last = path.last().unwrap();

        assert!((first.x - 10.0).abs() < 1.0 && (first.y - 10.0).abs() < 1.0);
        assert_eq!((last.x, last.y), (800.0, 400.0));

        // Timestamps are non-decreasing.
        for pair in path.windows(2) {
            assert!(pair[0].t <= pair[1].t);
        }
    }

    #[test]
    fn mouse_path_is_not_a_straight_line() {
        let mut rng = rand::thread_rng();
        let mut bowed = false;
        for _ in 0..10 {
            let path = mouse_path(&mut rng, (0.0, 0.0), (1000.0, 0.0), 1.0);
            // On a straight run along x, any perpendicular displacement
            // proves curvature.
            if path.iter().any(|p| p.y.abs() > 2.0) {
                bowed = true;
                break;
            }
        }
        assert!(bowed);
    }

    fn replay(events: &[KeyEvent]) -> String {
        let mut out = String::new();
        for event in events {
            match event.key {
                Key::Char(c) => out.push(c),
                Key::Backspace => {
                    out.pop();
                }
            }
        }
        out
    }

    #[test]
    fn typing_replays_to_the_exact_text() {
        let mut rng = rand::thread_rng();
        let text = "hello world";
        for _ in 0..20 {
            let events = typing_pattern(&mut rng, text, 1.0, 0.0);
            assert_eq!(replay(&events), text);
            for event in &events {
                assert!(event.delay > Duration::ZERO);
            }
        }
    }

    #[test]
    fn every_typo_is_erased_by_a_backspace() {
        let mut rng = rand::thread_rng();
        // Long text so some typos almost surely appear.
        let text = "the quick brown fox jumps over the lazy dog ".repeat(20);
        let events = typing_pattern(&mut rng, &text, 1.0, 0.0);

        let typos = events.iter().filter(|e| e.typo).count();
        let backspaces = events
            .iter()
            .filter(|e| e.key == Key::Backspace)
            .count();
        assert_eq!(typos, backspaces);
        assert_eq!(replay(&events), text);
    }

    #[test]
    fn correction_bursts_backspace_more_than_once() {
        let mut rng = rand::thread_rng();
        let text = "the quick brown fox jumps over the lazy dog ".repeat(20);

        // A burst is two consecutive backspaces. Each run has a decent
        // chance of producing one; thirty runs make a miss negligible.
        for _ in 0..30 {
            let events = typing_pattern(&mut rng, &text, 1.0, 0.0);
            let burst = events
                .windows(2)
                .any(|w| w[0].key == Key::Backspace && w[1].key == Key::Backspace);
            if burst {
                return;
            }
        }
        panic!("no multi-backspace correction burst in 30 runs");
    }

    #[test]
    fn nearby_key_stays_on_the_keyboard() {
        let mut rng = rand::thread_rng();
        for c in "abcdefghijklmnopqrstuvwxyz".chars() {
            let k = nearby_key(&mut rng, c);
            assert!(k.is_ascii_lowercase());
            assert_ne!(k, ' ');
        }
        // Uppercase is preserved.
        assert!(nearby_key(&mut rng, 'A').is_ascii_uppercase());
    }
}
