//! Structured data extraction from fetched HTML.
//!
//! Selectors are plain CSS, keyed by output field. A selector that fails
//! to parse or matches nothing only drops its own key — one bad selector
//! never poisons the rest of the extraction.

use scraper::{Html, Selector};
use serde_json::{Map, Value};

/// Extract named fields from HTML. Keys with exactly one match become
/// strings; multiple matches become arrays.
pub fn extract(html: &str, selectors: &[(String, String)]) -> Map<String, Value> {
    let document = Html::parse_document(html);
    let mut out = Map::new();

    for (key, css) in selectors {
        let selector = match Selector::parse(css) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(key = %key, selector = %css, error = %format!("{e:?}"), "invalid selector");
                continue;
            }
        };

        let values: Vec<String> = document
            .select(&selector)
            .map(|el| {
                el.text()
                    .collect::<Vec<_>>()
                    .join(" ")
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();

        match values.len() {
            0 => {}
            1 => {
                out.insert(key.clone(), Value::String(values.into_iter().next().unwrap()));
            }
            _ => {
                out.insert(
                    key.clone(),
                    Value::Array(values.into_iter().map(Value::String).collect()),
                );
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const HTML: &str = r#"
        <html><body>
            <h1 class="title">Wireless Headphones</h1>
            <span class="price">$199.00</span>
            <ul>
                <li class="feature">Noise cancelling</li>
                <li class="feature">30h battery</li>
                <li class="feature">Bluetooth 5.3</li>
            </ul>
        </body></html>
    "#;

    fn selectors(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn single_match_becomes_a_string() {
        let out = extract(HTML, &selectors(&[("title", "h1.title"), ("price", ".price")]));
        assert_eq!(out["title"], "Wireless Headphones");
        assert_eq!(out["price"], "$199.00");
    }

    #[test]
    fn multiple_matches_become_an_array() {
        let out = extract(HTML, &selectors(&[("features", "li.feature")]));
        let features = out["features"].as_array().unwrap();
        assert_eq!(features.len(), 3);
        assert_eq!(features[0], "Noise cancelling");
    }

    #[test]
    fn bad_selector_only_drops_its_own_key() {
        let out = extract(
            HTML,
            &selectors(&[("broken", ":::nonsense"), ("title", "h1.title")]),
        );
        assert!(!out.contains_key("broken"));
        assert_eq!(out["title"], "Wireless Headphones");
    }

    #[test]
    fn no_match_yields_no_key() {
        let out = extract(HTML, &selectors(&[("missing", ".does-not-exist")]));
        assert!(out.is_empty());
    }

    #[test]
    fn nested_text_is_flattened() {
        let html = "<div class='desc'>Great <b>sound</b>, light <i>build</i></div>";
        let out = extract(html, &selectors(&[("desc", ".desc")]));
        assert_eq!(out["desc"], "Great sound , light build");
    }
}
