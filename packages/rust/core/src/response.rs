//! Model response parsing.
//!
//! The model is asked for a bare JSON array but often wraps it in a Markdown
//! fence, adds prose, or gets cut off. [`parse_response`] tolerates all three
//! and never fails: anything it cannot use is dropped and logged.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use autotagger_sanitize::{sanitize_labels, validate_identifier};
use autotagger_shared::{LabelSet, SanitizeLimits};

/// First fenced block, with or without a language tag; an unclosed fence runs to the end.
static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n?(.*?)(?:```|$)").expect("valid regex")
});

/// Extract validated label sets from raw completion text.
pub fn parse_response(raw: &str, limits: &SanitizeLimits) -> Vec<LabelSet> {
    let body = extract_payload(raw).trim();

    let Some(parsed) = parse_array(body) else {
        warn!(chars = raw.len(), "model response is not a JSON array");
        return Vec::new();
    };

    let total = parsed.len();
    let sets: Vec<LabelSet> = parsed
        .iter()
        .filter_map(|item| label_set(item, limits))
        .collect();

    if sets.len() < total {
        debug!(kept = sets.len(), dropped = total - sets.len(), "dropped invalid entries");
    }
    sets
}

fn extract_payload(raw: &str) -> &str {
    match FENCE_RE.captures(raw).and_then(|c| c.get(1)) {
        Some(m) => m.as_str(),
        None => raw,
    }
}

/// Parse a JSON array, with one repair attempt for an unterminated one.
fn parse_array(text: &str) -> Option<Vec<Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => return Some(items),
        Ok(_) => return None,
        Err(e) => debug!(error = %e, "response JSON invalid"),
    }

    if !text.starts_with('[') || text.ends_with(']') {
        return None;
    }

    let repaired = format!("{}]", text.trim_end_matches(',').trim_end());
    match serde_json::from_str::<Value>(&repaired) {
        Ok(Value::Array(items)) => {
            debug!("repaired truncated response");
            Some(items)
        }
        _ => None,
    }
}

fn label_set(item: &Value, limits: &SanitizeLimits) -> Option<LabelSet> {
    let obj = item.as_object()?;
    let id = validate_identifier(obj.get("_id")?)?;
    let labels = sanitize_labels(obj.get("tags")?, limits)?;
    Some(LabelSet { id, labels })
}
