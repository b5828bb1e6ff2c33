//! Label validation for model output and for the store's existing vocabulary.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use autotagger_shared::SanitizeLimits;

static LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w\s-]+$").expect("valid regex"));

/// Normalize one label: trim, lowercase, word characters/spaces/hyphens only,
/// strictly shorter than `max_length` characters.
pub fn sanitize_label(raw: &str, max_length: usize) -> Option<String> {
    let label = raw.trim().to_lowercase();

    if label.is_empty() || label.chars().count() >= max_length || !LABEL_RE.is_match(&label) {
        return None;
    }

    Some(label)
}

/// Validate a JSON label array from the model.
///
/// Invalid and duplicate entries are dropped individually; at most
/// `limits.max_labels` survive. Returns `None` when the value is not an
/// array or nothing survives.
pub fn sanitize_labels(raw: &Value, limits: &SanitizeLimits) -> Option<Vec<String>> {
    let items = raw.as_array()?;
    let mut labels: Vec<String> = Vec::new();

    for item in items {
        if labels.len() >= limits.max_labels {
            break;
        }
        let Some(text) = item.as_str() else {
            continue;
        };
        if let Some(label) = sanitize_label(text, limits.max_label_length) {
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
    }

    (!labels.is_empty()).then_some(labels)
}

/// Extract the existing label vocabulary from raw store items (`{"_id": "<label>"}`).
///
/// Terms keep their original case; anything outside the label character
/// class is dropped, as are duplicates.
pub fn vocabulary_from_raw(items: &[Value]) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();

    for item in items {
        let Some(term) = item.get("_id").and_then(Value::as_str).map(str::trim) else {
            continue;
        };
        if term.is_empty() || !LABEL_RE.is_match(term) {
            continue;
        }
        if !terms.iter().any(|t| t == term) {
            terms.push(term.to_string());
        }
    }

    terms
}
