//! Validation and sanitization of everything that crosses a trust boundary.
//!
//! Bookmarks from the store and label arrays from the model are both treated
//! as untrusted. Every function here either returns a clean value or rejects
//! the input outright (`None`); nothing is partially repaired and nothing
//! panics on hostile data.
//!
//! - [`record_from_raw`]: raw store item → [`Record`]
//! - [`labels`]: label and vocabulary validation
//! - [`redact`]: secret masking for log output

pub mod labels;
pub mod redact;

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use autotagger_shared::{Record, SanitizeLimits};

pub use labels::{sanitize_label, sanitize_labels, vocabulary_from_raw};
pub use redact::redact;

/// Marker appended to truncated text.
pub const ELLIPSIS: &str = "...";

/// Title used when the store item has none.
const UNTITLED: &str = "Untitled";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Build a [`Record`] from a raw store item, or reject it.
///
/// Rejects items that are not objects, have no usable `_id`, or whose `link`
/// fails [`sanitize_url`]. Text fields are always sanitized, never rejected.
pub fn record_from_raw(raw: &Value, limits: &SanitizeLimits) -> Option<Record> {
    let obj = raw.as_object()?;

    let Some(id) = obj.get("_id").and_then(raw_identifier) else {
        debug!("rejecting store item without identifier");
        return None;
    };

    let link = obj.get("link").and_then(Value::as_str).unwrap_or_default();
    let Some(url) = sanitize_url(link, limits.max_url_length) else {
        debug!(id = %id, "rejecting store item with invalid url");
        return None;
    };

    let title = obj.get("title").and_then(Value::as_str).unwrap_or(UNTITLED);
    let excerpt = obj.get("excerpt").and_then(Value::as_str).unwrap_or_default();
    let domain = obj.get("domain").and_then(Value::as_str).unwrap_or_default();

    Some(Record {
        id,
        url,
        title: sanitize_text(title, limits.max_title_length),
        excerpt: sanitize_text(excerpt, limits.max_excerpt_length),
        domain: sanitize_text(domain, limits.max_domain_length),
    })
}

/// Validate an identifier returned by the model: non-empty and alphanumeric.
pub fn validate_identifier(raw: &Value) -> Option<String> {
    raw_identifier(raw).filter(|id| id.chars().all(char::is_alphanumeric))
}

/// Render a JSON string or integer identifier; anything else is rejected.
fn raw_identifier(raw: &Value) -> Option<String> {
    let id = match raw {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) if n.is_u64() || n.is_i64() => n.to_string(),
        _ => return None,
    };
    (!id.is_empty()).then_some(id)
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

/// Strip control characters, collapse whitespace, bound length, escape for JSON.
///
/// Over-long input is cut so that the result, marker included, is exactly
/// `max_length` characters before escaping. Lengths count `char`s.
pub fn sanitize_text(raw: &str, max_length: usize) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let stripped: String = raw.chars().filter(|c| !is_control(*c)).collect();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let bounded = truncate_with_marker(&collapsed, max_length);

    escape_json(&bounded)
}

/// C0 and C1 control characters, plus DEL.
fn is_control(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{1f}' | '\u{7f}'..='\u{9f}')
}

fn truncate_with_marker(text: &str, max_length: usize) -> String {
    if text.chars().count() <= max_length {
        return text.to_string();
    }

    let marker_len = ELLIPSIS.chars().count();
    if max_length < marker_len {
        return ELLIPSIS.chars().take(max_length).collect();
    }

    let mut out: String = text.chars().take(max_length - marker_len).collect();
    out.push_str(ELLIPSIS);
    out
}

fn escape_json(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

// ---------------------------------------------------------------------------
// URLs
// ---------------------------------------------------------------------------

/// Accept an http(s) URL with a domain, `localhost` or IPv4 host; reject everything else.
pub fn sanitize_url(raw: &str, max_length: usize) -> Option<String> {
    static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(concat!(
            r"(?i)^https?://",
            r"(?:(?:[A-Z0-9](?:[A-Z0-9-]{0,61}[A-Z0-9])?\.)+[A-Z]{2,6}\.?",
            r"|localhost",
            r"|\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})",
            r"(?::\d+)?",
            r"(?:/?|[/?]\S+)$",
        ))
        .expect("valid regex")
    });

    if raw.is_empty() || raw.chars().count() > max_length {
        return None;
    }

    URL_RE.is_match(raw).then(|| raw.to_string())
}
