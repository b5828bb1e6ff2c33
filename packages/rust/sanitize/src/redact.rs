//! Pattern-based masking of secrets before text reaches a log sink.

use std::sync::LazyLock;

use regex::Regex;

/// Replacement text for masked secrets.
pub const REDACTED: &str = "[REDACTED]";

static PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(Bearer\s+)\S+",
        r"(sk-ant-api\d+-)\S+",
        r#"(?i)(api[_-]?key["']?\s*[:=]\s*["']?)[^"'\s,}]+"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

/// Mask bearer tokens, Anthropic API keys and `api_key=...` assignments.
///
/// The recognisable prefix is kept so log readers can tell what was removed.
pub fn redact(message: &str) -> String {
    let mut out = message.to_string();
    for re in PATTERNS.iter() {
        if re.is_match(&out) {
            out = re.replace_all(&out, format!("${{1}}{REDACTED}")).into_owned();
        }
    }
    out
}
