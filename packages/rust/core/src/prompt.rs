//! Categorization prompt construction.

use autotagger_shared::{Record, RunConfig};

/// Shown instead of the vocabulary when the store has no labels yet.
const EMPTY_VOCABULARY: &str = "(none yet)";

/// Label-count and vocabulary bounds rendered into the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRules {
    pub min_labels: usize,
    pub max_labels: usize,
    pub max_vocabulary: usize,
}

impl From<&RunConfig> for PromptRules {
    fn from(config: &RunConfig) -> Self {
        Self {
            min_labels: config.min_labels,
            max_labels: config.max_labels,
            max_vocabulary: config.max_vocabulary,
        }
    }
}

/// Render the prompt for one batch. Same inputs, same output.
pub fn build_prompt(records: &[Record], vocabulary: &[String], rules: &PromptRules) -> String {
    let shown: Vec<&str> = vocabulary
        .iter()
        .take(rules.max_vocabulary)
        .map(String::as_str)
        .collect();
    let vocabulary_line = if shown.is_empty() {
        EMPTY_VOCABULARY.to_string()
    } else {
        shown.join(", ")
    };

    // Serializing plain string fields cannot fail.
    let records_json = serde_json::to_string_pretty(records).unwrap_or_else(|_| "[]".into());

    format!(
        "You are a bookmark categorization expert. Categorize these bookmarks using the established tag taxonomy.

EXISTING TAGS (use these when possible):
{vocabulary_line}

RULES:
1. Use existing tags when they fit
2. Create new tags only when necessary (lowercase, single words preferred)
3. Assign {min}-{max} tags per bookmark
4. Order tags by relevance: primary category, then specific topic, then action/type

BOOKMARKS TO CATEGORIZE:
{records_json}

Return ONLY a JSON array with this structure:
[{{\"_id\": \"id\", \"tags\": [\"tag1\", \"tag2\", \"tag3\"]}}]

No explanations, just the JSON array.",
        min = rules.min_labels,
        max = rules.max_labels,
    )
}
