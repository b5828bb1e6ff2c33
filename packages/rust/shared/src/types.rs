//! Core domain types for the auto-tagger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one pipeline run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// The two external services the pipeline talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    /// The bookmark store (Raindrop.io).
    Store,
    /// The language-model service (Claude).
    Model,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Model => "model",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// A sanitized bookmark awaiting labels.
///
/// Only the sanitizer constructs these; every field has already been
/// validated, length-bounded and escaped for JSON embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Store identifier (non-empty).
    #[serde(rename = "_id")]
    pub id: String,
    /// Validated http/https URL.
    pub url: String,
    pub title: String,
    pub excerpt: String,
    pub domain: String,
}

// ---------------------------------------------------------------------------
// LabelSet
// ---------------------------------------------------------------------------

/// Validated labels produced for one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSet {
    /// Alphanumeric record identifier as returned by the model.
    #[serde(rename = "_id")]
    pub id: String,
    /// Lowercased, deduplicated labels, in model order.
    #[serde(rename = "tags")]
    pub labels: Vec<String>,
}

// ---------------------------------------------------------------------------
// RunStatistics
// ---------------------------------------------------------------------------

/// Counters accumulated over one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatistics {
    /// Valid records fetched from the store.
    pub fetched: u64,
    /// Label sets successfully parsed from model output.
    pub categorized: u64,
    /// Label sets written (or counted as written in dry-run mode).
    pub updated: u64,
    /// Records whose write failed.
    pub failed: u64,
    /// Store items dropped by validation.
    pub skipped: u64,
    /// Throttling signals received from either service.
    pub rate_limited: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStatistics {
    /// Fresh, all-zero counters stamped with the current time.
    pub fn new() -> Self {
        Self {
            fetched: 0,
            categorized: 0,
            updated: 0,
            failed: 0,
            skipped: 0,
            rate_limited: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Whether the run should be reported with a non-zero outcome.
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// Percentage of fetched records that were updated, if anything was fetched.
    pub fn success_rate(&self) -> Option<f64> {
        (self.fetched > 0).then(|| self.updated as f64 / self.fetched as f64 * 100.0)
    }
}

impl Default for RunStatistics {
    fn default() -> Self {
        Self::new()
    }
}
