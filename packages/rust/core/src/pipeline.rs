//! End-to-end tagging run: vocabulary → untagged records → batches → model → label writes.
//!
//! The [`Pipeline`] owns all run state. Failures are scoped: a bad item is
//! skipped, a failed batch is logged, a failed write marks one record. Only
//! cancellation ends a run early, and even then the statistics gathered so far
//! are returned.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use autotagger_claude::ModelClient;
use autotagger_raindrop::StoreClient;
use autotagger_sanitize::{record_from_raw, redact, vocabulary_from_raw};
use autotagger_shared::{
    FailureClass, LabelSet, Record, Result, RunConfig, RunId, RunStatistics, Service,
};

use crate::prompt::{PromptRules, build_prompt};
use crate::rate_limit::RateLimiter;
use crate::response::parse_response;

/// Title shown for label sets whose identifier was not part of this fetch.
const UNKNOWN_TITLE: &str = "Unknown";

/// Titles in apply log lines are cut to this many characters.
const LOG_TITLE_CHARS: usize = 60;

/// Labels listed in apply log lines before eliding the rest.
const LOG_LABELS: usize = 3;

// ---------------------------------------------------------------------------
// Stages and outcome
// ---------------------------------------------------------------------------

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchingVocabulary,
    FetchingRecords,
    Batching,
    /// 1-based batch index and batch count.
    Categorizing { batch: usize, total: usize },
    ApplyingResults,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FetchingVocabulary => f.write_str("Fetching existing tags"),
            Self::FetchingRecords => f.write_str("Fetching untagged bookmarks"),
            Self::Batching => f.write_str("Preparing batches"),
            Self::Categorizing { batch, total } => write!(f, "Categorizing batch {batch}/{total}"),
            Self::ApplyingResults => f.write_str("Applying tags"),
            Self::Done => f.write_str("Done"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Cancelled between stages or batches.
    Interrupted,
}

/// Result of [`Pipeline::run`].
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub dry_run: bool,
    pub status: RunStatus,
    pub stats: RunStatistics,
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait RunReporter: Send + Sync {
    /// Called when entering a new stage.
    fn stage(&self, stage: &Stage);
    /// Called after each model batch, with the number of label sets it produced.
    fn batch_done(&self, batch: usize, total: usize, categorized: usize);
    /// Called when labels were written (or would have been, in a dry run).
    fn record_applied(&self, title: &str, labels: &[String]);
    /// Called when a label write gave up. `error` is already redacted.
    fn record_failed(&self, title: &str, error: &str);
    /// Called once when the run ends, completed or not.
    fn done(&self, outcome: &RunOutcome);
}

/// No-op reporter for headless/test usage.
pub struct SilentReporter;

impl RunReporter for SilentReporter {
    fn stage(&self, _stage: &Stage) {}
    fn batch_done(&self, _batch: usize, _total: usize, _categorized: usize) {}
    fn record_applied(&self, _title: &str, _labels: &[String]) {}
    fn record_failed(&self, _title: &str, _error: &str) {}
    fn done(&self, _outcome: &RunOutcome) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Orchestrates one tagging run against a store and a model.
pub struct Pipeline {
    config: RunConfig,
    store: Arc<dyn StoreClient>,
    model: Arc<dyn ModelClient>,
    reporter: Arc<dyn RunReporter>,
    cancel: CancellationToken,
    limiter: RateLimiter,
    stats: RunStatistics,
}

impl Pipeline {
    pub fn new(config: RunConfig, store: Arc<dyn StoreClient>, model: Arc<dyn ModelClient>) -> Self {
        let limiter = RateLimiter::new(config.retry_delay, config.max_backoff);
        Self {
            config,
            store,
            model,
            reporter: Arc::new(SilentReporter),
            cancel: CancellationToken::new(),
            limiter,
            stats: RunStatistics::new(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn RunReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Observe `cancel` between stages and batches.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every stage and return the final statistics.
    #[instrument(skip_all, fields(dry_run = self.config.dry_run))]
    pub async fn run(&mut self) -> RunOutcome {
        let run_id = RunId::new();
        self.stats = RunStatistics::new();
        info!(%run_id, dry_run = self.config.dry_run, "starting tagging run");

        // --- Vocabulary ---
        if self.cancel.is_cancelled() {
            return self.finish(run_id, RunStatus::Interrupted);
        }
        self.reporter.stage(&Stage::FetchingVocabulary);
        let vocabulary = self.fetch_vocabulary().await;

        // --- Records ---
        if self.cancel.is_cancelled() {
            return self.finish(run_id, RunStatus::Interrupted);
        }
        self.reporter.stage(&Stage::FetchingRecords);
        let records = self.fetch_records().await;
        if records.is_empty() {
            info!("no untagged bookmarks found, nothing to do");
            return self.finish(run_id, RunStatus::Completed);
        }

        // --- Batches ---
        self.reporter.stage(&Stage::Batching);
        let batches: Vec<&[Record]> = records.chunks(self.config.batch_size).collect();
        let total = batches.len();
        info!(records = records.len(), batches = total, "categorizing");

        let rules = PromptRules::from(&self.config);
        let mut label_sets: Vec<LabelSet> = Vec::new();
        for (i, batch) in batches.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return self.finish(run_id, RunStatus::Interrupted);
            }
            let index = i + 1;
            self.reporter.stage(&Stage::Categorizing { batch: index, total });

            let sets = self.categorize(batch, &vocabulary, &rules, index).await;
            if sets.is_empty() {
                warn!(batch = index, size = batch.len(), "batch failed to categorize");
            } else {
                info!(batch = index, categorized = sets.len(), "batch categorized");
            }
            self.stats.categorized += sets.len() as u64;
            self.reporter.batch_done(index, total, sets.len());
            label_sets.extend(sets);
        }

        if label_sets.is_empty() {
            warn!("no bookmarks were categorized");
            return self.finish(run_id, RunStatus::Completed);
        }

        // --- Apply ---
        if self.cancel.is_cancelled() {
            return self.finish(run_id, RunStatus::Interrupted);
        }
        self.reporter.stage(&Stage::ApplyingResults);
        let titles = title_index(&records);
        if self.config.dry_run {
            info!(count = label_sets.len(), "dry run, skipping tag writes");
            for set in &label_sets {
                let title = title_for(&titles, &set.id);
                self.reporter.record_applied(title, &set.labels);
            }
            self.stats.updated += label_sets.len() as u64;
        } else {
            self.apply(&label_sets, &titles).await;
        }

        self.finish(run_id, RunStatus::Completed)
    }

    fn finish(&mut self, run_id: RunId, status: RunStatus) -> RunOutcome {
        self.stats.finished_at = Some(chrono::Utc::now());
        self.reporter.stage(&Stage::Done);

        let outcome = RunOutcome {
            run_id,
            dry_run: self.config.dry_run,
            status,
            stats: self.stats.clone(),
        };

        info!(
            run_id = %outcome.run_id,
            status = ?status,
            fetched = self.stats.fetched,
            categorized = self.stats.categorized,
            updated = self.stats.updated,
            failed = self.stats.failed,
            skipped = self.stats.skipped,
            rate_limited = self.stats.rate_limited,
            "tagging run finished"
        );

        self.reporter.done(&outcome);
        outcome
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    /// Existing labels; empty on any failure.
    async fn fetch_vocabulary(&mut self) -> Vec<String> {
        let store = Arc::clone(&self.store);
        match self.call_store(|| store.list_label_vocabulary()).await {
            Ok(items) => {
                let vocabulary = vocabulary_from_raw(&items);
                if vocabulary.is_empty() {
                    warn!("no existing tags found, the model will create a new taxonomy");
                } else {
                    info!(count = vocabulary.len(), "fetched existing tags");
                }
                vocabulary
            }
            Err(e) => {
                warn!(error = %redact(&e.to_string()), "could not fetch existing tags");
                Vec::new()
            }
        }
    }

    /// Page through untagged items until a short page, a failure, or the page cap.
    async fn fetch_records(&mut self) -> Vec<Record> {
        let store = Arc::clone(&self.store);
        let page_size = self.config.page_size;
        let mut records = Vec::new();

        for page in 0..self.config.max_pages {
            let items = match self
                .call_store(|| store.list_unlabeled(page, page_size))
                .await
            {
                Ok(items) => items,
                Err(e) => {
                    warn!(page, error = %redact(&e.to_string()), "page fetch failed, stopping pagination");
                    break;
                }
            };

            for item in &items {
                match record_from_raw(item, &self.config.limits) {
                    Some(record) => records.push(record),
                    None => self.stats.skipped += 1,
                }
            }
            debug!(page, items = items.len(), valid = records.len(), "fetched page");

            if items.len() < page_size as usize {
                break;
            }
        }

        self.stats.fetched = records.len() as u64;
        info!(fetched = records.len(), skipped = self.stats.skipped, "fetched untagged bookmarks");
        records
    }

    /// Ask the model for labels; retries throttles, transient errors and empty parses.
    #[instrument(skip_all, fields(batch = index, size = batch.len()))]
    async fn categorize(
        &mut self,
        batch: &[Record],
        vocabulary: &[String],
        rules: &PromptRules,
        index: usize,
    ) -> Vec<LabelSet> {
        let prompt = build_prompt(batch, vocabulary, rules);
        let fingerprint = format!("{:x}", Sha256::digest(prompt.as_bytes()));
        debug!(prompt_sha256 = &fingerprint[..12], chars = prompt.len(), "built prompt");

        let max_attempts = self.config.max_retries;
        for attempt in 1..=max_attempts {
            self.limiter
                .wait_if_needed(Service::Model, self.config.model_delay)
                .await;

            let err = match self.model.complete(&prompt).await {
                Ok(text) => {
                    let sets = parse_response(&text, &self.config.limits);
                    if !sets.is_empty() {
                        self.limiter.reset_retry_count(Service::Model);
                        return sets;
                    }
                    warn!(attempt, max_attempts, "model reply held no usable labels");
                    continue;
                }
                Err(e) => e,
            };

            let message = redact(&err.to_string());
            match err.class() {
                FailureClass::Throttled(hint) => {
                    self.stats.rate_limited += 1;
                    let wait = self.limiter.handle_rate_limit(Service::Model, hint);
                    if attempt < max_attempts {
                        tokio::time::sleep(wait).await;
                    }
                }
                FailureClass::Transient => {
                    warn!(attempt, max_attempts, error = %message, "model call failed");
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
                FailureClass::Terminal => {
                    warn!(error = %message, "model call rejected, abandoning batch");
                    break;
                }
            }
        }

        Vec::new()
    }

    /// Write every label set; failures are counted per record.
    async fn apply(&mut self, label_sets: &[LabelSet], titles: &TitleIndex<'_>) {
        let store = Arc::clone(&self.store);

        for set in label_sets {
            let title = title_for(titles, &set.id);
            let short = truncate_chars(title, LOG_TITLE_CHARS);

            match self
                .call_store(|| store.write_labels(&set.id, &set.labels))
                .await
            {
                Ok(()) => {
                    self.stats.updated += 1;
                    info!(id = %set.id, "{short}... → [{}]", summarize_labels(&set.labels));
                    self.reporter.record_applied(title, &set.labels);
                }
                Err(e) => {
                    self.stats.failed += 1;
                    let message = redact(&e.to_string());
                    warn!(id = %set.id, error = %message, "failed to update {short}...");
                    self.reporter.record_failed(title, &message);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Store retry discipline
    // -----------------------------------------------------------------------

    /// Run one store call with spacing, throttle backoff and transient retries.
    async fn call_store<T, F, Fut>(&mut self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_retries;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.limiter
                .wait_if_needed(Service::Store, self.config.store_delay)
                .await;

            let err = match op().await {
                Ok(value) => {
                    self.limiter.reset_retry_count(Service::Store);
                    return Ok(value);
                }
                Err(e) => e,
            };

            let wait: Duration = match err.class() {
                FailureClass::Throttled(hint) => {
                    self.stats.rate_limited += 1;
                    self.limiter.handle_rate_limit(Service::Store, hint)
                }
                FailureClass::Transient => {
                    warn!(attempt, max_attempts, error = %redact(&err.to_string()), "store call failed");
                    self.config.retry_delay
                }
                FailureClass::Terminal => return Err(err),
            };

            if attempt >= max_attempts {
                return Err(err);
            }
            tokio::time::sleep(wait).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Record id to title, built once per run.
type TitleIndex<'a> = HashMap<&'a str, &'a str>;

fn title_index(records: &[Record]) -> TitleIndex<'_> {
    records
        .iter()
        .map(|r| (r.id.as_str(), r.title.as_str()))
        .collect()
}

fn title_for<'a>(titles: &TitleIndex<'a>, id: &str) -> &'a str {
    titles.get(id).copied().unwrap_or(UNKNOWN_TITLE)
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// First few labels, with `...` when some were left out.
fn summarize_labels(labels: &[String]) -> String {
    let shown = labels
        .iter()
        .take(LOG_LABELS)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if labels.len() > LOG_LABELS {
        format!("{shown}...")
    } else {
        shown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::LazyLock;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use regex::Regex;
    use serde_json::{Value, json};

    use autotagger_shared::TaggerError;

    // -----------------------------------------------------------------------
    // Fakes
    // -----------------------------------------------------------------------

    /// A scripted store failure.
    #[derive(Clone, Copy)]
    enum Fault {
        Status(u16),
        Network,
    }

    #[derive(Default)]
    struct FakeStore {
        vocabulary: Vec<Value>,
        vocabulary_status: Option<u16>,
        pages: Vec<Vec<Value>>,
        /// Per page index, faults returned before the page is served.
        page_failures: Mutex<HashMap<u32, VecDeque<Fault>>>,
        /// Per record id, faults returned before the write succeeds.
        write_failures: Mutex<HashMap<String, VecDeque<Fault>>>,
        page_calls: Mutex<Vec<u32>>,
        write_calls: AtomicUsize,
        stored: Mutex<HashMap<String, Vec<String>>>,
    }

    impl FakeStore {
        fn with_pages(pages: Vec<Vec<Value>>) -> Self {
            Self {
                pages,
                vocabulary: vec![json!({"_id": "rust"}), json!({"_id": "ai"})],
                ..Self::default()
            }
        }

        fn fail_write(self, id: &str, statuses: &[u16]) -> Self {
            let faults: Vec<Fault> = statuses.iter().copied().map(Fault::Status).collect();
            self.fault_write(id, &faults)
        }

        fn fault_write(self, id: &str, faults: &[Fault]) -> Self {
            self.write_failures
                .lock()
                .unwrap()
                .insert(id.to_string(), faults.iter().copied().collect());
            self
        }

        fn fail_page(self, page: u32, statuses: &[u16]) -> Self {
            let faults: Vec<Fault> = statuses.iter().copied().map(Fault::Status).collect();
            self.fault_page(page, &faults)
        }

        fn fault_page(self, page: u32, faults: &[Fault]) -> Self {
            self.page_failures
                .lock()
                .unwrap()
                .insert(page, faults.iter().copied().collect());
            self
        }

        fn page_calls(&self) -> Vec<u32> {
            self.page_calls.lock().unwrap().clone()
        }

        fn writes(&self) -> usize {
            self.write_calls.load(Ordering::SeqCst)
        }
    }

    fn store_error(status: u16) -> TaggerError {
        let hint = (status == 429).then(|| Duration::from_secs(60));
        TaggerError::from_status(Service::Store, status, hint, "fake")
    }

    fn fault_error(fault: Fault) -> TaggerError {
        match fault {
            Fault::Status(status) => store_error(status),
            Fault::Network => TaggerError::network(Service::Store, "connection reset"),
        }
    }

    #[async_trait]
    impl StoreClient for FakeStore {
        async fn list_unlabeled(&self, page: u32, _page_size: u32) -> Result<Vec<Value>> {
            self.page_calls.lock().unwrap().push(page);
            let failure = self
                .page_failures
                .lock()
                .unwrap()
                .get_mut(&page)
                .and_then(VecDeque::pop_front);
            if let Some(fault) = failure {
                return Err(fault_error(fault));
            }
            Ok(self.pages.get(page as usize).cloned().unwrap_or_default())
        }

        async fn list_label_vocabulary(&self) -> Result<Vec<Value>> {
            match self.vocabulary_status {
                Some(status) => Err(store_error(status)),
                None => Ok(self.vocabulary.clone()),
            }
        }

        async fn write_labels(&self, record_id: &str, labels: &[String]) -> Result<()> {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            let failure = self
                .write_failures
                .lock()
                .unwrap()
                .get_mut(record_id)
                .and_then(VecDeque::pop_front);
            if let Some(fault) = failure {
                return Err(fault_error(fault));
            }
            self.stored
                .lock()
                .unwrap()
                .insert(record_id.to_string(), labels.to_vec());
            Ok(())
        }
    }

    static PROMPT_ID_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#""_id": "(\d+)""#).unwrap());

    /// Labels every record in the prompt, after replaying any scripted replies.
    #[derive(Default)]
    struct FakeModel {
        script: Mutex<VecDeque<Result<String>>>,
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
        cancel_on_call: Option<CancellationToken>,
    }

    impl FakeModel {
        fn scripted(replies: Vec<Result<String>>) -> Self {
            Self {
                script: Mutex::new(replies.into()),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelClient for FakeModel {
        async fn complete(&self, prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(prompt.to_string());
            if let Some(cancel) = &self.cancel_on_call {
                cancel.cancel();
            }
            if let Some(reply) = self.script.lock().unwrap().pop_front() {
                return reply;
            }
            let sets: Vec<Value> = PROMPT_ID_RE
                .captures_iter(prompt)
                .map(|c| json!({"_id": &c[1], "tags": ["Dev", "ai"]}))
                .collect();
            Ok(format!("```json\n{}\n```", Value::Array(sets)))
        }
    }

    fn items(range: std::ops::Range<usize>) -> Vec<Value> {
        range
            .map(|i| {
                json!({
                    "_id": i,
                    "link": format!("https://example.com/{i}"),
                    "title": format!("Bookmark {i}"),
                    "excerpt": "",
                    "domain": "example.com"
                })
            })
            .collect()
    }

    fn pipeline(store: &Arc<FakeStore>, model: &Arc<FakeModel>, config: RunConfig) -> Pipeline {
        let store: Arc<dyn StoreClient> = store.clone();
        let model: Arc<dyn ModelClient> = model.clone();
        Pipeline::new(config, store, model)
    }

    // -----------------------------------------------------------------------
    // Scenarios
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn empty_store_makes_no_model_calls() {
        let store = Arc::new(FakeStore::with_pages(vec![]));
        let model = Arc::new(FakeModel::default());

        let outcome = pipeline(&store, &model, RunConfig::default()).run().await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(model.calls(), 0);
        let s = &outcome.stats;
        assert_eq!(
            (s.fetched, s.categorized, s.updated, s.failed, s.skipped, s.rate_limited),
            (0, 0, 0, 0, 0, 0)
        );
        assert!(s.finished_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn single_short_page_is_fetched_once_and_fully_applied() {
        let store = Arc::new(FakeStore::with_pages(vec![items(0..30)]));
        let model = Arc::new(FakeModel::default());

        let outcome = pipeline(&store, &model, RunConfig::default()).run().await;

        assert_eq!(store.page_calls(), vec![0]);
        assert_eq!(model.calls(), 2);
        assert_eq!(outcome.stats.fetched, 30);
        assert_eq!(outcome.stats.categorized, 30);
        assert_eq!(outcome.stats.updated, 30);
        assert_eq!(store.writes(), 30);
        assert_eq!(
            store.stored.lock().unwrap().get("7"),
            Some(&vec!["dev".to_string(), "ai".to_string()])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_carries_vocabulary() {
        let store = Arc::new(FakeStore::with_pages(vec![items(0..2)]));
        let model = Arc::new(FakeModel::default());

        pipeline(&store, &model, RunConfig::default()).run().await;

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains("rust, ai"));
    }

    #[tokio::test(start_paused = true)]
    async fn pagination_stops_at_short_page() {
        let store = Arc::new(FakeStore::with_pages(vec![items(0..2), items(2..4), items(4..5)]));
        let model = Arc::new(FakeModel::default());
        let config = RunConfig {
            page_size: 2,
            ..RunConfig::default()
        };

        let outcome = pipeline(&store, &model, config).run().await;

        assert_eq!(store.page_calls(), vec![0, 1, 2]);
        assert_eq!(outcome.stats.fetched, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn pagination_respects_page_cap() {
        let pages = (0..10).map(|p| items(p * 2..p * 2 + 2)).collect();
        let store = Arc::new(FakeStore::with_pages(pages));
        let model = Arc::new(FakeModel::default());
        let config = RunConfig {
            page_size: 2,
            max_pages: 3,
            ..RunConfig::default()
        };

        let outcome = pipeline(&store, &model, config).run().await;

        assert_eq!(store.page_calls(), vec![0, 1, 2]);
        assert_eq!(outcome.stats.fetched, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_page_keeps_earlier_records() {
        let store = Arc::new(
            FakeStore::with_pages(vec![items(0..2), items(2..4)]).fail_page(1, &[400]),
        );
        let model = Arc::new(FakeModel::default());
        let config = RunConfig {
            page_size: 2,
            ..RunConfig::default()
        };

        let outcome = pipeline(&store, &model, config).run().await;

        assert_eq!(store.page_calls(), vec![0, 1]);
        assert_eq!(outcome.stats.fetched, 2);
        assert_eq!(outcome.stats.updated, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_page_is_retried_and_counted() {
        let store = Arc::new(FakeStore::with_pages(vec![items(0..3)]).fail_page(0, &[429]));
        let model = Arc::new(FakeModel::default());

        let start = tokio::time::Instant::now();
        let outcome = pipeline(&store, &model, RunConfig::default()).run().await;

        assert_eq!(store.page_calls(), vec![0, 0]);
        assert_eq!(outcome.stats.rate_limited, 1);
        assert_eq!(outcome.stats.fetched, 3);
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_items_are_skipped() {
        let mut page = items(0..3);
        page.push(json!({"_id": 99, "link": "not a url"}));
        page.push(json!({"link": "https://example.com/no-id"}));
        let store = Arc::new(FakeStore::with_pages(vec![page]));
        let model = Arc::new(FakeModel::default());

        let outcome = pipeline(&store, &model, RunConfig::default()).run().await;

        assert_eq!(outcome.stats.fetched, 3);
        assert_eq!(outcome.stats.skipped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn vocabulary_failure_is_not_fatal() {
        let store = Arc::new(FakeStore {
            vocabulary_status: Some(500),
            ..FakeStore::with_pages(vec![items(0..1)])
        });
        let model = Arc::new(FakeModel::default());

        let outcome = pipeline(&store, &model, RunConfig::default()).run().await;

        assert_eq!(outcome.stats.updated, 1);
        assert!(model.prompts.lock().unwrap()[0].contains("(none yet)"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_write_fails_only_that_record() {
        let store = Arc::new(FakeStore::with_pages(vec![items(0..5)]).fail_write("2", &[404]));
        let model = Arc::new(FakeModel::default());

        let outcome = pipeline(&store, &model, RunConfig::default()).run().await;

        assert_eq!(outcome.stats.failed, 1);
        assert_eq!(outcome.stats.updated, 4);
        // 4xx is never retried.
        assert_eq!(store.writes(), 5);
        assert!(outcome.stats.has_failures());
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_write_is_retried() {
        let store = Arc::new(
            FakeStore::with_pages(vec![items(0..2)])
                .fail_write("0", &[503])
                .fail_write("1", &[503, 502, 500]),
        );
        let model = Arc::new(FakeModel::default());

        let outcome = pipeline(&store, &model, RunConfig::default()).run().await;

        assert_eq!(outcome.stats.updated, 1);
        assert_eq!(outcome.stats.failed, 1);
        // "0": fail + success, "1": three failures.
        assert_eq!(store.writes(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn network_faults_are_retried_after_fixed_delay() {
        let store = Arc::new(
            FakeStore::with_pages(vec![items(0..2)])
                .fault_page(0, &[Fault::Network])
                .fault_write("1", &[Fault::Network, Fault::Status(304)]),
        );
        let model = Arc::new(FakeModel::default());

        let start = tokio::time::Instant::now();
        let outcome = pipeline(&store, &model, RunConfig::default()).run().await;

        assert_eq!(store.page_calls(), vec![0, 0]);
        assert_eq!(outcome.stats.fetched, 2);
        assert_eq!(outcome.stats.updated, 2);
        assert_eq!(outcome.stats.failed, 0);
        assert_eq!(outcome.stats.rate_limited, 0);
        // "0": one write, "1": two faults then success.
        assert_eq!(store.writes(), 4);
        assert!(start.elapsed() >= RunConfig::default().retry_delay * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn applying_twice_is_idempotent() {
        let reply = r#"[{"_id":"1","tags":["dev"]},{"_id":"1","tags":["dev"]}]"#;
        let store = Arc::new(FakeStore::with_pages(vec![items(1..2)]));
        let model = Arc::new(FakeModel::scripted(vec![Ok(reply.into())]));

        let outcome = pipeline(&store, &model, RunConfig::default()).run().await;

        assert_eq!(outcome.stats.updated, 2);
        assert_eq!(store.writes(), 2);
        let stored = store.stored.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored["1"], vec!["dev".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_identifiers_are_still_applied() {
        let reply = r#"[{"_id":"999","tags":["dev"]}]"#;
        let store = Arc::new(FakeStore::with_pages(vec![items(0..1)]));
        let model = Arc::new(FakeModel::scripted(vec![Ok(reply.into())]));

        let outcome = pipeline(&store, &model, RunConfig::default()).run().await;

        assert_eq!(outcome.stats.updated, 1);
        assert!(store.stored.lock().unwrap().contains_key("999"));
    }

    #[tokio::test(start_paused = true)]
    async fn dry_run_never_writes() {
        let store = Arc::new(FakeStore::with_pages(vec![items(0..4)]));
        let model = Arc::new(FakeModel::default());
        let config = RunConfig {
            dry_run: true,
            ..RunConfig::default()
        };

        let outcome = pipeline(&store, &model, config).run().await;

        assert!(outcome.dry_run);
        assert_eq!(store.writes(), 0);
        assert_eq!(outcome.stats.categorized, 4);
        assert_eq!(outcome.stats.updated, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn model_throttle_backs_off_and_retries() {
        let throttle = TaggerError::from_status(Service::Model, 429, None, "slow down");
        let store = Arc::new(FakeStore::with_pages(vec![items(0..2)]));
        let model = Arc::new(FakeModel::scripted(vec![Err(throttle)]));

        let start = tokio::time::Instant::now();
        let outcome = pipeline(&store, &model, RunConfig::default()).run().await;

        assert_eq!(model.calls(), 2);
        assert_eq!(outcome.stats.rate_limited, 1);
        assert_eq!(outcome.stats.updated, 2);
        // retry_delay 5s doubled once.
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn model_transient_failures_retry_same_batch() {
        let store = Arc::new(FakeStore::with_pages(vec![items(0..2)]));
        let model = Arc::new(FakeModel::scripted(vec![
            Err(TaggerError::from_status(Service::Model, 503, None, "unavailable")),
            Err(TaggerError::network(Service::Model, "timed out")),
        ]));
        let config = RunConfig::default();
        let retry_delay = config.retry_delay;

        let start = tokio::time::Instant::now();
        let outcome = pipeline(&store, &model, config).run().await;

        assert_eq!(model.calls(), 3);
        assert_eq!(outcome.stats.rate_limited, 0);
        assert_eq!(outcome.stats.categorized, 2);
        assert_eq!(outcome.stats.updated, 2);
        assert!(start.elapsed() >= retry_delay * 2);
        // Every attempt carried the same batch.
        let prompts = model.prompts.lock().unwrap();
        assert!(prompts.iter().all(|p| p == &prompts[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn unusable_replies_exhaust_attempts() {
        let store = Arc::new(FakeStore::with_pages(vec![items(0..2)]));
        let model = Arc::new(FakeModel::scripted(vec![
            Ok("Sorry, I can't help.".into()),
            Ok("[]".into()),
            Ok("{}".into()),
        ]));

        let outcome = pipeline(&store, &model, RunConfig::default()).run().await;

        assert_eq!(model.calls(), 3);
        assert_eq!(outcome.stats.categorized, 0);
        assert_eq!(store.writes(), 0);
        assert_eq!(outcome.status, RunStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_model_call_abandons_batch_only() {
        let rejected = TaggerError::from_status(Service::Model, 400, None, "bad request");
        let store = Arc::new(FakeStore::with_pages(vec![items(0..30)]));
        let model = Arc::new(FakeModel::scripted(vec![Err(rejected)]));

        let outcome = pipeline(&store, &model, RunConfig::default()).run().await;

        // First batch abandoned after one call, second batch succeeds.
        assert_eq!(model.calls(), 2);
        assert_eq!(outcome.stats.categorized, 5);
        assert_eq!(outcome.stats.updated, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_does_nothing() {
        let store = Arc::new(FakeStore::with_pages(vec![items(0..3)]));
        let model = Arc::new(FakeModel::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = pipeline(&store, &model, RunConfig::default())
            .with_cancellation(cancel)
            .run()
            .await;

        assert_eq!(outcome.status, RunStatus::Interrupted);
        assert!(store.page_calls().is_empty());
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_observed_between_batches() {
        let cancel = CancellationToken::new();
        let store = Arc::new(FakeStore::with_pages(vec![items(0..30)]));
        let model = Arc::new(FakeModel {
            cancel_on_call: Some(cancel.clone()),
            ..FakeModel::default()
        });

        let outcome = pipeline(&store, &model, RunConfig::default())
            .with_cancellation(cancel)
            .run()
            .await;

        assert_eq!(outcome.status, RunStatus::Interrupted);
        assert_eq!(model.calls(), 1);
        assert_eq!(outcome.stats.categorized, 25);
        assert_eq!(store.writes(), 0);
    }

    #[derive(Default)]
    struct RecordingReporter {
        events: Mutex<Vec<String>>,
    }

    impl RunReporter for RecordingReporter {
        fn stage(&self, stage: &Stage) {
            self.events.lock().unwrap().push(stage.to_string());
        }
        fn batch_done(&self, batch: usize, total: usize, categorized: usize) {
            self.events
                .lock()
                .unwrap()
                .push(format!("batch {batch}/{total}: {categorized}"));
        }
        fn record_applied(&self, title: &str, _labels: &[String]) {
            self.events.lock().unwrap().push(format!("applied {title}"));
        }
        fn record_failed(&self, title: &str, _error: &str) {
            self.events.lock().unwrap().push(format!("failed {title}"));
        }
        fn done(&self, outcome: &RunOutcome) {
            self.events
                .lock()
                .unwrap()
                .push(format!("done {:?}", outcome.status));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_sees_stages_in_order() {
        let store = Arc::new(FakeStore::with_pages(vec![items(0..2)]).fail_write("1", &[404]));
        let model = Arc::new(FakeModel::default());
        let reporter = Arc::new(RecordingReporter::default());

        pipeline(&store, &model, RunConfig::default())
            .with_reporter(reporter.clone())
            .run()
            .await;

        let events = reporter.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "Fetching existing tags",
                "Fetching untagged bookmarks",
                "Preparing batches",
                "Categorizing batch 1/1",
                "batch 1/1: 2",
                "Applying tags",
                "applied Bookmark 0",
                "failed Bookmark 1",
                "Done",
                "done Completed",
            ]
        );
    }

    #[test]
    fn label_summary_elides_after_three() {
        let labels: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        assert_eq!(summarize_labels(&labels), "a, b, c...");
        assert_eq!(summarize_labels(&labels[..2]), "a, b");
    }

    #[test]
    fn title_lookup_falls_back() {
        let records = vec![Record {
            id: "1".into(),
            url: "https://example.com".into(),
            title: "Example".into(),
            excerpt: String::new(),
            domain: String::new(),
        }];
        let titles = title_index(&records);
        assert_eq!(title_for(&titles, "1"), "Example");
        assert_eq!(title_for(&titles, "2"), UNKNOWN_TITLE);
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }

    // -----------------------------------------------------------------------
    // Against mock HTTP services
    // -----------------------------------------------------------------------

    mod http {
        use super::*;
        use autotagger_claude::ClaudeClient;
        use autotagger_raindrop::RaindropClient;
        use autotagger_shared::{ClaudeConfig, RaindropConfig};
        use wiremock::matchers::{body_json, method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        #[tokio::test]
        async fn run_against_mock_services() {
            let raindrop = MockServer::start().await;
            let claude = MockServer::start().await;

            Mock::given(method("GET"))
                .and(path("/tags"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "items": [{"_id": "rust"}]
                })))
                .mount(&raindrop)
                .await;
            Mock::given(method("GET"))
                .and(path("/raindrops/-1"))
                .and(query_param("page", "0"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "items": [
                        {"_id": 111, "link": "https://tokio.rs", "title": "Tokio"},
                        {"_id": 222, "link": "https://serde.rs", "title": "Serde"},
                        {"_id": 333, "link": "ftp://bad", "title": "Bad"}
                    ]
                })))
                .expect(1)
                .mount(&raindrop)
                .await;
            Mock::given(method("PUT"))
                .and(path("/raindrop/111"))
                .and(body_json(json!({"tags": ["rust", "async"]})))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": true})))
                .expect(1)
                .mount(&raindrop)
                .await;
            Mock::given(method("PUT"))
                .and(path("/raindrop/222"))
                .respond_with(ResponseTemplate::new(404))
                .expect(1)
                .mount(&raindrop)
                .await;

            let reply = "Here are the tags:\n```json\n[{\"_id\":\"111\",\"tags\":[\"Rust\",\"async\"]},{\"_id\":\"222\",\"tags\":[\"serde\"]}]\n```";
            Mock::given(method("POST"))
                .and(path("/v1/messages"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "content": [{"type": "text", "text": reply}]
                })))
                .expect(1)
                .mount(&claude)
                .await;

            let store = RaindropClient::new(
                &RaindropConfig {
                    base_url: raindrop.uri(),
                    ..RaindropConfig::default()
                },
                "test-token-123456",
            )
            .unwrap();
            let model = ClaudeClient::new(
                &ClaudeConfig {
                    base_url: claude.uri(),
                    ..ClaudeConfig::default()
                },
                "sk-ant-api03-test",
            )
            .unwrap();

            let config = RunConfig {
                store_delay: Duration::ZERO,
                model_delay: Duration::ZERO,
                retry_delay: Duration::from_millis(10),
                ..RunConfig::default()
            };
            let outcome = Pipeline::new(config, Arc::new(store), Arc::new(model))
                .run()
                .await;

            let s = &outcome.stats;
            assert_eq!(outcome.status, RunStatus::Completed);
            assert_eq!((s.fetched, s.skipped), (2, 1));
            assert_eq!(s.categorized, 2);
            assert_eq!((s.updated, s.failed), (1, 1));
            assert_eq!(s.success_rate(), Some(50.0));
        }
    }
}
