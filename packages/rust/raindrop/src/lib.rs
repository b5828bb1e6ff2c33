//! Raindrop.io REST client.
//!
//! The pipeline only needs three calls: the existing tag vocabulary, pages of
//! bookmarks that carry no tags yet, and a tag write for one bookmark. They
//! are exposed through the [`StoreClient`] trait so the orchestrator can be
//! exercised against in-memory fakes.
//!
//! Items are returned as raw JSON; validation happens in the sanitizer.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::{Value, json};
use tracing::{debug, instrument};
use url::Url;

use autotagger_shared::{RaindropConfig, Result, Service, TaggerError};

/// User-Agent string for store requests.
const USER_AGENT: &str = concat!("autotagger/", env!("CARGO_PKG_VERSION"));

/// Collection id Raindrop uses for "all bookmarks except trash".
const ALL_COLLECTIONS: &str = "-1";

/// Search query selecting bookmarks with no tags.
const UNTAGGED_QUERY: &str = "notag:true";

/// Wait hint assumed when a 429 arrives without `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Error bodies are cut to this many bytes before they reach an error message.
const MAX_ERROR_BODY_BYTES: usize = 512;

// ---------------------------------------------------------------------------
// StoreClient
// ---------------------------------------------------------------------------

/// Operations the pipeline performs against the bookmark store.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// One page (0-based) of bookmarks without tags, as raw items.
    async fn list_unlabeled(&self, page: u32, page_size: u32) -> Result<Vec<Value>>;

    /// All tags the user already has, as raw `{"_id": "<tag>"}` items.
    async fn list_label_vocabulary(&self) -> Result<Vec<Value>>;

    /// Replace the tags of one bookmark.
    async fn write_labels(&self, record_id: &str, labels: &[String]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// RaindropClient
// ---------------------------------------------------------------------------

/// HTTP implementation of [`StoreClient`] for the Raindrop REST v1 API.
#[derive(Clone)]
pub struct RaindropClient {
    http: Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for RaindropClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaindropClient")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl RaindropClient {
    /// Build a client with the configured timeout and base URL.
    pub fn new(config: &RaindropConfig, token: &str) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                TaggerError::network(Service::Store, format!("failed to build HTTP client: {e}"))
            })?;

        // Validate once so endpoint construction below cannot fail on the base.
        Url::parse(&config.base_url).map_err(|e| {
            TaggerError::config(format!("invalid raindrop base_url {}: {e}", config.base_url))
        })?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let raw = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        Url::parse(&raw).map_err(|e| TaggerError::validation(format!("bad endpoint {raw}: {e}")))
    }

    /// Fetch `url` and return its `items` array (empty when absent).
    async fn get_items(&self, url: Url) -> Result<Vec<Value>> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| TaggerError::network(Service::Store, e.to_string()))?;

        let response = check_status(response).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| TaggerError::parse(format!("store response is not JSON: {e}")))?;

        Ok(match body.get("items") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        })
    }
}

#[async_trait]
impl StoreClient for RaindropClient {
    #[instrument(skip(self))]
    async fn list_unlabeled(&self, page: u32, page_size: u32) -> Result<Vec<Value>> {
        let mut url = self.endpoint(&format!("raindrops/{ALL_COLLECTIONS}"))?;
        url.query_pairs_mut()
            .append_pair("search", UNTAGGED_QUERY)
            .append_pair("perpage", &page_size.to_string())
            .append_pair("page", &page.to_string());

        let items = self.get_items(url).await?;
        debug!(count = items.len(), "fetched untagged page");
        Ok(items)
    }

    #[instrument(skip(self))]
    async fn list_label_vocabulary(&self) -> Result<Vec<Value>> {
        let items = self.get_items(self.endpoint("tags")?).await?;
        debug!(count = items.len(), "fetched tag vocabulary");
        Ok(items)
    }

    #[instrument(skip(self, labels), fields(labels = labels.len()))]
    async fn write_labels(&self, record_id: &str, labels: &[String]) -> Result<()> {
        let url = self.endpoint(&format!("raindrop/{record_id}"))?;
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .json(&json!({ "tags": labels }))
            .send()
            .await
            .map_err(|e| TaggerError::network(Service::Store, e.to_string()))?;

        check_status(response).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Pass 2xx responses through; map everything else to a [`TaggerError`].
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = match status.as_u16() {
        429 => Some(retry_after(&response).unwrap_or(DEFAULT_RETRY_AFTER)),
        _ => None,
    };

    let body = response.bytes().await.unwrap_or_default();
    let end = body.len().min(MAX_ERROR_BODY_BYTES);
    let message = String::from_utf8_lossy(&body[..end]).trim().to_string();

    Err(TaggerError::from_status(
        Service::Store,
        status.as_u16(),
        retry_after,
        message,
    ))
}

/// `Retry-After` in whole seconds, if the server sent one we can read.
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
