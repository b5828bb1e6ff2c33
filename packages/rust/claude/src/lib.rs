//! Claude Messages API client.
//!
//! A single-turn text completion is all the categorizer needs, exposed through
//! the [`ModelClient`] trait. Throttling (429) carries the `retry-after` hint
//! when the API sends one; 5xx and 529 "overloaded" are transient; every
//! other 4xx is terminal.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use autotagger_shared::{ClaudeConfig, Result, Service, TaggerError};

/// Messages API version header value.
const API_VERSION: &str = "2023-06-01";

/// User-Agent string for model requests.
const USER_AGENT: &str = concat!("autotagger/", env!("CARGO_PKG_VERSION"));

/// Maximum error body bytes kept in an error message.
const MAX_ERROR_BODY_BYTES: usize = 1024;

// ---------------------------------------------------------------------------
// ModelClient
// ---------------------------------------------------------------------------

/// A text-in, text-out language model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send `prompt` as a single user turn and return the completion text.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: [Message<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

// ---------------------------------------------------------------------------
// ClaudeClient
// ---------------------------------------------------------------------------

/// HTTP implementation of [`ModelClient`].
#[derive(Clone)]
pub struct ClaudeClient {
    http: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl std::fmt::Debug for ClaudeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl ClaudeClient {
    pub fn new(config: &ClaudeConfig, api_key: &str) -> Result<Self> {
        let raw = format!("{}/v1/messages", config.base_url.trim_end_matches('/'));
        let endpoint = Url::parse(&raw)
            .map_err(|e| TaggerError::config(format!("invalid claude base_url {raw}: {e}")))?;

        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                TaggerError::network(Service::Model, format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            http,
            endpoint,
            api_key: api_key.to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ModelClient for ClaudeClient {
    #[instrument(skip_all, fields(model = %self.model, prompt_chars = prompt.len()))]
    async fn complete(&self, prompt: &str) -> Result<String> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages: [Message {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .http
            .post(self.endpoint.clone())
            .header("x-api-key", self.api_key.as_str())
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| TaggerError::network(Service::Model, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.bytes().await.unwrap_or_default();
            return Err(TaggerError::from_status(
                Service::Model,
                status.as_u16(),
                retry_after,
                error_message(&body),
            ));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| TaggerError::parse(format!("unexpected messages response: {e}")))?;

        debug!(
            blocks = body.content.len(),
            stop_reason = body.stop_reason.as_deref().unwrap_or("none"),
            "completion received"
        );

        body.content
            .into_iter()
            .find(|block| block.kind == "text")
            .and_then(|block| block.text)
            .ok_or_else(|| TaggerError::parse("completion contained no text block"))
    }
}

/// Prefer the API's structured error message; fall back to the raw body.
fn error_message(body: &[u8]) -> String {
    if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(body) {
        return format!("{}: {}", envelope.error.kind, envelope.error.message);
    }
    let end = body.len().min(MAX_ERROR_BODY_BYTES);
    String::from_utf8_lossy(&body[..end]).trim().to_string()
}
