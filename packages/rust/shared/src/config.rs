//! Application configuration for the auto-tagger.
//!
//! User config lives at `~/.autotagger/autotagger.toml`.
//! CLI flags override config file values, which override defaults.
//! Secrets are never stored in the file: it only names the environment
//! variables that hold them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TaggerError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "autotagger.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".autotagger";

/// Shortest store token we accept as plausible.
const MIN_STORE_TOKEN_LEN: usize = 10;

/// Prefix every Anthropic API key carries.
const MODEL_KEY_PREFIX: &str = "sk-ant-";

// ---------------------------------------------------------------------------
// Config structs (matching autotagger.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Bookmark store settings.
    #[serde(default)]
    pub raindrop: RaindropConfig,

    /// Language-model settings.
    #[serde(default)]
    pub claude: ClaudeConfig,

    /// Batching, retry and dry-run behaviour.
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Sanitization bounds.
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// `[raindrop]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaindropConfig {
    /// Name of the env var holding the API token (never store the token itself).
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// REST API base URL.
    #[serde(default = "default_raindrop_url")]
    pub base_url: String,

    /// Per-request transport timeout.
    #[serde(default = "default_raindrop_timeout")]
    pub timeout_secs: u64,

    /// Minimum ms between calls to the store.
    #[serde(default = "default_raindrop_delay")]
    pub delay_ms: u64,

    /// Items requested per page (the API maximum is 50).
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Hard cap on pages fetched per run.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

impl Default for RaindropConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            base_url: default_raindrop_url(),
            timeout_secs: default_raindrop_timeout(),
            delay_ms: default_raindrop_delay(),
            page_size: default_page_size(),
            max_pages: default_max_pages(),
        }
    }
}

fn default_token_env() -> String {
    "RAINDROP_TOKEN".into()
}
fn default_raindrop_url() -> String {
    "https://api.raindrop.io/rest/v1".into()
}
fn default_raindrop_timeout() -> u64 {
    15
}
fn default_raindrop_delay() -> u64 {
    500
}
fn default_page_size() -> u32 {
    50
}
fn default_max_pages() -> u32 {
    20
}

/// `[claude]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeConfig {
    /// Name of the env var holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// API base URL (the client appends `/v1/messages`).
    #[serde(default = "default_claude_url")]
    pub base_url: String,

    /// Model used for categorization.
    #[serde(default = "default_model")]
    pub model: String,

    /// Completion token budget.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature; kept low for consistent labels.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Per-request transport timeout.
    #[serde(default = "default_claude_timeout")]
    pub timeout_secs: u64,

    /// Minimum ms between calls to the model.
    #[serde(default = "default_claude_delay")]
    pub delay_ms: u64,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_claude_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_claude_timeout(),
            delay_ms: default_claude_delay(),
        }
    }
}

fn default_api_key_env() -> String {
    "CLAUDE_API_KEY".into()
}
fn default_claude_url() -> String {
    "https://api.anthropic.com".into()
}
fn default_model() -> String {
    "claude-3-haiku-20240307".into()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    0.3
}
fn default_claude_timeout() -> u64 {
    60
}
fn default_claude_delay() -> u64 {
    2000
}

/// `[processing]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Records per model request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Lower bound of the label range requested in the prompt.
    #[serde(default = "default_min_labels")]
    pub min_labels: usize,

    /// Upper bound of the label range; also the hard cap applied to model output.
    #[serde(default = "default_max_labels")]
    pub max_labels: usize,

    /// Existing labels shown to the model.
    #[serde(default = "default_max_vocabulary")]
    pub max_vocabulary: usize,

    /// Attempts per external call.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed wait after a transient failure, and the backoff base.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Ceiling for throttling backoff.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Run everything except the label writes.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            min_labels: default_min_labels(),
            max_labels: default_max_labels(),
            max_vocabulary: default_max_vocabulary(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            max_backoff_secs: default_max_backoff(),
            dry_run: false,
        }
    }
}

fn default_batch_size() -> usize {
    25
}
fn default_min_labels() -> usize {
    2
}
fn default_max_labels() -> usize {
    5
}
fn default_max_vocabulary() -> usize {
    100
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    5000
}
fn default_max_backoff() -> u64 {
    300
}

/// `[limits]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_title")]
    pub max_title_length: usize,
    #[serde(default = "default_max_excerpt")]
    pub max_excerpt_length: usize,
    #[serde(default = "default_max_domain")]
    pub max_domain_length: usize,
    #[serde(default = "default_max_url")]
    pub max_url_length: usize,
    /// Labels must be strictly shorter than this.
    #[serde(default = "default_max_label")]
    pub max_label_length: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_title_length: default_max_title(),
            max_excerpt_length: default_max_excerpt(),
            max_domain_length: default_max_domain(),
            max_url_length: default_max_url(),
            max_label_length: default_max_label(),
        }
    }
}

fn default_max_title() -> usize {
    200
}
fn default_max_excerpt() -> usize {
    500
}
fn default_max_domain() -> usize {
    100
}
fn default_max_url() -> usize {
    2000
}
fn default_max_label() -> usize {
    50
}

// ---------------------------------------------------------------------------
// Runtime config (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Bounds applied by the sanitizer to untrusted data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizeLimits {
    pub max_title_length: usize,
    pub max_excerpt_length: usize,
    pub max_domain_length: usize,
    pub max_url_length: usize,
    pub max_label_length: usize,
    /// Labels kept per record.
    pub max_labels: usize,
}

impl Default for SanitizeLimits {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SanitizeLimits {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_title_length: config.limits.max_title_length,
            max_excerpt_length: config.limits.max_excerpt_length,
            max_domain_length: config.limits.max_domain_length,
            max_url_length: config.limits.max_url_length,
            max_label_length: config.limits.max_label_length,
            max_labels: config.processing.max_labels,
        }
    }
}

/// Runtime pipeline configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Skip label writes, count parsed results as applied.
    pub dry_run: bool,
    pub batch_size: usize,
    pub min_labels: usize,
    pub max_labels: usize,
    pub max_vocabulary: usize,
    /// Minimum spacing between store calls.
    pub store_delay: Duration,
    /// Minimum spacing between model calls.
    pub model_delay: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_backoff: Duration,
    pub page_size: u32,
    pub max_pages: u32,
    pub limits: SanitizeLimits,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for RunConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            dry_run: config.processing.dry_run,
            batch_size: config.processing.batch_size.max(1),
            min_labels: config.processing.min_labels,
            max_labels: config.processing.max_labels,
            max_vocabulary: config.processing.max_vocabulary,
            store_delay: Duration::from_millis(config.raindrop.delay_ms),
            model_delay: Duration::from_millis(config.claude.delay_ms),
            max_retries: config.processing.max_retries.max(1),
            retry_delay: Duration::from_millis(config.processing.retry_delay_ms),
            max_backoff: Duration::from_secs(config.processing.max_backoff_secs),
            page_size: config.raindrop.page_size.max(1),
            max_pages: config.raindrop.max_pages,
            limits: SanitizeLimits::from(config),
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// The two API secrets, validated for shape before any client is built.
#[derive(Clone)]
pub struct Credentials {
    raindrop_token: String,
    claude_api_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("raindrop_token", &"[REDACTED]")
            .field("claude_api_key", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Validate raw secrets, reporting every problem at once.
    pub fn new(raindrop_token: &str, claude_api_key: &str) -> Result<Self> {
        Self::check(
            raindrop_token.trim(),
            claude_api_key.trim(),
            "RAINDROP_TOKEN",
            "CLAUDE_API_KEY",
        )
    }

    fn check(token: &str, key: &str, token_name: &str, key_name: &str) -> Result<Self> {
        let mut errors = Vec::new();

        if token.is_empty() {
            errors.push(format!("{token_name} environment variable not set"));
        } else if token.chars().count() < MIN_STORE_TOKEN_LEN {
            errors.push(format!("{token_name} appears to be invalid (too short)"));
        }

        if key.is_empty() {
            errors.push(format!("{key_name} environment variable not set"));
        } else if !key.starts_with(MODEL_KEY_PREFIX) {
            errors.push(format!(
                "{key_name} doesn't match expected format (should start with '{MODEL_KEY_PREFIX}')"
            ));
        }

        if !errors.is_empty() {
            return Err(TaggerError::config(errors.join("; ")));
        }

        Ok(Self {
            raindrop_token: token.to_string(),
            claude_api_key: key.to_string(),
        })
    }

    pub fn raindrop_token(&self) -> &str {
        &self.raindrop_token
    }

    pub fn claude_api_key(&self) -> &str {
        &self.claude_api_key
    }
}

/// Read both secrets from the environment variables named in `config`.
pub fn resolve_credentials(config: &AppConfig) -> Result<Credentials> {
    let token_name = &config.raindrop.token_env;
    let key_name = &config.claude.api_key_env;
    let token = std::env::var(token_name).unwrap_or_default();
    let key = std::env::var(key_name).unwrap_or_default();
    Credentials::check(token.trim(), key.trim(), token_name, key_name)
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.autotagger/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| TaggerError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.autotagger/autotagger.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| TaggerError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| TaggerError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TaggerError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| TaggerError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TaggerError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
