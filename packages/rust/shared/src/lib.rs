//! Shared types, error model, and configuration for the auto-tagger.
//!
//! This crate is the foundation depended on by all other auto-tagger crates.
//! It provides:
//! - [`TaggerError`]: the unified error type and its [`FailureClass`]
//! - Domain types ([`Record`], [`LabelSet`], [`RunStatistics`], [`Service`])
//! - Configuration ([`AppConfig`], [`RunConfig`], [`Credentials`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ClaudeConfig, Credentials, LimitsConfig, ProcessingConfig, RaindropConfig,
    RunConfig, SanitizeLimits, config_dir, config_file_path, init_config, load_config,
    load_config_from, resolve_credentials,
};
pub use error::{FailureClass, Result, TaggerError};
pub use types::{LabelSet, Record, RunId, RunStatistics, Service};
