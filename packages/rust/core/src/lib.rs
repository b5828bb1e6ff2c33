//! Core pipeline orchestration for the auto-tagger.
//!
//! This crate ties the store client, the model client and the sanitizer
//! together into one tagging run ([`Pipeline`]).

pub mod pipeline;
pub mod prompt;
pub mod rate_limit;
pub mod response;

pub use pipeline::{Pipeline, RunOutcome, RunReporter, RunStatus, SilentReporter, Stage};
pub use prompt::{PromptRules, build_prompt};
pub use rate_limit::RateLimiter;
pub use response::parse_response;
