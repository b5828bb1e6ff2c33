//! Error types for the auto-tagger.
//!
//! Library crates use [`TaggerError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::Service;

/// Top-level error type for all auto-tagger operations.
#[derive(Debug, thiserror::Error)]
pub enum TaggerError {
    /// Configuration loading or validation error (missing credentials, bad file).
    #[error("config error: {message}")]
    Config { message: String },

    /// The remote service asked us to slow down (HTTP 429).
    #[error("{service} rate limited the request")]
    RateLimited {
        service: Service,
        /// Server-provided wait hint, if any.
        retry_after: Option<Duration>,
    },

    /// The remote service rejected the request (4xx). Never retried.
    #[error("{service} rejected the request: HTTP {status}: {message}")]
    Rejected {
        service: Service,
        status: u16,
        message: String,
    },

    /// The remote service failed (5xx) or answered with a status outside
    /// 4xx that we cannot use. Retried up to the attempt cap.
    #[error("{service} returned HTTP {status}: {message}")]
    Upstream {
        service: Service,
        status: u16,
        message: String,
    },

    /// Transport failure (connect, timeout, body read).
    #[error("{service} network error: {message}")]
    Network { service: Service, message: String },

    /// A response body could not be decoded.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TaggerError>;

/// How the pipeline should react to a failed external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Back off (honouring the optional hint) and retry.
    Throttled(Option<Duration>),
    /// Wait the fixed retry delay and retry.
    Transient,
    /// Give up on this call immediately.
    Terminal,
}

impl TaggerError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a transport error for `service`.
    pub fn network(service: Service, msg: impl Into<String>) -> Self {
        Self::Network {
            service,
            message: msg.into(),
        }
    }

    /// Map an unsuccessful HTTP status to the matching variant.
    ///
    /// 429 becomes [`TaggerError::RateLimited`] and the remaining 4xx a
    /// terminal [`TaggerError::Rejected`]. Anything else (5xx including
    /// Anthropic's 529 "overloaded", stray 1xx or 3xx) is a transient
    /// [`TaggerError::Upstream`].
    pub fn from_status(
        service: Service,
        status: u16,
        retry_after: Option<Duration>,
        message: impl Into<String>,
    ) -> Self {
        match status {
            429 => Self::RateLimited {
                service,
                retry_after,
            },
            400..=499 => Self::Rejected {
                service,
                status,
                message: message.into(),
            },
            _ => Self::Upstream {
                service,
                status,
                message: message.into(),
            },
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify this error for the retry loops.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::RateLimited { retry_after, .. } => FailureClass::Throttled(*retry_after),
            Self::Upstream { .. } | Self::Network { .. } => FailureClass::Transient,
            Self::Config { .. }
            | Self::Rejected { .. }
            | Self::Parse { .. }
            | Self::Validation { .. }
            | Self::Io { .. } => FailureClass::Terminal,
        }
    }
}
