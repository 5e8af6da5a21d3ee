//! Shared error type used across all MIRA crates.
//!
//! Error kinds follow the propagation policy: validation and not-found
//! errors surface to HTTP as canonical envelopes; context overflow is
//! handled internally by tiered remediation and only becomes fatal after
//! the tier ceiling; upstream transients trip failover where configured.

/// Which provider raised a context overflow.
pub const PROVIDER_ANTHROPIC: &str = "anthropic";
pub const PROVIDER_GENERIC: &str = "generic";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Request exceeds the model context window. Raised both proactively
    /// (pre-flight estimation) and reactively (API 400 about tokens).
    #[error("context overflow: ~{estimated_tokens} tokens vs {context_window} limit ({provider})")]
    ContextOverflow {
        estimated_tokens: u64,
        context_window: u64,
        provider: &'static str,
    },

    /// 5xx / connection failure from an upstream service.
    #[error("upstream {service}: {message}")]
    Upstream { service: String, message: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("tool '{tool}': {message}")]
    Tool { tool: String, message: String },

    #[error("infrastructure: {0}")]
    Infrastructure(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors that should trip the provider failover flag.
    pub fn trips_failover(&self) -> bool {
        matches!(self, Error::Upstream { .. } | Error::Timeout(_))
    }

    /// Classify a 400-level provider message as a context overflow.
    pub fn is_overflow_message(message: &str) -> bool {
        let lower = message.to_lowercase();
        lower.contains("prompt is too long")
            || lower.contains("context")
            || lower.contains("too many tokens")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
