//! Typed errors at each library boundary, composed into `anyhow::Error`
//! at the binary boundary (main.rs, server.rs handlers) the way the
//! rest of this crate's acquisition layer already does.

use thiserror::Error;

/// Failures raised while trying to pull a price out of a page.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("transient fetch failure for {url}: {reason}")]
    FetchTransient { url: String, reason: String },

    #[error("permanent fetch failure for {url}: {reason}")]
    FetchPermanent { url: String, reason: String },

    #[error("no candidate selector produced a parseable price")]
    NoCandidate,

    #[error("extracted price {price} failed validation: {reason}")]
    ValidationFailed { price: String, reason: String },

    #[error("renderer unavailable: {0}")]
    RendererUnavailable(String),

    #[error("LLM extraction failed: {0}")]
    LlmFailure(String),

    #[error("LLM budget for this batch is exhausted")]
    LlmBudgetExhausted,

    #[error("extraction cancelled: {0}")]
    Cancelled(String),
}

/// Failures raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("machine not found: {0}")]
    MachineNotFound(String),

    #[error("batch not found: {0}")]
    BatchNotFound(String),

    #[error("price history row not found: {0}")]
    HistoryNotFound(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failures raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level error type for binary- and HTTP-boundary code. Library
/// code returns the specific error types above; this is where they get
/// folded into one thing a CLI or an axum handler can report.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
