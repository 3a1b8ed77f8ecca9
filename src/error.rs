//! Error taxonomy for the digest pipeline.
//!
//! [`PipelineError`] is what the orchestrator and stores return. Collaborator
//! calls fail with a [`ProviderError`], which the retry policy inspects to
//! decide whether another attempt is worthwhile.

use thiserror::Error;

use crate::models::PublishReceipt;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure reported by an external collaborator (source, summarizer,
/// embedder, publisher).
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Timeout, rate limit or server error. Safe to retry.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Anything else. Retrying will not help.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            ProviderError::Transient(err.to_string())
        } else {
            ProviderError::Permanent(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid window parameters or missing settings. Raised before any
    /// stage runs.
    #[error("config error: {0}")]
    Config(String),

    /// A transient collaborator failure that outlived the retry budget.
    #[error("transient provider error after {attempts} attempts: {message}")]
    TransientProvider { attempts: u32, message: String },

    #[error("permanent provider error: {0}")]
    PermanentProvider(String),

    /// Malformed collaborator output for a single item.
    #[error("data integrity error for item {item_id}: {reason}")]
    DataIntegrity { item_id: String, reason: String },

    /// Publish was requested for a window that already has a publish record.
    #[error("window {window_id} already published at {}", receipt.published_at)]
    AlreadyPublished {
        window_id: String,
        receipt: PublishReceipt,
    },

    /// Another run holds the window lock.
    #[error("window {window_id} is locked by {holder}")]
    LockContention { window_id: String, holder: String },

    /// A stage was requested before the stage it depends on completed.
    #[error("stage {stage} requires {required} to be completed first (window is {current})")]
    StageOrder {
        stage: String,
        required: String,
        current: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Build the error a stage surfaces once retries for `err` are used up
    /// (or were never applicable).
    pub fn from_provider(err: ProviderError, attempts: u32) -> Self {
        match err {
            ProviderError::Transient(message) => {
                PipelineError::TransientProvider { attempts, message }
            }
            ProviderError::Permanent(message) => PipelineError::PermanentProvider(message),
        }
    }
}
