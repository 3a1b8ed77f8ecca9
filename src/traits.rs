//! Collaborator traits.
//!
//! The pipeline core never talks to the network or the filesystem directly.
//! Everything it consumes or produces goes through one of these traits:
//!
//! ```text
//! ┌───────────────┐   ┌──────────────────────┐   ┌────────────┐
//! │ ContentSource │──▶│                      │──▶│ Publisher  │
//! └───────────────┘   │  PipelineOrchestrator │   └────────────┘
//! ┌───────────────┐   │                      │
//! │ Summarization │◀─▶│  ingest → summarize  │
//! │ Embedding     │   │  → embed → dedup     │
//! └───────────────┘   │  → publish           │
//!                     └──────────────────────┘
//! ```
//!
//! Built-in implementations live in [`crate::source`], [`crate::summarize`],
//! [`crate::embedding`] and [`crate::publish`]. Tests provide their own.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use window_digest::error::ProviderError;
//! use window_digest::models::{RawItem, Window};
//! use window_digest::traits::ContentSource;
//!
//! pub struct EmptySource;
//!
//! #[async_trait]
//! impl ContentSource for EmptySource {
//!     fn name(&self) -> &str { "empty" }
//!
//!     async fn fetch(&self, _window: &Window) -> Result<Vec<RawItem>, ProviderError> {
//!         Ok(vec![])
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::models::{DigestContent, RawItem, Summary, Window};

/// Produces the raw items posted during a window.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Short label used in logs.
    fn name(&self) -> &str;

    /// Fetch items for `window`. May return items outside the window (they
    /// are dropped) or no items at all.
    async fn fetch(&self, window: &Window) -> Result<Vec<RawItem>, ProviderError>;
}

/// Turns item text into a short summary with tags and an importance score.
#[async_trait]
pub trait SummarizationProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn summarize(&self, text: &str) -> Result<Summary, ProviderError>;
}

/// Embeds one text per call.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality. Vectors of any other
    /// length are rejected before they are stored.
    fn dims(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// Delivers a finished digest.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    /// Publish `content` for `window` and return the ids of the messages
    /// that were sent.
    async fn publish(&self, window: &Window, content: &DigestContent) -> Result<Vec<String>, ProviderError>;
}
