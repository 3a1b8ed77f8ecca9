//! Summarization provider backed by an OpenAI-compatible chat endpoint.
//!
//! The model is asked for a JSON object `{"summary", "tags", "importance"}`.
//! How importance is judged is entirely up to the prompt and the model; the
//! pipeline only stores what comes back.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SummarizeConfig;
use crate::error::{PipelineError, ProviderError};
use crate::models::Summary;
use crate::traits::SummarizationProvider;

const SYSTEM_PROMPT: &str = "You summarize a single social-feed post for a daily digest. \
Reply with a JSON object only: {\"summary\": string (one or two sentences), \
\"tags\": array of up to 5 short lowercase strings, \
\"importance\": integer from 1 (trivial) to 5 (critical)}.";

pub struct OpenAiSummarizer {
    model: String,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiSummarizer {
    pub fn new(config: &SummarizeConfig) -> Result<Self, PipelineError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| PipelineError::Config("summarize.model required for OpenAI provider".into()))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| PipelineError::Config("OPENAI_API_KEY environment variable not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            model,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl SummarizationProvider for OpenAiSummarizer {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn summarize(&self, text: &str) -> Result<Summary, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.2,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": text},
            ],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            let message = format!("chat API error {}: {}", status, body_text);
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(ProviderError::Transient(message));
            }
            return Err(ProviderError::Permanent(message));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("invalid chat response: {e}")))?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<Summary, ProviderError> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| ProviderError::Permanent("invalid chat response: missing message content".into()))?;

    // Models sometimes wrap the object in a fenced block.
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let mut summary: Summary = serde_json::from_str(trimmed)
        .map_err(|e| ProviderError::Permanent(format!("summary is not valid JSON: {e}")))?;
    summary.importance = summary.importance.clamp(1, 5);
    summary.tags.retain(|t| !t.trim().is_empty());
    Ok(summary)
}

/// Create the configured provider, or `None` when summarization is disabled.
pub fn create_provider(config: &SummarizeConfig) -> Result<Option<Arc<dyn SummarizationProvider>>, PipelineError> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAiSummarizer::new(config)?))),
        other => Err(PipelineError::Config(format!("Unknown summarize provider: {other}"))),
    }
}
