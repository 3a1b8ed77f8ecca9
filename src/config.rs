use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PipelineError;
use crate::retry::RetryPolicy;
use crate::window;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub window: WindowConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub summarize: SummarizeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(default)]
    pub publish: Option<PublishConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WindowConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_anchor_hour")]
    pub anchor_hour: u32,
    #[serde(default)]
    pub anchor_minute: u32,
    #[serde(default = "default_anchor_hour")]
    pub run_at_hour: u32,
    #[serde(default = "default_run_at_minute")]
    pub run_at_minute: u32,
}

fn default_timezone() -> String {
    "Europe/Riga".to_string()
}
fn default_anchor_hour() -> u32 {
    13
}
fn default_run_at_minute() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Flag exact duplicates during summarize and reuse the canonical
    /// item's summary for them.
    #[serde(default = "default_true")]
    pub mark_exact_duplicates: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            top_k: default_top_k(),
            mark_exact_duplicates: true,
        }
    }
}

fn default_threshold() -> f32 {
    0.88
}
fn default_top_k() -> usize {
    80
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            base_url: default_base_url(),
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarizeConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            base_url: default_base_url(),
            timeout_secs: 30,
        }
    }
}

impl SummarizeConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: u32,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// How many times a run waits for a held window lock before giving up.
    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            backoff_coefficient: default_backoff_coefficient(),
            max_interval_ms: default_max_interval_ms(),
            lock_attempts: default_lock_attempts(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::build(
            self.backoff_coefficient,
            Duration::from_millis(self.initial_interval_ms),
        )
        .max_attempts(self.max_attempts)
        .maximum_interval(Duration::from_millis(self.max_interval_ms))
        .provide()
    }

    pub fn lock_policy(&self) -> RetryPolicy {
        RetryPolicy::build(
            self.backoff_coefficient,
            Duration::from_millis(self.initial_interval_ms),
        )
        .max_attempts(self.lock_attempts)
        .maximum_interval(Duration::from_millis(self.max_interval_ms))
        .provide()
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_interval_ms() -> u64 {
    500
}
fn default_backoff_coefficient() -> u32 {
    2
}
fn default_max_interval_ms() -> u64 {
    10_000
}
fn default_lock_attempts() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    #[serde(default = "default_lease_secs")]
    pub lease_secs: i64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_secs: default_lease_secs(),
        }
    }
}

fn default_lease_secs() -> i64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.jsonl".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublishConfig {
    pub outbox: PathBuf,
}

impl Config {
    /// Check every setting the pipeline depends on.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let w = &self.window;
        window::parse_timezone(&w.timezone)?;
        for (name, hour) in [("window.anchor_hour", w.anchor_hour), ("window.run_at_hour", w.run_at_hour)] {
            if hour > 23 {
                return Err(PipelineError::Config(format!("{name} must be in range 0..23")));
            }
        }
        for (name, minute) in [
            ("window.anchor_minute", w.anchor_minute),
            ("window.run_at_minute", w.run_at_minute),
        ] {
            if minute > 59 {
                return Err(PipelineError::Config(format!("{name} must be in range 0..59")));
            }
        }

        if !(self.dedup.threshold > 0.0 && self.dedup.threshold <= 1.0) {
            return Err(PipelineError::Config(
                "dedup.threshold must be in (0.0, 1.0]".to_string(),
            ));
        }
        if self.dedup.top_k < 1 {
            return Err(PipelineError::Config("dedup.top_k must be >= 1".to_string()));
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" => {}
            other => {
                return Err(PipelineError::Config(format!(
                    "Unknown embedding provider: '{other}'. Must be disabled or openai."
                )))
            }
        }
        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                return Err(PipelineError::Config(format!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                )));
            }
            if self.embedding.model.is_none() {
                return Err(PipelineError::Config(format!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                )));
            }
        }

        match self.summarize.provider.as_str() {
            "disabled" | "openai" => {}
            other => {
                return Err(PipelineError::Config(format!(
                    "Unknown summarize provider: '{other}'. Must be disabled or openai."
                )))
            }
        }
        if self.summarize.is_enabled() && self.summarize.model.is_none() {
            return Err(PipelineError::Config(format!(
                "summarize.model must be specified when provider is '{}'",
                self.summarize.provider
            )));
        }

        if self.retry.max_attempts < 1 {
            return Err(PipelineError::Config("retry.max_attempts must be >= 1".to_string()));
        }
        if self.retry.lock_attempts < 1 {
            return Err(PipelineError::Config("retry.lock_attempts must be >= 1".to_string()));
        }
        if self.lock.lease_secs < 1 {
            return Err(PipelineError::Config("lock.lease_secs must be >= 1".to_string()));
        }

        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}
