//! File-backed content source.
//!
//! Reads raw items from JSON Lines files under a root directory. Each line is
//! one [`RawItem`]:
//!
//! ```json
//! {"id": "news/1042", "channel": "news", "text": "...", "has_media": false,
//!  "posted_at": "2026-02-07T09:00:00Z", "permalink": "https://t.me/news/1042"}
//! ```
//!
//! Whatever process exports the feed drops files here; the source only
//! filters by window.

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::error::{PipelineError, ProviderError};
use crate::models::{RawItem, Window};
use crate::traits::ContentSource;

pub struct JsonlSource {
    root: PathBuf,
    include_set: GlobSet,
}

impl JsonlSource {
    pub fn new(config: &SourceConfig) -> Result<Self, PipelineError> {
        let include_set = build_globset(&config.include_globs)?;
        Ok(Self {
            root: config.root.clone(),
            include_set,
        })
    }

    fn files(&self) -> Result<Vec<PathBuf>, ProviderError> {
        if !self.root.exists() {
            return Err(ProviderError::Permanent(format!(
                "source root does not exist: {}",
                self.root.display()
            )));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| ProviderError::Transient(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            if self.include_set.is_match(relative.to_string_lossy().as_ref()) {
                files.push(path.to_path_buf());
            }
        }

        // Sort for deterministic ordering
        files.sort();
        Ok(files)
    }
}

fn read_items(path: &Path) -> Result<Vec<RawItem>, ProviderError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ProviderError::Transient(format!("{}: {}", path.display(), e)))?;

    let mut items = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RawItem>(line) {
            Ok(item) => items.push(item),
            Err(e) => warn!(
                file = %path.display(),
                line = line_no + 1,
                error = %e,
                "skipping malformed source line"
            ),
        }
    }
    Ok(items)
}

#[async_trait]
impl ContentSource for JsonlSource {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn fetch(&self, window: &Window) -> Result<Vec<RawItem>, ProviderError> {
        let mut items = Vec::new();
        for path in self.files()? {
            let from_file: Vec<RawItem> = read_items(&path)?
                .into_iter()
                .filter(|item| window.contains(item.posted_at))
                .collect();
            debug!(file = %path.display(), items = from_file.len(), "read source file");
            items.extend(from_file);
        }
        Ok(items)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, PipelineError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| PipelineError::Config(format!("invalid source glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| PipelineError::Config(format!("invalid source globs: {e}")))
}
