//! Core data models used throughout the digest pipeline.
//!
//! These types represent the windows, items, clusters and publish records
//! that flow between the stages.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Half-open time range `[start, end)` for one digest cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub timezone: String,
}

impl Window {
    /// Identity of the window covering `[start, end)`. Recomputing the same
    /// calendar window always yields the same id.
    pub fn id_for(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
        format!(
            "{}_{}",
            start.format("%Y%m%dT%H%M%SZ"),
            end.format("%Y%m%dT%H%M%SZ")
        )
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

/// Persisted progress of a window through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Pending,
    Ingested,
    Summarized,
    Embedded,
    Deduped,
    Published,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Ingested => "ingested",
            Stage::Summarized => "summarized",
            Stage::Embedded => "embedded",
            Stage::Deduped => "deduped",
            Stage::Published => "published",
            Stage::Failed => "failed",
        }
    }

    /// Position along the forward chain. `Failed` sits outside it.
    pub fn rank(&self) -> Option<u8> {
        match self {
            Stage::Pending => Some(0),
            Stage::Ingested => Some(1),
            Stage::Summarized => Some(2),
            Stage::Embedded => Some(3),
            Stage::Deduped => Some(4),
            Stage::Published => Some(5),
            Stage::Failed => None,
        }
    }

    /// True when `self` is at or past `other` on the forward chain.
    pub fn reached(&self, other: Stage) -> bool {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => a >= b,
            _ => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Stage::Pending),
            "ingested" => Ok(Stage::Ingested),
            "summarized" => Ok(Stage::Summarized),
            "embedded" => Ok(Stage::Embedded),
            "deduped" => Ok(Stage::Deduped),
            "published" => Ok(Stage::Published),
            "failed" => Ok(Stage::Failed),
            other => Err(PipelineError::Config(format!("unknown stage: '{other}'"))),
        }
    }
}

/// A unit of work the orchestrator can execute for a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    Ingest,
    Summarize,
    Embed,
    Dedup,
    Publish,
}

impl Step {
    /// Canonical execution order.
    pub const ALL: [Step; 5] = [
        Step::Ingest,
        Step::Summarize,
        Step::Embed,
        Step::Dedup,
        Step::Publish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Ingest => "ingest",
            Step::Summarize => "summarize",
            Step::Embed => "embed",
            Step::Dedup => "dedup",
            Step::Publish => "publish",
        }
    }

    /// Stage recorded once this step commits.
    pub fn target(&self) -> Stage {
        match self {
            Step::Ingest => Stage::Ingested,
            Step::Summarize => Stage::Summarized,
            Step::Embed => Stage::Embedded,
            Step::Dedup => Stage::Deduped,
            Step::Publish => Stage::Published,
        }
    }

    /// Stage that must already be committed before this step may run.
    pub fn requires(&self) -> Stage {
        match self {
            Step::Ingest => Stage::Pending,
            Step::Summarize => Stage::Ingested,
            Step::Embed => Stage::Summarized,
            Step::Dedup => Stage::Embedded,
            Step::Publish => Stage::Deduped,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ingest" => Ok(Step::Ingest),
            "summarize" => Ok(Step::Summarize),
            "embed" => Ok(Step::Embed),
            "dedup" => Ok(Step::Dedup),
            "publish" => Ok(Step::Publish),
            other => Err(PipelineError::Config(format!(
                "unknown stage '{other}'. Must be ingest, summarize, embed, dedup, or publish."
            ))),
        }
    }
}

/// One status row per window.
///
/// `stage` is the current state and may be [`Stage::Failed`];
/// `completed` is the last stage whose work was committed, which is where a
/// retried run resumes from.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowStatus {
    pub window_id: String,
    pub stage: Stage,
    pub completed: Stage,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Item as delivered by a content source, before normalization.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RawItem {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub has_media: bool,
    pub posted_at: DateTime<Utc>,
    #[serde(default)]
    pub permalink: Option<String>,
    pub channel: String,
}

/// Normalized item stored for a window.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: String,
    pub window_id: String,
    pub channel: String,
    pub content_hash: String,
    pub normalized_text: String,
    pub has_media: bool,
    pub posted_at: DateTime<Utc>,
    pub permalink: Option<String>,
    /// Absent until the embed stage stores a validated vector.
    pub embedding: Option<Vec<f32>>,
    /// Canonical item of the exact-duplicate group, when this item was
    /// flagged as a duplicate.
    pub duplicate_of: Option<String>,
}

/// Output of a summarization provider.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct Summary {
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub importance: i64,
}

/// A member of a semantic cluster with its similarity to the representative.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMember {
    pub item_id: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupCluster {
    pub id: String,
    pub window_id: String,
    pub representative_item_id: String,
    /// Members in processing order; the representative comes first.
    pub members: Vec<ClusterMember>,
    pub created_at: DateTime<Utc>,
}

impl DedupCluster {
    pub fn member_item_ids(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.item_id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Items sharing a content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExactDuplicateGroup {
    pub content_hash: String,
    /// Ordered by `posted_at`, then id. The first entry is canonical.
    pub item_ids: Vec<String>,
    pub channel_set: BTreeSet<String>,
}

/// Record of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub window_id: String,
    pub message_ids: Vec<String>,
    pub published_at: DateTime<Utc>,
}

/// What gets handed to a publisher. Formatting is the publisher's concern.
#[derive(Debug, Clone, Serialize)]
pub struct DigestContent {
    pub window_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub timezone: String,
    pub entries: Vec<DigestEntry>,
    pub unclustered: Vec<DigestEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DigestEntry {
    pub item_id: String,
    pub channel: String,
    pub text: String,
    pub tags: Vec<String>,
    pub importance: Option<i64>,
    pub permalinks: Vec<String>,
    pub member_count: usize,
}
