//! Digest assembly and the outbox publisher.
//!
//! [`assemble_digest`] turns a window's clusters into a [`DigestContent`]:
//! one entry per cluster, in cluster order, carrying the representative's
//! summary (or its text when no summary exists) and the permalinks of every
//! member. Items that were never clustered are listed separately.
//!
//! [`OutboxPublisher`] writes the digest as JSON into a directory, where a
//! delivery process picks it up.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

use crate::config::PublishConfig;
use crate::error::ProviderError;
use crate::models::{DedupCluster, DigestContent, DigestEntry, Item, Summary, Window};
use crate::traits::Publisher;

fn entry_for(item: &Item, summary: Option<&Summary>, members: &[&Item]) -> DigestEntry {
    let text = match summary {
        Some(s) if !s.summary.trim().is_empty() => s.summary.clone(),
        _ => item.normalized_text.clone(),
    };
    DigestEntry {
        item_id: item.id.clone(),
        channel: item.channel.clone(),
        text,
        tags: summary.map(|s| s.tags.clone()).unwrap_or_default(),
        importance: summary.map(|s| s.importance),
        permalinks: members.iter().filter_map(|m| m.permalink.clone()).collect(),
        member_count: members.len(),
    }
}

/// Build the digest for `window` from its items, clusters and summaries.
///
/// Items flagged as exact duplicates are left out of the unclustered list;
/// their canonical item stands for them.
pub fn assemble_digest(
    window: &Window,
    items: &[Item],
    clusters: &[DedupCluster],
    summaries: &HashMap<String, Summary>,
) -> DigestContent {
    let by_id: HashMap<&str, &Item> = items.iter().map(|i| (i.id.as_str(), i)).collect();
    let mut clustered: HashSet<&str> = HashSet::new();

    let mut entries = Vec::with_capacity(clusters.len());
    for cluster in clusters {
        let members: Vec<&Item> = cluster
            .members
            .iter()
            .filter_map(|m| by_id.get(m.item_id.as_str()).copied())
            .collect();
        clustered.extend(cluster.members.iter().map(|m| m.item_id.as_str()));

        if let Some(rep) = by_id.get(cluster.representative_item_id.as_str()) {
            entries.push(entry_for(rep, summaries.get(&rep.id), &members));
        }
    }

    let unclustered = items
        .iter()
        .filter(|i| !clustered.contains(i.id.as_str()) && i.duplicate_of.is_none())
        .filter(|i| !i.normalized_text.is_empty() || i.permalink.is_some())
        .map(|i| entry_for(i, summaries.get(&i.id), &[i]))
        .collect();

    DigestContent {
        window_id: window.id.clone(),
        start: window.start,
        end: window.end,
        timezone: window.timezone.clone(),
        entries,
        unclustered,
    }
}

/// Publisher that writes each digest into an outbox directory.
pub struct OutboxPublisher {
    outbox: PathBuf,
}

impl OutboxPublisher {
    pub fn new(config: &PublishConfig) -> Self {
        Self {
            outbox: config.outbox.clone(),
        }
    }
}

#[async_trait]
impl Publisher for OutboxPublisher {
    fn name(&self) -> &str {
        "outbox"
    }

    async fn publish(&self, window: &Window, content: &DigestContent) -> Result<Vec<String>, ProviderError> {
        tokio::fs::create_dir_all(&self.outbox)
            .await
            .map_err(|e| ProviderError::Transient(format!("create outbox: {e}")))?;

        let message_id = Uuid::new_v4().to_string();
        let path = self.outbox.join(format!("{}-{}.json", window.id, message_id));
        let body = serde_json::to_vec_pretty(content)
            .map_err(|e| ProviderError::Permanent(format!("serialize digest: {e}")))?;

        tokio::fs::write(&path, body)
            .await
            .map_err(|e| ProviderError::Transient(format!("write {}: {}", path.display(), e)))?;

        info!(window_id = %window.id, path = %path.display(), "digest written to outbox");
        Ok(vec![message_id])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ClusterMember;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn window() -> Window {
        let start = Utc.with_ymd_and_hms(2026, 2, 6, 11, 0, 0).unwrap();
        let end = start + Duration::days(1);
        Window {
            id: Window::id_for(start, end),
            start,
            end,
            timezone: "Europe/Riga".to_string(),
        }
    }

    fn item(id: &str, text: &str) -> Item {
        Item {
            id: id.to_string(),
            window_id: window().id,
            channel: "news".to_string(),
            content_hash: format!("hash-{id}"),
            normalized_text: text.to_string(),
            has_media: false,
            posted_at: window().start + Duration::hours(1),
            permalink: Some(format!("https://t.me/news/{id}")),
            embedding: None,
            duplicate_of: None,
        }
    }

    #[test]
    fn test_assemble_uses_summary_and_member_links() {
        let items = vec![item("a", "text a"), item("b", "text b"), item("c", "text c")];
        let cluster = DedupCluster {
            id: "c1".to_string(),
            window_id: window().id,
            representative_item_id: "a".to_string(),
            members: vec![
                ClusterMember { item_id: "a".to_string(), similarity: 1.0 },
                ClusterMember { item_id: "b".to_string(), similarity: 0.93 },
            ],
            created_at: Utc::now(),
        };
        let mut summaries = HashMap::new();
        summaries.insert(
            "a".to_string(),
            Summary { summary: "Summary of a".to_string(), tags: vec!["t".to_string()], importance: 3 },
        );

        let digest = assemble_digest(&window(), &items, &[cluster], &summaries);
        assert_eq!(digest.entries.len(), 1);
        assert_eq!(digest.entries[0].text, "Summary of a");
        assert_eq!(digest.entries[0].member_count, 2);
        assert_eq!(digest.entries[0].permalinks.len(), 2);
        assert_eq!(digest.unclustered.len(), 1);
        assert_eq!(digest.unclustered[0].text, "text c");
    }

    #[test]
    fn test_exact_duplicates_not_listed_twice() {
        let mut dup = item("b", "same");
        dup.duplicate_of = Some("a".to_string());
        let items = vec![item("a", "same"), dup];
        let digest = assemble_digest(&window(), &items, &[], &HashMap::new());
        assert_eq!(digest.unclustered.len(), 1);
        assert_eq!(digest.unclustered[0].item_id, "a");
    }

    #[tokio::test]
    async fn test_outbox_writes_file() {
        let tmp = TempDir::new().unwrap();
        let publisher = OutboxPublisher::new(&PublishConfig { outbox: tmp.path().join("outbox") });
        let digest = assemble_digest(&window(), &[item("a", "hello")], &[], &HashMap::new());

        let ids = publisher.publish(&window(), &digest).await.unwrap();
        assert_eq!(ids.len(), 1);

        let written: Vec<_> = std::fs::read_dir(tmp.path().join("outbox")).unwrap().collect();
        assert_eq!(written.len(), 1);
        let body = std::fs::read_to_string(written[0].as_ref().unwrap().path()).unwrap();
        assert!(body.contains("\"hello\""));
    }
}
