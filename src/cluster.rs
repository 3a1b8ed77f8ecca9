//! Embedding-based near-duplicate clustering.
//!
//! Single greedy pass over the window's items in `(posted_at, id)` order.
//! Each item joins the cluster of its most similar existing representative
//! if that similarity reaches the threshold, otherwise it becomes the
//! representative of a new cluster. Processing order decides
//! representatives, so it is part of the result, not an optimization.
//!
//! Exact duplicates are folded in afterwards: a group member left without a
//! cluster (typically for lack of an embedding) joins the cluster of an
//! earlier group member, or the group forms a cluster of its own.
//!
//! A rerun always recomputes the whole set from the stored embeddings and
//! replaces the previous clusters in one transaction. Raising the threshold
//! between runs can therefore split clusters that were merged before.

use chrono::Utc;
use serde::Serialize;
use sqlx::SqliteConnection;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::error::{PipelineError, Result};
use crate::models::{ClusterMember, DedupCluster, ExactDuplicateGroup, Item};
use crate::store;

/// Counters reported by a clustering pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DedupStats {
    pub clusters_created: usize,
    pub items_assigned: usize,
    /// Items left unclustered because they have no embedding.
    pub skipped_no_embedding: usize,
    pub largest_cluster: usize,
    pub average_cluster_size: f64,
}

pub struct SemanticClusterer {
    threshold: f32,
    top_k: usize,
}

struct Representative<'a> {
    cluster: usize,
    embedding: &'a [f32],
}

impl SemanticClusterer {
    pub fn new(threshold: f32, top_k: usize) -> Result<Self> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(PipelineError::Config(format!(
                "dedup threshold must be in (0, 1], got {threshold}"
            )));
        }
        if top_k == 0 {
            return Err(PipelineError::Config("dedup top_k must be at least 1".to_string()));
        }
        Ok(Self { threshold, top_k })
    }

    /// Compute clusters without touching storage.
    pub fn build(&self, window_id: &str, items: &[Item]) -> (Vec<DedupCluster>, DedupStats) {
        self.build_with_exact(window_id, items, &[])
    }

    /// Like [`build`](Self::build), then fold `groups` of exact duplicates
    /// into the result so that no group is split across the digest.
    pub fn build_with_exact(
        &self,
        window_id: &str,
        items: &[Item],
        groups: &[ExactDuplicateGroup],
    ) -> (Vec<DedupCluster>, DedupStats) {
        let mut candidates: Vec<&Item> = items.iter().filter(|i| i.embedding.is_some()).collect();
        candidates.sort_by(|a, b| a.posted_at.cmp(&b.posted_at).then_with(|| a.id.cmp(&b.id)));

        let created_at = Utc::now();
        let mut clusters: Vec<DedupCluster> = Vec::new();
        let mut representatives: Vec<Representative> = Vec::new();

        for item in candidates {
            let Some(embedding) = item.embedding.as_deref() else {
                continue;
            };

            match self.best_match(&representatives, embedding) {
                Some((cluster, similarity)) if similarity >= self.threshold => {
                    clusters[cluster].members.push(ClusterMember {
                        item_id: item.id.clone(),
                        similarity,
                    });
                }
                _ => {
                    representatives.push(Representative {
                        cluster: clusters.len(),
                        embedding,
                    });
                    clusters.push(DedupCluster {
                        id: Uuid::new_v4().to_string(),
                        window_id: window_id.to_string(),
                        representative_item_id: item.id.clone(),
                        members: vec![ClusterMember {
                            item_id: item.id.clone(),
                            similarity: 1.0,
                        }],
                        created_at,
                    });
                }
            }
        }

        fold_exact_groups(window_id, &mut clusters, groups);

        let assigned: usize = clusters.iter().map(DedupCluster::len).sum();
        let placed: HashSet<&str> =
            clusters.iter().flat_map(|c| c.members.iter().map(|m| m.item_id.as_str())).collect();
        let stats = DedupStats {
            clusters_created: clusters.len(),
            items_assigned: assigned,
            skipped_no_embedding: items
                .iter()
                .filter(|i| i.embedding.is_none() && !placed.contains(i.id.as_str()))
                .count(),
            largest_cluster: clusters.iter().map(DedupCluster::len).max().unwrap_or(0),
            average_cluster_size: if clusters.is_empty() {
                0.0
            } else {
                assigned as f64 / clusters.len() as f64
            },
        };

        (clusters, stats)
    }

    /// Most similar representative among the `top_k` nearest. Equal
    /// similarities resolve to the earlier cluster.
    fn best_match(&self, representatives: &[Representative], embedding: &[f32]) -> Option<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = representatives
            .iter()
            .map(|r| (r.cluster, cosine_similarity(r.embedding, embedding)))
            .collect();

        scored.sort_by(|a, b| match b.1.total_cmp(&a.1) {
            Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });
        scored.truncate(self.top_k);
        scored.into_iter().next()
    }

    /// Compute the clusters and replace the window's stored set with them.
    /// The caller owns the transaction.
    pub async fn cluster(
        &self,
        conn: &mut SqliteConnection,
        window_id: &str,
        items: &[Item],
        groups: &[ExactDuplicateGroup],
    ) -> Result<(Vec<DedupCluster>, DedupStats)> {
        let (clusters, stats) = self.build_with_exact(window_id, items, groups);
        store::replace_clusters(conn, window_id, &clusters).await?;
        Ok((clusters, stats))
    }
}

/// Place every member of an exact-duplicate group that the semantic pass
/// left out. Members join the cluster of the first already placed member of
/// their group; a group with no placed member becomes a new cluster led by
/// its canonical item.
fn fold_exact_groups(window_id: &str, clusters: &mut Vec<DedupCluster>, groups: &[ExactDuplicateGroup]) {
    let mut cluster_of: HashMap<String, usize> = HashMap::new();
    for (idx, cluster) in clusters.iter().enumerate() {
        for member in &cluster.members {
            cluster_of.insert(member.item_id.clone(), idx);
        }
    }

    for group in groups.iter().filter(|g| g.item_ids.len() >= 2) {
        let target = match group.item_ids.iter().find_map(|id| cluster_of.get(id).copied()) {
            Some(idx) => idx,
            None => {
                clusters.push(DedupCluster {
                    id: Uuid::new_v4().to_string(),
                    window_id: window_id.to_string(),
                    representative_item_id: group.item_ids[0].clone(),
                    members: Vec::new(),
                    created_at: Utc::now(),
                });
                clusters.len() - 1
            }
        };

        for id in &group.item_ids {
            if cluster_of.contains_key(id) {
                continue;
            }
            clusters[target].members.push(ClusterMember {
                item_id: id.clone(),
                similarity: 1.0,
            });
            cluster_of.insert(id.clone(), target);
        }
    }
}
