//! Exact-duplicate grouping by content hash.
//!
//! [`ExactDedupIndex::group`] is read-only and is what reporting uses.
//! [`ExactDedupIndex::mark_duplicates`] additionally flags every
//! non-canonical member of each group; it never deletes an item.

use sqlx::SqliteConnection;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::Result;
use crate::models::{ExactDuplicateGroup, Item};
use crate::store;

pub struct ExactDedupIndex;

impl ExactDedupIndex {
    /// Groups of items sharing a `content_hash`, with at least two members.
    ///
    /// Groups are ordered by size (largest first), then by the earliest
    /// `posted_at` among their members, then by hash. Members are ordered by
    /// `(posted_at, id)`, so the first member is the canonical one.
    pub fn group(items: &[Item]) -> Vec<ExactDuplicateGroup> {
        let mut by_hash: HashMap<&str, Vec<&Item>> = HashMap::new();
        for item in items {
            by_hash.entry(item.content_hash.as_str()).or_default().push(item);
        }

        let mut groups: Vec<(ExactDuplicateGroup, chrono::DateTime<chrono::Utc>)> = by_hash
            .into_iter()
            .filter(|(_, members)| members.len() >= 2)
            .map(|(hash, mut members)| {
                members.sort_by(|a, b| a.posted_at.cmp(&b.posted_at).then_with(|| a.id.cmp(&b.id)));
                let earliest = members[0].posted_at;
                let group = ExactDuplicateGroup {
                    content_hash: hash.to_string(),
                    item_ids: members.iter().map(|m| m.id.clone()).collect(),
                    channel_set: members.iter().map(|m| m.channel.clone()).collect::<BTreeSet<_>>(),
                };
                (group, earliest)
            })
            .collect();

        groups.sort_by(|(a, a_earliest), (b, b_earliest)| {
            b.item_ids
                .len()
                .cmp(&a.item_ids.len())
                .then_with(|| a_earliest.cmp(b_earliest))
                .then_with(|| a.content_hash.cmp(&b.content_hash))
        });

        groups.into_iter().map(|(group, _)| group).collect()
    }

    /// Flag all but the canonical member of each group as a duplicate of it.
    /// Groups with fewer than two members are ignored.
    /// Flags from a previous pass over the window are replaced. Returns the
    /// number of items flagged.
    pub async fn mark_duplicates(
        conn: &mut SqliteConnection,
        window_id: &str,
        groups: &[ExactDuplicateGroup],
    ) -> Result<usize> {
        let flags: Vec<(String, String)> = groups
            .iter()
            .filter_map(|group| match group.item_ids.split_first() {
                Some((canonical, rest)) if !rest.is_empty() => Some((canonical, rest)),
                _ => None,
            })
            .flat_map(|(canonical, rest)| rest.iter().map(move |id| (id.clone(), canonical.clone())))
            .collect();

        store::set_duplicate_flags(conn, window_id, &flags).await?;
        debug!(window_id, groups = groups.len(), flagged = flags.len(), "exact duplicates flagged");
        Ok(flags.len())
    }
}
