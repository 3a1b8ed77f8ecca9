//! Item, summary and cluster persistence.
//!
//! Reads take the pool. Writes take a connection so the orchestrator can
//! commit them in the same transaction as the window status change that
//! accompanies them (see [`WindowStateStore::advance_in_tx`](crate::state::WindowStateStore::advance_in_tx)).

use chrono::Utc;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;

use crate::db::{from_millis, to_millis};
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::Result;
use crate::models::{ClusterMember, DedupCluster, Item, Summary};

const ITEM_COLUMNS: &str = "id, window_id, channel, content_hash, normalized_text, has_media, \
                            posted_at, permalink, embedding, duplicate_of";

fn item_from_row(row: &sqlx::sqlite::SqliteRow) -> Item {
    let embedding: Option<Vec<u8>> = row.get("embedding");
    let has_media: i64 = row.get("has_media");
    Item {
        id: row.get("id"),
        window_id: row.get("window_id"),
        channel: row.get("channel"),
        content_hash: row.get("content_hash"),
        normalized_text: row.get("normalized_text"),
        has_media: has_media != 0,
        posted_at: from_millis(row.get("posted_at")),
        permalink: row.get("permalink"),
        embedding: embedding.map(|blob| blob_to_vec(&blob)),
        duplicate_of: row.get("duplicate_of"),
    }
}

/// Insert an item. An item that is already stored keeps its original
/// fields, `content_hash` included. Returns `true` if a row was inserted.
pub async fn upsert_item(conn: &mut SqliteConnection, item: &Item) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO items (id, window_id, channel, content_hash, normalized_text,
                           has_media, posted_at, permalink, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(&item.id)
    .bind(&item.window_id)
    .bind(&item.channel)
    .bind(&item.content_hash)
    .bind(&item.normalized_text)
    .bind(item.has_media as i64)
    .bind(to_millis(item.posted_at))
    .bind(&item.permalink)
    .bind(to_millis(Utc::now()))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// All items of a window ordered by `(posted_at, id)`.
pub async fn items_in_window(pool: &SqlitePool, window_id: &str) -> Result<Vec<Item>> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE window_id = ? ORDER BY posted_at ASC, id ASC");
    let rows = sqlx::query(&sql).bind(window_id).fetch_all(pool).await?;
    Ok(rows.iter().map(item_from_row).collect())
}

/// Items with text that still have no stored embedding.
pub async fn items_missing_embedding(pool: &SqlitePool, window_id: &str) -> Result<Vec<Item>> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM items \
         WHERE window_id = ? AND embedding IS NULL AND normalized_text != '' \
         ORDER BY posted_at ASC, id ASC"
    );
    let rows = sqlx::query(&sql).bind(window_id).fetch_all(pool).await?;
    Ok(rows.iter().map(item_from_row).collect())
}

/// Items with text that still have no stored summary.
pub async fn items_missing_summary(pool: &SqlitePool, window_id: &str) -> Result<Vec<Item>> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM items i \
         WHERE i.window_id = ? AND i.normalized_text != '' \
           AND NOT EXISTS (SELECT 1 FROM item_summaries s WHERE s.item_id = i.id) \
         ORDER BY i.posted_at ASC, i.id ASC"
    );
    let rows = sqlx::query(&sql).bind(window_id).fetch_all(pool).await?;
    Ok(rows.iter().map(item_from_row).collect())
}

/// Store a validated embedding.
pub async fn set_embedding(conn: &mut SqliteConnection, item_id: &str, vector: &[f32]) -> Result<()> {
    sqlx::query("UPDATE items SET embedding = ? WHERE id = ?")
        .bind(vec_to_blob(vector))
        .bind(item_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Store a summary. `copied_from` names the item whose summary was reused.
pub async fn save_summary(
    conn: &mut SqliteConnection,
    item_id: &str,
    summary: &Summary,
    copied_from: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO item_summaries (item_id, summary, tags_json, importance, copied_from, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(item_id) DO UPDATE SET
            summary = excluded.summary,
            tags_json = excluded.tags_json,
            importance = excluded.importance,
            copied_from = excluded.copied_from,
            created_at = excluded.created_at
        "#,
    )
    .bind(item_id)
    .bind(&summary.summary)
    .bind(serde_json::to_string(&summary.tags)?)
    .bind(summary.importance)
    .bind(copied_from)
    .bind(to_millis(Utc::now()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn summary_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Summary> {
    let tags_json: String = row.get("tags_json");
    Ok(Summary {
        summary: row.get("summary"),
        tags: serde_json::from_str(&tags_json)?,
        importance: row.get("importance"),
    })
}

pub async fn summary_for(pool: &SqlitePool, item_id: &str) -> Result<Option<Summary>> {
    let row = sqlx::query("SELECT summary, tags_json, importance FROM item_summaries WHERE item_id = ?")
        .bind(item_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(summary_from_row).transpose()
}

/// Summaries of a window's items keyed by item id.
pub async fn summaries_for_window(pool: &SqlitePool, window_id: &str) -> Result<HashMap<String, Summary>> {
    let rows = sqlx::query(
        r#"
        SELECT s.item_id, s.summary, s.tags_json, s.importance
        FROM item_summaries s
        JOIN items i ON i.id = s.item_id
        WHERE i.window_id = ?
        "#,
    )
    .bind(window_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<(String, Summary)> {
            Ok((row.get("item_id"), summary_from_row(row)?))
        })
        .collect()
}

/// Replace the duplicate flags of a window. `flags` maps each duplicate to
/// its canonical item; every other item of the window is unflagged.
pub async fn set_duplicate_flags(
    conn: &mut SqliteConnection,
    window_id: &str,
    flags: &[(String, String)],
) -> Result<()> {
    sqlx::query("UPDATE items SET duplicate_of = NULL WHERE window_id = ?")
        .bind(window_id)
        .execute(&mut *conn)
        .await?;

    for (item_id, canonical) in flags {
        sqlx::query("UPDATE items SET duplicate_of = ? WHERE id = ? AND window_id = ?")
            .bind(canonical)
            .bind(item_id)
            .bind(window_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Delete every cluster of the window, then insert `clusters`. Cluster
/// order is kept in `position`.
pub async fn replace_clusters(conn: &mut SqliteConnection, window_id: &str, clusters: &[DedupCluster]) -> Result<()> {
    sqlx::query(
        "DELETE FROM dedup_cluster_items WHERE cluster_id IN (SELECT id FROM dedup_clusters WHERE window_id = ?)",
    )
    .bind(window_id)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM dedup_clusters WHERE window_id = ?")
        .bind(window_id)
        .execute(&mut *conn)
        .await?;

    for (position, cluster) in clusters.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO dedup_clusters (id, window_id, representative_item_id, position, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cluster.id)
        .bind(window_id)
        .bind(&cluster.representative_item_id)
        .bind(position as i64)
        .bind(to_millis(cluster.created_at))
        .execute(&mut *conn)
        .await?;

        for (member_pos, member) in cluster.members.iter().enumerate() {
            sqlx::query(
                "INSERT INTO dedup_cluster_items (cluster_id, item_id, position, similarity) VALUES (?, ?, ?, ?)",
            )
            .bind(&cluster.id)
            .bind(&member.item_id)
            .bind(member_pos as i64)
            .bind(member.similarity as f64)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

/// Clusters of a window in stored order, members in processing order.
pub async fn clusters_for_window(pool: &SqlitePool, window_id: &str) -> Result<Vec<DedupCluster>> {
    let rows = sqlx::query(
        r#"
        SELECT c.id, c.representative_item_id, c.created_at, m.item_id, m.similarity
        FROM dedup_clusters c
        JOIN dedup_cluster_items m ON m.cluster_id = c.id
        WHERE c.window_id = ?
        ORDER BY c.position ASC, m.position ASC
        "#,
    )
    .bind(window_id)
    .fetch_all(pool)
    .await?;

    let mut clusters: Vec<DedupCluster> = Vec::new();
    for row in &rows {
        let cluster_id: String = row.get("id");
        let similarity: f64 = row.get("similarity");
        let member = ClusterMember {
            item_id: row.get("item_id"),
            similarity: similarity as f32,
        };

        match clusters.last_mut() {
            Some(last) if last.id == cluster_id => last.members.push(member),
            _ => clusters.push(DedupCluster {
                id: cluster_id,
                window_id: window_id.to_string(),
                representative_item_id: row.get("representative_item_id"),
                members: vec![member],
                created_at: from_millis(row.get("created_at")),
            }),
        }
    }
    Ok(clusters)
}
