//! Window statistics and status overview.
//!
//! Summarises what each window holds: item counts, summary and embedding
//! coverage, clusters, and whether a digest went out. Used by
//! `wdigest status` to show where every recent window stands.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db::{self, from_millis};
use crate::state::WindowStateStore;

/// Counts for a single window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowStats {
    pub items: i64,
    pub media_only: i64,
    pub summarized: i64,
    pub embedded: i64,
    pub duplicates_flagged: i64,
    pub clusters: i64,
    /// Unix milliseconds of the publish record, if any.
    pub published_at: Option<i64>,
}

pub async fn window_stats(pool: &SqlitePool, window_id: &str) -> crate::error::Result<WindowStats> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS items,
            COALESCE(SUM(CASE WHEN normalized_text = '' AND has_media != 0 THEN 1 ELSE 0 END), 0) AS media_only,
            COALESCE(SUM(CASE WHEN embedding IS NOT NULL THEN 1 ELSE 0 END), 0) AS embedded,
            COALESCE(SUM(CASE WHEN duplicate_of IS NOT NULL THEN 1 ELSE 0 END), 0) AS duplicates_flagged
        FROM items
        WHERE window_id = ?
        "#,
    )
    .bind(window_id)
    .fetch_one(pool)
    .await?;

    let summarized: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM item_summaries s JOIN items i ON i.id = s.item_id WHERE i.window_id = ?",
    )
    .bind(window_id)
    .fetch_one(pool)
    .await?;

    let clusters: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dedup_clusters WHERE window_id = ?")
        .bind(window_id)
        .fetch_one(pool)
        .await?;

    let published_at: Option<i64> = sqlx::query_scalar("SELECT published_at FROM digests WHERE window_id = ?")
        .bind(window_id)
        .fetch_optional(pool)
        .await?;

    Ok(WindowStats {
        items: row.get("items"),
        media_only: row.get("media_only"),
        summarized,
        embedded: row.get("embedded"),
        duplicates_flagged: row.get("duplicates_flagged"),
        clusters,
        published_at,
    })
}

/// Run the status command: print the most recent windows and their counts.
pub async fn run_status(config: &Config, limit: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let state = WindowStateStore::new(pool.clone());
    let windows = state.list(limit).await?;

    println!("Window Digest Status");
    println!("======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!();

    if windows.is_empty() {
        println!("  No windows yet.");
        println!();
        pool.close().await;
        return Ok(());
    }

    println!(
        "  {:<34} {:<11} {:<11} {:>6} {:>6} {:>6} {:>5} {:>8}   {}",
        "WINDOW", "STAGE", "COMPLETED", "ITEMS", "SUMM", "EMBED", "DUPS", "CLUSTERS", "PUBLISHED"
    );
    println!("  {}", "-".repeat(118));

    for (window, status) in &windows {
        let stats = window_stats(&pool, &window.id).await?;
        let published = match stats.published_at {
            Some(ms) => format_ms_relative(ms),
            None => "-".to_string(),
        };
        println!(
            "  {:<34} {:<11} {:<11} {:>6} {:>6} {:>6} {:>5} {:>8}   {}",
            window.id,
            status.stage.as_str(),
            status.completed.as_str(),
            stats.items,
            stats.summarized,
            stats.embedded,
            stats.duplicates_flagged,
            stats.clusters,
            published
        );
        if let Some(err) = &status.last_error {
            println!("      last error: {}", err);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format Unix milliseconds as a relative time string (e.g. "3 hours ago").
fn format_ms_relative(ms: i64) -> String {
    let now = chrono::Utc::now().timestamp_millis();
    let delta = (now - ms) / 1000;

    if delta < 0 {
        return format_ms_iso(ms);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ms_iso(ms)
    }
}

fn format_ms_iso(ms: i64) -> String {
    from_millis(ms).format("%Y-%m-%d %H:%M").to_string()
}
