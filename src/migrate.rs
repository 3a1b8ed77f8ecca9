use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::error::Result;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Windows and their single status row
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS windows (
            id TEXT PRIMARY KEY,
            start_at INTEGER NOT NULL,
            end_at INTEGER NOT NULL,
            timezone TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(start_at, end_at)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS window_status (
            window_id TEXT PRIMARY KEY,
            stage TEXT NOT NULL DEFAULT 'pending',
            completed TEXT NOT NULL DEFAULT 'pending',
            last_error TEXT,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (window_id) REFERENCES windows(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS window_locks (
            window_id TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Items
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            window_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            normalized_text TEXT NOT NULL,
            has_media INTEGER NOT NULL DEFAULT 0,
            posted_at INTEGER NOT NULL,
            permalink TEXT,
            embedding BLOB,
            duplicate_of TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (window_id) REFERENCES windows(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS item_summaries (
            item_id TEXT PRIMARY KEY,
            summary TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '[]',
            importance INTEGER NOT NULL,
            copied_from TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (item_id) REFERENCES items(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Semantic clusters
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dedup_clusters (
            id TEXT PRIMARY KEY,
            window_id TEXT NOT NULL,
            representative_item_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (window_id) REFERENCES windows(id),
            FOREIGN KEY (representative_item_id) REFERENCES items(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dedup_cluster_items (
            cluster_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            similarity REAL NOT NULL,
            PRIMARY KEY (cluster_id, item_id),
            FOREIGN KEY (cluster_id) REFERENCES dedup_clusters(id),
            FOREIGN KEY (item_id) REFERENCES items(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Publish marker
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS digests (
            window_id TEXT PRIMARY KEY,
            message_ids_json TEXT NOT NULL DEFAULT '[]',
            content TEXT NOT NULL,
            stats_json TEXT,
            published_at INTEGER NOT NULL,
            FOREIGN KEY (window_id) REFERENCES windows(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_window_posted ON items(window_id, posted_at, id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_content_hash ON items(content_hash)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_dedup_clusters_window ON dedup_clusters(window_id)")
        .execute(pool)
        .await?;
    // An item belongs to at most one cluster
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_dedup_cluster_items_item ON dedup_cluster_items(item_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
