//! Persisted per-window progress.
//!
//! [`WindowStateStore`] owns the `windows`, `window_status`, `window_locks`
//! and `digests` tables. It is the source of truth for which stages of a
//! window have been committed, and therefore for what a rerun may skip.
//!
//! Stage transitions that accompany stage work are written with the
//! `*_in_tx` functions so the caller can commit them in the same
//! transaction as the work itself.

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::db::{from_millis, to_millis};
use crate::error::{PipelineError, Result};
use crate::models::{PublishReceipt, Stage, Window, WindowStatus};
use crate::retry::RetryPolicy;

/// Exclusive hold on a window. Release it with
/// [`WindowStateStore::release_lock`].
#[derive(Debug, Clone)]
pub struct WindowLock {
    pub window_id: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct WindowStateStore {
    pool: SqlitePool,
}

impl WindowStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the window and its `pending` status row if they do not exist,
    /// and return the current status.
    pub async fn ensure_window(&self, window: &Window) -> Result<WindowStatus> {
        let now = to_millis(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO windows (id, start_at, end_at, timezone, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&window.id)
        .bind(to_millis(window.start))
        .bind(to_millis(window.end))
        .bind(&window.timezone)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO window_status (window_id, stage, completed, last_error, updated_at)
            VALUES (?, 'pending', 'pending', NULL, ?)
            ON CONFLICT(window_id) DO NOTHING
            "#,
        )
        .bind(&window.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.status(&window.id)
            .await?
            .ok_or_else(|| PipelineError::Storage(sqlx::Error::RowNotFound))
    }

    pub async fn window(&self, window_id: &str) -> Result<Option<Window>> {
        let row = sqlx::query("SELECT id, start_at, end_at, timezone FROM windows WHERE id = ?")
            .bind(window_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| Window {
            id: row.get("id"),
            start: from_millis(row.get("start_at")),
            end: from_millis(row.get("end_at")),
            timezone: row.get("timezone"),
        }))
    }

    pub async fn status(&self, window_id: &str) -> Result<Option<WindowStatus>> {
        let row = sqlx::query(
            "SELECT window_id, stage, completed, last_error, updated_at FROM window_status WHERE window_id = ?",
        )
        .bind(window_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| status_from_row(&row)).transpose()
    }

    /// Most recent windows first.
    pub async fn list(&self, limit: i64) -> Result<Vec<(Window, WindowStatus)>> {
        let rows = sqlx::query(
            r#"
            SELECT w.id, w.start_at, w.end_at, w.timezone,
                   s.window_id, s.stage, s.completed, s.last_error, s.updated_at
            FROM windows w
            JOIN window_status s ON s.window_id = w.id
            ORDER BY w.start_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(Window, WindowStatus)> {
                let window = Window {
                    id: row.get("id"),
                    start: from_millis(row.get("start_at")),
                    end: from_millis(row.get("end_at")),
                    timezone: row.get("timezone"),
                };
                Ok((window, status_from_row(row)?))
            })
            .collect()
    }

    /// Record that `target` was committed. Never moves `completed`
    /// backwards; a forced re-run of an earlier stage keeps the later
    /// progress.
    pub async fn advance_in_tx(conn: &mut SqliteConnection, window_id: &str, target: Stage) -> Result<Stage> {
        let completed: String =
            sqlx::query_scalar("SELECT completed FROM window_status WHERE window_id = ?")
                .bind(window_id)
                .fetch_one(&mut *conn)
                .await?;
        let completed: Stage = completed.parse()?;
        let next = if completed.reached(target) { completed } else { target };

        sqlx::query(
            r#"
            UPDATE window_status
            SET stage = ?, completed = ?, last_error = NULL, updated_at = ?
            WHERE window_id = ?
            "#,
        )
        .bind(next.as_str())
        .bind(next.as_str())
        .bind(to_millis(Utc::now()))
        .bind(window_id)
        .execute(&mut *conn)
        .await?;

        Ok(next)
    }

    /// Move the window to `failed`, keeping `completed` so a retry resumes
    /// after the last committed stage.
    pub async fn mark_failed(&self, window_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE window_status
            SET stage = 'failed', last_error = ?, updated_at = ?
            WHERE window_id = ?
            "#,
        )
        .bind(error)
        .bind(to_millis(Utc::now()))
        .bind(window_id)
        .execute(&self.pool)
        .await?;

        warn!(window_id, error, "window marked failed");
        Ok(())
    }

    /// Forced reset: put the window back to `stage`, discarding any record of
    /// later progress. Publish records are removed when resetting before
    /// `published` so the window can be published again.
    pub async fn reset(&self, window_id: &str, stage: Stage) -> Result<()> {
        if stage == Stage::Failed {
            return Err(PipelineError::Config("cannot reset a window to 'failed'".to_string()));
        }

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE window_status
            SET stage = ?, completed = ?, last_error = NULL, updated_at = ?
            WHERE window_id = ?
            "#,
        )
        .bind(stage.as_str())
        .bind(stage.as_str())
        .bind(to_millis(Utc::now()))
        .bind(window_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(PipelineError::Config(format!("unknown window: '{window_id}'")));
        }

        if stage != Stage::Published {
            sqlx::query("DELETE FROM digests WHERE window_id = ?")
                .bind(window_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(window_id, stage = stage.as_str(), "window reset");
        Ok(())
    }

    /// Try once to take the window lock. A lock whose lease has expired is
    /// taken over.
    pub async fn try_lock(&self, window_id: &str, holder: &str, lease: Duration) -> Result<WindowLock> {
        let now = Utc::now();
        let expires_at = now + lease;

        let result = sqlx::query(
            r#"
            INSERT INTO window_locks (window_id, holder, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(window_id) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE window_locks.expires_at <= excluded.acquired_at
            "#,
        )
        .bind(window_id)
        .bind(holder)
        .bind(to_millis(now))
        .bind(to_millis(expires_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!(window_id, holder, "window lock acquired");
            return Ok(WindowLock {
                window_id: window_id.to_string(),
                holder: holder.to_string(),
                expires_at,
            });
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT holder FROM window_locks WHERE window_id = ?")
                .bind(window_id)
                .fetch_optional(&self.pool)
                .await?;

        Err(PipelineError::LockContention {
            window_id: window_id.to_string(),
            holder: current.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Take the window lock, waiting per `policy` while another run holds it.
    pub async fn lock(
        &self,
        window_id: &str,
        holder: &str,
        lease: Duration,
        policy: &RetryPolicy,
    ) -> Result<WindowLock> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_lock(window_id, holder, lease).await {
                Err(PipelineError::LockContention { holder: other, .. }) if attempt < max_attempts => {
                    let delay = policy.retry_interval(attempt);
                    info!(window_id, held_by = %other, attempt, "window locked, waiting");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Extend the lease of `lock` if it is still held. Fails with
    /// [`PipelineError::LockContention`] once the lease has lapsed or the
    /// window has been taken over, so a commit made on `conn` after this
    /// call belongs to the current holder.
    pub async fn renew_lock_in_tx(
        conn: &mut SqliteConnection,
        lock: &WindowLock,
        lease: Duration,
    ) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let expires_at = now + lease;

        let result = sqlx::query(
            r#"
            UPDATE window_locks SET expires_at = ?
            WHERE window_id = ? AND holder = ? AND expires_at > ?
            "#,
        )
        .bind(to_millis(expires_at))
        .bind(&lock.window_id)
        .bind(&lock.holder)
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT holder FROM window_locks WHERE window_id = ?")
                    .bind(&lock.window_id)
                    .fetch_optional(&mut *conn)
                    .await?;
            return Err(PipelineError::LockContention {
                window_id: lock.window_id.clone(),
                holder: current.unwrap_or_else(|| "nobody".to_string()),
            });
        }
        Ok(expires_at)
    }

    pub async fn renew_lock(&self, lock: &WindowLock, lease: Duration) -> Result<DateTime<Utc>> {
        let mut conn = self.pool.acquire().await?;
        Self::renew_lock_in_tx(&mut conn, lock, lease).await
    }

    pub async fn release_lock(&self, lock: &WindowLock) -> Result<()> {
        sqlx::query("DELETE FROM window_locks WHERE window_id = ? AND holder = ?")
            .bind(&lock.window_id)
            .bind(&lock.holder)
            .execute(&self.pool)
            .await?;
        debug!(window_id = %lock.window_id, "window lock released");
        Ok(())
    }

    pub async fn publish_receipt(&self, window_id: &str) -> Result<Option<PublishReceipt>> {
        let mut conn = self.pool.acquire().await?;
        Self::publish_receipt_in_tx(&mut conn, window_id).await
    }

    pub async fn publish_receipt_in_tx(conn: &mut SqliteConnection, window_id: &str) -> Result<Option<PublishReceipt>> {
        let row = sqlx::query(
            "SELECT window_id, message_ids_json, published_at FROM digests WHERE window_id = ?",
        )
        .bind(window_id)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|row| -> Result<PublishReceipt> {
            let ids_json: String = row.get("message_ids_json");
            Ok(PublishReceipt {
                window_id: row.get("window_id"),
                message_ids: serde_json::from_str(&ids_json)?,
                published_at: from_millis(row.get("published_at")),
            })
        })
        .transpose()
    }

    /// Write (or overwrite, on forced re-publish) the publish marker.
    pub async fn record_publish_in_tx(
        conn: &mut SqliteConnection,
        receipt: &PublishReceipt,
        content_json: &str,
        stats_json: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO digests (window_id, message_ids_json, content, stats_json, published_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(window_id) DO UPDATE SET
                message_ids_json = excluded.message_ids_json,
                content = excluded.content,
                stats_json = excluded.stats_json,
                published_at = excluded.published_at
            "#,
        )
        .bind(&receipt.window_id)
        .bind(serde_json::to_string(&receipt.message_ids)?)
        .bind(content_json)
        .bind(stats_json)
        .bind(to_millis(receipt.published_at))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

fn status_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WindowStatus> {
    let stage: String = row.get("stage");
    let completed: String = row.get("completed");
    Ok(WindowStatus {
        window_id: row.get("window_id"),
        stage: stage.parse()?,
        completed: completed.parse()?,
        last_error: row.get("last_error"),
        updated_at: from_millis(row.get("updated_at")),
    })
}
