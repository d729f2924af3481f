use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Durable sync state of the chat client: catch-up checkpoints per drive and
/// a short history of catch-up runs.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCheckpoint {
    pub drive_key: String,
    pub last_catch_up_ms: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpMode {
    /// Bounded window queries from the previous checkpoint.
    Windowed,
    /// No usable checkpoint; every message collection was invalidated.
    Invalidated,
}

impl CatchUpMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Windowed => "windowed",
            Self::Invalidated => "invalidated",
        }
    }
}

impl fmt::Display for CatchUpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatchUpMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "windowed" => Ok(Self::Windowed),
            "invalidated" => Ok(Self::Invalidated),
            other => Err(anyhow::anyhow!("unknown catch-up mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpRun {
    pub drive_key: String,
    pub mode: CatchUpMode,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    pub inbox_popped: u32,
    pub records_applied: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCatchUpRun {
    pub id: i64,
    pub run: CatchUpRun,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory database opens a separate database.
        let max_connections = if database_url.starts_with("sqlite::memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn load_checkpoint(&self, drive_key: &str) -> Result<Option<i64>> {
        let value: Option<i64> = sqlx::query_scalar(
            "SELECT last_catch_up_ms FROM sync_checkpoints WHERE drive_key = ?1",
        )
        .bind(drive_key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load checkpoint for drive '{drive_key}'"))?;
        Ok(value)
    }

    pub async fn save_checkpoint(&self, drive_key: &str, last_catch_up_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (drive_key, last_catch_up_ms, updated_at_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(drive_key) DO UPDATE SET
                last_catch_up_ms = excluded.last_catch_up_ms,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(drive_key)
        .bind(last_catch_up_ms)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save checkpoint for drive '{drive_key}'"))?;
        Ok(())
    }

    /// Returns whether a checkpoint existed.
    pub async fn clear_checkpoint(&self, drive_key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_checkpoints WHERE drive_key = ?1")
            .bind(drive_key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to clear checkpoint for drive '{drive_key}'"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_checkpoints(&self) -> Result<Vec<StoredCheckpoint>> {
        let rows = sqlx::query(
            "SELECT drive_key, last_catch_up_ms, updated_at_ms FROM sync_checkpoints ORDER BY drive_key",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list checkpoints")?;

        rows.into_iter()
            .map(|row| {
                let updated_at_ms: i64 = row.try_get("updated_at_ms")?;
                Ok(StoredCheckpoint {
                    drive_key: row.try_get("drive_key")?,
                    last_catch_up_ms: row.try_get("last_catch_up_ms")?,
                    updated_at: millis_to_datetime(updated_at_ms)?,
                })
            })
            .collect()
    }

    pub async fn record_catch_up_run(&self, run: &CatchUpRun) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO catch_up_runs (
                drive_key,
                mode,
                started_at_ms,
                finished_at_ms,
                inbox_popped,
                records_applied
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&run.drive_key)
        .bind(run.mode.as_str())
        .bind(run.started_at_ms)
        .bind(run.finished_at_ms)
        .bind(i64::from(run.inbox_popped))
        .bind(i64::from(run.records_applied))
        .execute(&self.pool)
        .await
        .context("failed to record catch-up run")?;
        Ok(result.last_insert_rowid())
    }

    /// Most recent runs first.
    pub async fn recent_catch_up_runs(
        &self,
        drive_key: &str,
        limit: u32,
    ) -> Result<Vec<StoredCatchUpRun>> {
        let rows = sqlx::query(
            r#"
            SELECT id, drive_key, mode, started_at_ms, finished_at_ms, inbox_popped, records_applied
            FROM catch_up_runs
            WHERE drive_key = ?1
            ORDER BY started_at_ms DESC, id DESC
            LIMIT ?2
            "#,
        )
        .bind(drive_key)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list catch-up runs for drive '{drive_key}'"))?;

        rows.into_iter()
            .map(|row| {
                let mode: String = row.try_get("mode")?;
                let inbox_popped: i64 = row.try_get("inbox_popped")?;
                let records_applied: i64 = row.try_get("records_applied")?;
                Ok(StoredCatchUpRun {
                    id: row.try_get("id")?,
                    run: CatchUpRun {
                        drive_key: row.try_get("drive_key")?,
                        mode: mode.parse()?,
                        started_at_ms: row.try_get("started_at_ms")?,
                        finished_at_ms: row.try_get("finished_at_ms")?,
                        inbox_popped: u32::try_from(inbox_popped)?,
                        records_applied: u32::try_from(records_applied)?,
                    },
                })
            })
            .collect()
    }

    /// Keeps the newest `keep` runs for the drive, returns how many were removed.
    pub async fn prune_catch_up_runs(&self, drive_key: &str, keep: u32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM catch_up_runs
            WHERE drive_key = ?1
              AND id NOT IN (
                SELECT id FROM catch_up_runs
                WHERE drive_key = ?1
                ORDER BY started_at_ms DESC, id DESC
                LIMIT ?2
              )
            "#,
        )
        .bind(drive_key)
        .bind(i64::from(keep))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to prune catch-up runs for drive '{drive_key}'"))?;
        Ok(result.rows_affected())
    }
}

fn millis_to_datetime(value: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .with_context(|| format!("timestamp {value} out of range"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
