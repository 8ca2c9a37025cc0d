//! SQLite persistence for tasks, reminders, plans, notifications, feedback,
//! energy levels, credentials, dependencies, and user settings.
//!
//! Uniqueness constraints are the primary concurrency control: the partial
//! unique index on non-dismissed notifications backs the at-most-once nudge
//! reservation, and the (user, source, external_id) index backs idempotent
//! re-ingest.

mod credentials;
mod dependencies;
mod energy;
mod feedback;
mod migrations;
mod notifications;
mod plans;
mod reminders;
mod settings;
mod tasks;


pub use tasks::{IngestedTask, TaskFlags, UpsertOutcome};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn new(db_path: &str) -> anyhow::Result<Self> {
        let options: SqliteConnectOptions = format!("sqlite://{}", db_path)
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        migrations::run(&pool).await?;
        set_db_file_permissions(db_path);

        Ok(Self { pool })
    }

    /// In-memory store for tests.
    pub async fn new_in_memory() -> anyhow::Result<Self> {
        let options = "sqlite::memory:".parse::<SqliteConnectOptions>()?;
        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Set restrictive file permissions (0600) on the database and WAL files.
fn set_db_file_permissions(db_path: &str) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = std::fs::set_permissions(db_path, mode.clone()) {
            tracing::warn!("failed to set permissions on {}: {}", db_path, e);
        }
        for suffix in &["-wal", "-shm"] {
            let path = format!("{}{}", db_path, suffix);
            if std::path::Path::new(&path).exists() {
                if let Err(e) = std::fs::set_permissions(&path, mode.clone()) {
                    tracing::warn!("failed to set permissions on {}: {}", path, e);
                }
            }
        }
    }
    #[cfg(not(unix))]
    let _ = db_path;
}

/// Parse an RFC3339 timestamp column, tolerating legacy second precision.
pub(crate) fn parse_ts(value: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| anyhow::anyhow!("bad timestamp '{}': {}", value, e))
}

pub(crate) fn parse_ts_opt(value: Option<String>) -> anyhow::Result<Option<DateTime<Utc>>> {
    match value {
        Some(s) => Ok(Some(parse_ts(&s)?)),
        None => Ok(None),
    }
}
