use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use shared::domain::{ChatId, GroupId, MessageId};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Sqlite, SqliteTransaction,
};

pub mod key_packages;
pub mod lease;
pub mod membership;
pub mod message_queue;
pub mod receipt_queue;
pub mod resync_queue;
pub mod timed_tasks;

pub use lease::{LeaseQueue, ReleaseOutcome};

/// Handle to the delivery core's SQLite database.
///
/// Cheap to clone; all queue and ledger types operate on executors borrowed
/// from this pool so that enqueue operations can share a transaction with
/// the protocol state mutation that motivates them.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Begins a write transaction immediately instead of on first write.
    ///
    /// SQLite upgrades deferred transactions lazily, which can deadlock two
    /// writers; all multi-statement writes in this crate go through here.
    pub async fn begin_immediate(&self) -> Result<SqliteTransaction<'static>, sqlx::Error> {
        self.pool.begin_with("BEGIN IMMEDIATE").await
    }

    /// Persists a message record. The delivery core only needs the row to
    /// exist so the outbox foreign key holds; content lives upstream.
    pub async fn insert_message(
        &self,
        message_id: MessageId,
        chat_id: ChatId,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO messages (message_id, chat_id, created_at) VALUES (?, ?, ?)")
            .bind(message_id.0)
            .bind(chat_id.0)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM messages WHERE message_id = ?")
            .bind(message_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_group(
        &self,
        group_id: &GroupId,
        chat_id: ChatId,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO chat_groups (group_id, chat_id, created_at) VALUES (?, ?, ?)")
            .bind(group_id.as_slice())
            .bind(chat_id.0)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_group(&self, group_id: &GroupId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM chat_groups WHERE group_id = ?")
            .bind(group_id.as_slice())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
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
