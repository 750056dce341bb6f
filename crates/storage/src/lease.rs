//! Row-level lease primitive shared by every queue in the delivery core.
//!
//! A lease is encoded as two columns, `locked_by` (worker id) and
//! `locked_at` (claim time). A row is claimable iff `locked_by` is NULL or
//! `locked_at` is older than the staleness threshold, so leases held by
//! crashed workers expire without heartbeats or manual intervention. All
//! mutations are single conditional UPDATEs; two workers can never both
//! observe a successful claim on the same row.

use chrono::{DateTime, Utc};
use shared::domain::WorkerId;
use sqlx::{Encode, Sqlite, SqliteExecutor, Type};

/// Lease operations for one queue table.
///
/// `key_column` is the column a claim is keyed on. It does not have to be
/// the primary key: the receipt queue releases whole batches through their
/// shared `dequeue_id`.
#[derive(Debug, Clone, Copy)]
pub struct LeaseQueue {
    table: &'static str,
    key_column: &'static str,
}

/// How a worker lets go of a leased row.
#[derive(Debug, Clone, Copy)]
pub enum ReleaseOutcome {
    /// Work done; the row is deleted.
    Completed,
    /// Transient failure; the lock is cleared and the row stays queued,
    /// optionally rescheduled to `due_at` (only for tables with a `due_at`
    /// column).
    Retry { due_at: Option<DateTime<Utc>> },
    /// Permanent failure; the row is deleted. Side-effect cleanup is the
    /// caller's job and must happen after the delete is committed.
    Abandon,
}

impl LeaseQueue {
    pub const fn new(table: &'static str, key_column: &'static str) -> Self {
        Self { table, key_column }
    }

    /// Attempts to claim the row(s) with the given key for `worker`.
    ///
    /// Returns `false` when another worker holds a live lease. Losing the
    /// race is not an error; the caller simply has nothing to do.
    pub async fn try_claim<'e, K>(
        &self,
        executor: impl SqliteExecutor<'e>,
        key: K,
        worker: WorkerId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> sqlx::Result<bool>
    where
        K: for<'q> Encode<'q, Sqlite> + Type<Sqlite> + Send,
    {
        let sql = format!(
            "UPDATE {table} SET locked_by = ?, locked_at = ? \
             WHERE {key} = ? AND (locked_by IS NULL OR locked_at < ?)",
            table = self.table,
            key = self.key_column,
        );
        let result = sqlx::query(&sql)
            .bind(worker.0)
            .bind(now)
            .bind(key)
            .bind(stale_before)
            .execute(executor)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Extends a held lease by bumping `locked_at`.
    ///
    /// Returns `false` if the lease is no longer held by `worker`, in which
    /// case the caller must stop processing the row.
    pub async fn renew<'e, K>(
        &self,
        executor: impl SqliteExecutor<'e>,
        key: K,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> sqlx::Result<bool>
    where
        K: for<'q> Encode<'q, Sqlite> + Type<Sqlite> + Send,
    {
        let sql = format!(
            "UPDATE {table} SET locked_at = ? WHERE {key} = ? AND locked_by = ?",
            table = self.table,
            key = self.key_column,
        );
        let result = sqlx::query(&sql)
            .bind(now)
            .bind(key)
            .bind(worker.0)
            .execute(executor)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Releases a held lease. Returns the number of rows affected; zero
    /// means the lease had already expired and been reclaimed.
    pub async fn release<'e, K>(
        &self,
        executor: impl SqliteExecutor<'e>,
        key: K,
        worker: WorkerId,
        outcome: ReleaseOutcome,
    ) -> sqlx::Result<u64>
    where
        K: for<'q> Encode<'q, Sqlite> + Type<Sqlite> + Send,
    {
        let result = match outcome {
            ReleaseOutcome::Completed | ReleaseOutcome::Abandon => {
                let sql = format!(
                    "DELETE FROM {table} WHERE {key} = ? AND locked_by = ?",
                    table = self.table,
                    key = self.key_column,
                );
                sqlx::query(&sql)
                    .bind(key)
                    .bind(worker.0)
                    .execute(executor)
                    .await?
            }
            ReleaseOutcome::Retry { due_at: None } => {
                let sql = format!(
                    "UPDATE {table} SET locked_by = NULL, locked_at = NULL \
                     WHERE {key} = ? AND locked_by = ?",
                    table = self.table,
                    key = self.key_column,
                );
                sqlx::query(&sql)
                    .bind(key)
                    .bind(worker.0)
                    .execute(executor)
                    .await?
            }
            ReleaseOutcome::Retry {
                due_at: Some(due_at),
            } => {
                let sql = format!(
                    "UPDATE {table} SET locked_by = NULL, locked_at = NULL, due_at = ? \
                     WHERE {key} = ? AND locked_by = ?",
                    table = self.table,
                    key = self.key_column,
                );
                sqlx::query(&sql)
                    .bind(due_at)
                    .bind(key)
                    .bind(worker.0)
                    .execute(executor)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    /// Clears lock columns on rows whose lease exceeded the staleness
    /// threshold. Claimability does not depend on this (the claim predicate
    /// treats stale locks as free), but sweeping keeps the lock columns
    /// honest for inspection tooling.
    pub async fn sweep_expired<'e>(
        &self,
        executor: impl SqliteExecutor<'e>,
        stale_before: DateTime<Utc>,
    ) -> sqlx::Result<u64> {
        let sql = format!(
            "UPDATE {table} SET locked_by = NULL, locked_at = NULL \
             WHERE locked_by IS NOT NULL AND locked_at < ?",
            table = self.table,
        );
        let result = sqlx::query(&sql)
            .bind(stale_before)
            .execute(executor)
            .await?;
        Ok(result.rows_affected())
    }

    /// Number of rows currently queued, leased or not.
    pub async fn depth<'e>(&self, executor: impl SqliteExecutor<'e>) -> sqlx::Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {table}", table = self.table);
        sqlx::query_scalar(&sql).fetch_one(executor).await
    }
}

#[cfg(test)]
#[path = "tests/lease_tests.rs"]
mod tests;
