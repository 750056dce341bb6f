//! Scheduler queue for periodic maintenance tasks.
//!
//! The task kind is the primary key: scheduling a kind that already has a
//! row replaces its due time instead of piling up duplicates. After a run
//! the executor re-arms the kind with its next due time.

use chrono::{DateTime, Utc};
use shared::domain::{TaskKind, WorkerId};
use sqlx::{SqliteExecutor, SqlitePool};
use tracing::debug;

use crate::lease::{LeaseQueue, ReleaseOutcome};

pub const LEASE: LeaseQueue = LeaseQueue::new("timed_tasks_queue", "task_kind");

pub struct TimedTask;

impl TimedTask {
    /// Schedules `kind` to run at `due_at`, superseding any existing
    /// schedule for the same kind.
    pub async fn schedule<'e>(
        executor: impl SqliteExecutor<'e>,
        kind: TaskKind,
        due_at: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        debug!(kind = kind.as_str(), %due_at, "scheduling timed task");

        sqlx::query(
            "INSERT INTO timed_tasks_queue (task_kind, due_at)
             VALUES (?, ?)
             ON CONFLICT (task_kind) DO UPDATE SET due_at = excluded.due_at",
        )
        .bind(kind.as_str())
        .bind(due_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Seeds a schedule for every known kind that has none yet. Existing
    /// schedules are left untouched.
    pub async fn ensure_default_schedules(
        pool: &SqlitePool,
        now: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        for kind in TaskKind::ALL {
            sqlx::query(
                "INSERT INTO timed_tasks_queue (task_kind, due_at)
                 VALUES (?, ?)
                 ON CONFLICT DO NOTHING",
            )
            .bind(kind.as_str())
            .bind(now)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    /// Claims the most overdue claimable task, if any is due.
    pub async fn claim_due(
        pool: &SqlitePool,
        worker: WorkerId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> sqlx::Result<Option<TaskKind>> {
        let mut txn = pool.begin_with("BEGIN IMMEDIATE").await?;

        let kind: Option<String> = sqlx::query_scalar(
            "SELECT task_kind
             FROM timed_tasks_queue
             WHERE (locked_by IS NULL OR locked_at < ?)
               AND due_at <= ?
             ORDER BY due_at ASC
             LIMIT 1",
        )
        .bind(stale_before)
        .bind(now)
        .fetch_optional(txn.as_mut())
        .await?;
        let Some(kind) = kind else {
            return Ok(None);
        };

        let claimed = LEASE
            .try_claim(txn.as_mut(), kind.clone(), worker, now, stale_before)
            .await?;
        if !claimed {
            return Ok(None);
        }

        txn.commit().await?;

        let kind = TaskKind::parse(&kind).map_err(|e| sqlx::Error::Decode(e.into()))?;
        Ok(Some(kind))
    }

    /// Re-arms the task for its next run and releases the lease.
    pub async fn reschedule<'e>(
        executor: impl SqliteExecutor<'e>,
        kind: TaskKind,
        worker: WorkerId,
        next_due_at: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        let affected = LEASE
            .release(
                executor,
                kind.as_str().to_owned(),
                worker,
                ReleaseOutcome::Retry {
                    due_at: Some(next_due_at),
                },
            )
            .await?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
#[path = "tests/timed_tasks_tests.rs"]
mod tests;
