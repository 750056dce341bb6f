//! Queue of pending group resynchronization requests.
//!
//! One request per group (primary key) and per chat (unique constraint):
//! concurrent repair attempts against different authoritative snapshots
//! could strand a member between partial states, so exclusivity is enforced
//! by the schema. The key material and leaf index are captured at detection
//! time because both may change as part of the repair.

use chrono::{DateTime, Utc};
use shared::domain::{ChatId, GroupId, LeafIndex, WorkerId};
use sqlx::{Row, SqliteExecutor, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::lease::{LeaseQueue, ReleaseOutcome};

pub const LEASE: LeaseQueue = LeaseQueue::new("resync_queue", "group_id");

#[derive(Debug, Clone)]
pub struct ResyncRequest {
    pub group_id: GroupId,
    pub chat_id: ChatId,
    pub group_state_key: Vec<u8>,
    pub identity_wrapper_key: Vec<u8>,
    pub original_leaf_index: LeafIndex,
    /// Number of times this request has been claimed, including the
    /// current claim.
    pub attempts: i64,
}

impl ResyncRequest {
    /// Enqueues a resync request. A request already pending for this group
    /// or chat wins; the new insert is a no-op.
    pub async fn enqueue<'e>(
        executor: impl SqliteExecutor<'e>,
        group_id: &GroupId,
        chat_id: ChatId,
        group_state_key: &[u8],
        identity_wrapper_key: &[u8],
        original_leaf_index: LeafIndex,
        now: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        debug!(?chat_id, "enqueueing resync");

        sqlx::query(
            "INSERT INTO resync_queue
                (group_id, chat_id, group_state_key, identity_wrapper_key,
                 original_leaf_index, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(group_id.as_slice())
        .bind(chat_id.0)
        .bind(group_state_key)
        .bind(identity_wrapper_key)
        .bind(original_leaf_index.0 as i64)
        .bind(now)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Claims the oldest due resync request and bumps its attempt counter.
    pub async fn claim_next(
        pool: &SqlitePool,
        worker: WorkerId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> sqlx::Result<Option<ResyncRequest>> {
        let mut txn = pool.begin_with("BEGIN IMMEDIATE").await?;

        let group_id: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT group_id
             FROM resync_queue
             WHERE (locked_by IS NULL OR locked_at < ?)
               AND (due_at IS NULL OR due_at <= ?)
             ORDER BY created_at ASC
             LIMIT 1",
        )
        .bind(stale_before)
        .bind(now)
        .fetch_optional(txn.as_mut())
        .await?;
        let Some(group_id) = group_id else {
            return Ok(None);
        };

        let claimed = LEASE
            .try_claim(txn.as_mut(), group_id.clone(), worker, now, stale_before)
            .await?;
        if !claimed {
            return Ok(None);
        }

        let row = sqlx::query(
            "UPDATE resync_queue
             SET attempts = attempts + 1
             WHERE group_id = ?
             RETURNING chat_id, group_state_key, identity_wrapper_key,
                       original_leaf_index, attempts",
        )
        .bind(&group_id)
        .fetch_one(txn.as_mut())
        .await?;

        let request = ResyncRequest {
            group_id: GroupId(group_id),
            chat_id: ChatId(row.get::<Uuid, _>(0)),
            group_state_key: row.get::<Vec<u8>, _>(1),
            identity_wrapper_key: row.get::<Vec<u8>, _>(2),
            original_leaf_index: LeafIndex(row.get::<i64, _>(3) as u32),
            attempts: row.get::<i64, _>(4),
        };

        txn.commit().await?;
        Ok(Some(request))
    }

    /// Deletes the request after a successful repair.
    pub async fn complete<'e>(
        executor: impl SqliteExecutor<'e>,
        group_id: &GroupId,
        worker: WorkerId,
    ) -> sqlx::Result<bool> {
        let affected = LEASE
            .release(
                executor,
                group_id.0.clone(),
                worker,
                ReleaseOutcome::Completed,
            )
            .await?;
        Ok(affected > 0)
    }

    /// Records a failed attempt and reschedules the request to `due_at`.
    pub async fn fail_attempt<'e>(
        executor: impl SqliteExecutor<'e>,
        group_id: &GroupId,
        worker: WorkerId,
        due_at: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        let affected = LEASE
            .release(
                executor,
                group_id.0.clone(),
                worker,
                ReleaseOutcome::Retry {
                    due_at: Some(due_at),
                },
            )
            .await?;
        Ok(affected > 0)
    }

    /// Drops the request without repairing. The member must re-join out of
    /// band; the caller is responsible for surfacing that.
    pub async fn abandon<'e>(
        executor: impl SqliteExecutor<'e>,
        group_id: &GroupId,
        worker: WorkerId,
    ) -> sqlx::Result<bool> {
        let affected = LEASE
            .release(executor, group_id.0.clone(), worker, ReleaseOutcome::Abandon)
            .await?;
        Ok(affected > 0)
    }

    /// Whether a resync is pending for the chat, leased or not. Upstream
    /// processing uses this to suppress redundant divergence detection.
    pub async fn is_pending_for_chat<'e>(
        executor: impl SqliteExecutor<'e>,
        chat_id: ChatId,
    ) -> sqlx::Result<bool> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM resync_queue WHERE chat_id = ? LIMIT 1)",
        )
        .bind(chat_id.0)
        .fetch_one(executor)
        .await?;
        Ok(exists == 1)
    }
}

#[cfg(test)]
#[path = "tests/resync_queue_tests.rs"]
mod tests;
