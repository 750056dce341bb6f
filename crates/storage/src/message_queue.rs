//! Outbox for encrypted chat messages awaiting transmission.
//!
//! Rows are inserted in the same transaction that persists the message
//! itself, so a crash between "decided to send" and "sent" can never lose
//! a message. Background workers claim batches in FIFO order and either
//! ack (delete), retry (clear lock, optionally with backoff), or abandon
//! (delete plus attachment cleanup).

use chrono::{DateTime, Utc};
use shared::domain::{AttachmentId, ChatId, MessageId, WorkerId};
use sqlx::{Row, SqliteExecutor};
use tracing::debug;
use uuid::Uuid;

use crate::lease::{LeaseQueue, ReleaseOutcome};

pub const LEASE: LeaseQueue = LeaseQueue::new("message_queue", "message_id");

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub attachment_id: Option<AttachmentId>,
    pub created_at: DateTime<Utc>,
}

impl QueuedMessage {
    /// Enqueues a message for delivery. Idempotent: re-enqueueing an
    /// already queued message is a no-op.
    pub async fn enqueue<'e>(
        executor: impl SqliteExecutor<'e>,
        message_id: MessageId,
        chat_id: ChatId,
        attachment_id: Option<AttachmentId>,
        now: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        debug!(?message_id, ?chat_id, "enqueueing chat message");

        sqlx::query(
            "INSERT INTO message_queue (message_id, chat_id, attachment_id, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(message_id.0)
        .bind(chat_id.0)
        .bind(attachment_id.map(|id| id.0))
        .bind(now)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Claims up to `limit` claimable messages for `worker`, oldest first.
    ///
    /// A row is claimable when it is unlocked or its lease went stale, and
    /// its retry backoff (if any) has elapsed.
    pub async fn claim_batch<'e>(
        executor: impl SqliteExecutor<'e>,
        worker: WorkerId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> sqlx::Result<Vec<QueuedMessage>> {
        let rows = sqlx::query(
            "UPDATE message_queue
             SET locked_by = ?, locked_at = ?
             WHERE message_id IN (
                SELECT message_id
                FROM message_queue
                WHERE (locked_by IS NULL OR locked_at < ?)
                  AND (due_at IS NULL OR due_at <= ?)
                ORDER BY created_at ASC
                LIMIT ?
             )
             RETURNING message_id, chat_id, attachment_id, created_at",
        )
        .bind(worker.0)
        .bind(now)
        .bind(stale_before)
        .bind(now)
        .bind(limit)
        .fetch_all(executor)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| QueuedMessage {
                message_id: MessageId(r.get::<Uuid, _>(0)),
                chat_id: ChatId(r.get::<Uuid, _>(1)),
                attachment_id: r.get::<Option<Uuid>, _>(2).map(AttachmentId),
                created_at: r.get::<DateTime<Utc>, _>(3),
            })
            .collect())
    }

    /// Confirms delivery: deletes the queue row. The attachment, if any,
    /// stays; it was part of the delivered message.
    pub async fn ack<'e>(
        executor: impl SqliteExecutor<'e>,
        message_id: MessageId,
        worker: WorkerId,
    ) -> sqlx::Result<bool> {
        let affected = LEASE
            .release(executor, message_id.0, worker, ReleaseOutcome::Completed)
            .await?;
        Ok(affected > 0)
    }

    /// Records a transient send failure: clears the lock and reschedules
    /// the row to `due_at` for the next polling pass.
    pub async fn nack_transient<'e>(
        executor: impl SqliteExecutor<'e>,
        message_id: MessageId,
        worker: WorkerId,
        due_at: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        debug!(?message_id, %due_at, "message send failed; rescheduling");
        let affected = LEASE
            .release(
                executor,
                message_id.0,
                worker,
                ReleaseOutcome::Retry {
                    due_at: Some(due_at),
                },
            )
            .await?;
        Ok(affected > 0)
    }

    /// Abandons the message permanently, returning the attachment id (if
    /// any) so the caller can delete the orphaned blob.
    pub async fn abandon<'e>(
        executor: impl SqliteExecutor<'e>,
        message_id: MessageId,
        worker: WorkerId,
    ) -> sqlx::Result<Option<AttachmentId>> {
        debug!(?message_id, "abandoning queued message");
        let row = sqlx::query(
            "DELETE FROM message_queue
             WHERE message_id = ? AND locked_by = ?
             RETURNING attachment_id",
        )
        .bind(message_id.0)
        .bind(worker.0)
        .fetch_optional(executor)
        .await?;

        Ok(row.and_then(|r| r.get::<Option<Uuid>, _>(0).map(AttachmentId)))
    }

    pub async fn renew<'e>(
        executor: impl SqliteExecutor<'e>,
        message_id: MessageId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        LEASE.renew(executor, message_id.0, worker, now).await
    }
}

#[cfg(test)]
#[path = "tests/message_queue_tests.rs"]
mod tests;
