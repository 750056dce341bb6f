//! Outbox for delivery/read receipts.
//!
//! The primary key is (message_id, status), so enqueueing the same receipt
//! twice is a storage-level no-op; deduplication survives crashes because
//! it lives in the schema, not in memory. Claims coalesce every claimable
//! receipt bound for one chat into a single batch tagged with a fresh
//! dequeue id, which later identifies exactly the claimed rows even if new
//! receipts for the same chat arrived in the meantime.

use chrono::{DateTime, Utc};
use shared::domain::{ChatId, MessageId, ProtocolMessageId, ReceiptStatus, WorkerId};
use sqlx::{Row, SqliteExecutor, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::lease::{LeaseQueue, ReleaseOutcome};

pub const LEASE: LeaseQueue = LeaseQueue::new("receipt_queue", "dequeue_id");

/// Identifier of a single claim operation; deletes are keyed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeueId(Uuid);

impl DequeueId {
    fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// All claimable receipts for one chat, claimed together so the transport
/// can coalesce them into one outbound call.
#[derive(Debug)]
pub struct ReceiptBatch {
    pub dequeue_id: DequeueId,
    pub chat_id: ChatId,
    pub receipts: Vec<(ProtocolMessageId, ReceiptStatus)>,
}

pub struct QueuedReceipt;

impl QueuedReceipt {
    /// Enqueues a receipt. Idempotent on (message_id, status).
    pub async fn enqueue<'e>(
        executor: impl SqliteExecutor<'e>,
        message_id: MessageId,
        chat_id: ChatId,
        protocol_message_id: &ProtocolMessageId,
        status: ReceiptStatus,
        now: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        debug!(?message_id, ?chat_id, status = status.as_str(), "enqueueing receipt");

        sqlx::query(
            "INSERT INTO receipt_queue
                (message_id, status, chat_id, protocol_message_id, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(message_id.0)
        .bind(status.as_str())
        .bind(chat_id.0)
        .bind(protocol_message_id.as_slice())
        .bind(now)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Claims every claimable receipt of the chat with the oldest claimable
    /// receipt. Returns `None` when nothing is claimable.
    pub async fn claim_chat_batch(
        pool: &SqlitePool,
        worker: WorkerId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> sqlx::Result<Option<ReceiptBatch>> {
        let mut txn = pool.begin_with("BEGIN IMMEDIATE").await?;

        let chat_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT chat_id
             FROM receipt_queue
             WHERE locked_by IS NULL OR locked_at < ?
             ORDER BY created_at ASC
             LIMIT 1",
        )
        .bind(stale_before)
        .fetch_optional(txn.as_mut())
        .await?;
        let Some(chat_id) = chat_id else {
            return Ok(None);
        };

        let dequeue_id = DequeueId::random();

        let rows = sqlx::query(
            "UPDATE receipt_queue
             SET locked_by = ?, locked_at = ?, dequeue_id = ?
             WHERE chat_id = ? AND (locked_by IS NULL OR locked_at < ?)
             RETURNING protocol_message_id, status",
        )
        .bind(worker.0)
        .bind(now)
        .bind(dequeue_id.0)
        .bind(chat_id)
        .bind(stale_before)
        .fetch_all(txn.as_mut())
        .await?;

        txn.commit().await?;

        let receipts = rows
            .into_iter()
            .map(|r| {
                let protocol_message_id = ProtocolMessageId(r.get::<Vec<u8>, _>(0));
                let status = ReceiptStatus::parse(r.get::<&str, _>(1))
                    .map_err(|e| sqlx::Error::Decode(e.into()))?;
                Ok((protocol_message_id, status))
            })
            .collect::<sqlx::Result<Vec<_>>>()?;

        Ok(Some(ReceiptBatch {
            dequeue_id,
            chat_id: ChatId(chat_id),
            receipts,
        }))
    }

    /// Deletes the rows of an acknowledged batch.
    pub async fn ack<'e>(
        executor: impl SqliteExecutor<'e>,
        dequeue_id: DequeueId,
        worker: WorkerId,
    ) -> sqlx::Result<u64> {
        LEASE
            .release(executor, dequeue_id.0, worker, ReleaseOutcome::Completed)
            .await
    }

    /// Returns an unsent batch to the queue by clearing its locks.
    pub async fn nack<'e>(
        executor: impl SqliteExecutor<'e>,
        dequeue_id: DequeueId,
        worker: WorkerId,
    ) -> sqlx::Result<u64> {
        LEASE
            .release(
                executor,
                dequeue_id.0,
                worker,
                ReleaseOutcome::Retry { due_at: None },
            )
            .await
    }
}

#[cfg(test)]
#[path = "tests/receipt_queue_tests.rs"]
mod tests;
