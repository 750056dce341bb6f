//! Receipt send loop.

use chrono::Utc;
use shared::domain::WorkerId;
use storage::receipt_queue::QueuedReceipt;
use tracing::{debug, warn};

use crate::error::DeliveryError;
use crate::transport::TransportError;
use crate::{DeliveryEvent, WorkerContext};

impl WorkerContext {
    /// Sends coalesced per-chat receipt batches until nothing is claimable.
    pub(crate) async fn send_queued_receipts(&self, worker: WorkerId) -> Result<(), DeliveryError> {
        loop {
            let now = Utc::now();
            let Some(batch) = QueuedReceipt::claim_chat_batch(
                self.storage.pool(),
                worker,
                now,
                self.stale_before(now),
            )
            .await?
            else {
                return Ok(());
            };
            debug!(chat_id = ?batch.chat_id, count = batch.receipts.len(), "claimed receipt batch");

            match self
                .transport
                .send_receipts(batch.chat_id, &batch.receipts)
                .await
            {
                Ok(()) => {
                    QueuedReceipt::ack(self.storage.pool(), batch.dequeue_id, worker).await?;
                    self.emit(DeliveryEvent::ReceiptsSent {
                        chat_id: batch.chat_id,
                        count: batch.receipts.len(),
                    });
                }
                Err(TransportError::Transient(error)) => {
                    warn!(chat_id = ?batch.chat_id, %error, "receipt send failed; requeueing");
                    QueuedReceipt::nack(self.storage.pool(), batch.dequeue_id, worker).await?;
                    // A nacked batch is immediately claimable again; stop
                    // here and let the next poll retry instead of spinning
                    // against an unreachable peer.
                    return Ok(());
                }
                Err(TransportError::Permanent(error)) => {
                    // The recipient will never take these. Receipts carry no
                    // payload worth preserving, so drop the batch.
                    warn!(chat_id = ?batch.chat_id, %error, "receipt send rejected; dropping batch");
                    QueuedReceipt::ack(self.storage.pool(), batch.dequeue_id, worker).await?;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/receipts_tests.rs"]
mod tests;
