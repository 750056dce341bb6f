//! Message send loop.

use chrono::Utc;
use shared::domain::WorkerId;
use storage::message_queue::QueuedMessage;
use tracing::{debug, warn};

use crate::error::DeliveryError;
use crate::transport::TransportError;
use crate::{DeliveryEvent, WorkerContext};

impl WorkerContext {
    /// Claims batches of queued messages oldest first and sends each one.
    /// Transient failures reschedule with backoff, permanent failures
    /// abandon the message and delete its attachment. Runs until nothing
    /// is claimable.
    pub(crate) async fn send_queued_messages(&self, worker: WorkerId) -> Result<(), DeliveryError> {
        loop {
            let now = Utc::now();
            let batch = QueuedMessage::claim_batch(
                self.storage.pool(),
                worker,
                now,
                self.stale_before(now),
                self.config.claim_batch_size,
            )
            .await?;
            if batch.is_empty() {
                return Ok(());
            }
            debug!(count = batch.len(), "claimed message batch");

            for message in batch {
                // The send may outlive the lease on a slow link; renew
                // first and skip the message if the lease is already gone.
                if !QueuedMessage::renew(self.storage.pool(), message.message_id, worker, Utc::now())
                    .await?
                {
                    continue;
                }

                match self.transport.send_message(&message).await {
                    Ok(()) => {
                        if QueuedMessage::ack(self.storage.pool(), message.message_id, worker)
                            .await?
                        {
                            self.emit(DeliveryEvent::MessageSent {
                                message_id: message.message_id,
                                chat_id: message.chat_id,
                            });
                        }
                    }
                    Err(TransportError::Transient(error)) => {
                        warn!(message_id = ?message.message_id, %error, "message send failed; rescheduling");
                        QueuedMessage::nack_transient(
                            self.storage.pool(),
                            message.message_id,
                            worker,
                            Utc::now() + self.config.message_retry_backoff,
                        )
                        .await?;
                    }
                    Err(TransportError::Permanent(error)) => {
                        warn!(message_id = ?message.message_id, %error, "message send failed permanently; abandoning");
                        let attachment_id =
                            QueuedMessage::abandon(self.storage.pool(), message.message_id, worker)
                                .await?;
                        // Attachment cleanup happens after the delete is
                        // committed; a failure here leaves only an orphaned
                        // blob, never a stuck queue row.
                        if let Some(attachment_id) = attachment_id {
                            if let Err(error) = self.attachments.delete(attachment_id).await {
                                warn!(?attachment_id, %error, "failed to delete orphaned attachment");
                            }
                        }
                        self.emit(DeliveryEvent::MessageAbandoned {
                            message_id: message.message_id,
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
