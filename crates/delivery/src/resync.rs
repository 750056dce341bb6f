//! Resync coordinator loop.
//!
//! One request per group is leased at a time; the repair re-derives the
//! member's cryptographic view from the authoritative state through the
//! group backend. Attempts are bounded: exhaustion drops the request and
//! surfaces a fatal event, because further automatic retries against a
//! diverged snapshot cannot make progress.

use chrono::Utc;
use shared::domain::WorkerId;
use storage::resync_queue::ResyncRequest;
use tracing::{debug, error, warn};

use crate::error::DeliveryError;
use crate::transport::TransportError;
use crate::{DeliveryEvent, WorkerContext};

impl WorkerContext {
    pub(crate) async fn perform_queued_resyncs(&self, worker: WorkerId) -> Result<(), DeliveryError> {
        loop {
            let now = Utc::now();
            let Some(request) = ResyncRequest::claim_next(
                self.storage.pool(),
                worker,
                now,
                self.stale_before(now),
            )
            .await?
            else {
                return Ok(());
            };
            debug!(chat_id = ?request.chat_id, attempts = request.attempts, "dequeued resync");

            match self.groups.rejoin(&request).await {
                Ok(new_leaf_index) => {
                    ResyncRequest::complete(self.storage.pool(), &request.group_id, worker).await?;
                    self.emit(DeliveryEvent::ResyncRepaired {
                        chat_id: request.chat_id,
                        new_leaf_index,
                    });
                }
                Err(TransportError::Permanent(cause)) => {
                    error!(chat_id = ?request.chat_id, %cause, "resync rejected; dropping");
                    ResyncRequest::abandon(self.storage.pool(), &request.group_id, worker).await?;
                    self.emit(DeliveryEvent::ResyncFailed {
                        chat_id: request.chat_id,
                        attempts: request.attempts,
                    });
                }
                Err(TransportError::Transient(cause)) => {
                    if request.attempts >= self.config.resync_max_attempts {
                        error!(
                            chat_id = ?request.chat_id,
                            attempts = request.attempts,
                            %cause,
                            "resync attempts exhausted; member must re-join out of band"
                        );
                        ResyncRequest::abandon(self.storage.pool(), &request.group_id, worker)
                            .await?;
                        self.emit(DeliveryEvent::ResyncFailed {
                            chat_id: request.chat_id,
                            attempts: request.attempts,
                        });
                    } else {
                        let exponent = (request.attempts - 1).clamp(0, 6) as u32;
                        let backoff = self.config.resync_backoff_base * (1i32 << exponent);
                        warn!(chat_id = ?request.chat_id, attempts = request.attempts, %cause, "resync failed; will retry");
                        ResyncRequest::fail_attempt(
                            self.storage.pool(),
                            &request.group_id,
                            worker,
                            Utc::now() + backoff,
                        )
                        .await?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/resync_tests.rs"]
mod tests;
