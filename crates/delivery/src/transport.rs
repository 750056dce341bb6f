//! Collaborator seams of the delivery core.
//!
//! The workers own all side-effecting I/O but never implement it; the
//! transport, the group backend, and the attachment store are injected so
//! the queue logic stays independent of any concrete federation stack.

use anyhow::anyhow;
use async_trait::async_trait;
use shared::domain::{AttachmentId, ChatId, LeafIndex, ProtocolMessageId, ReceiptStatus};
use storage::message_queue::QueuedMessage;
use storage::resync_queue::ResyncRequest;

/// Outcome classification of an outbound call.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transient transport failure: {0}")]
    Transient(anyhow::Error),
    #[error("permanent transport failure: {0}")]
    Permanent(anyhow::Error),
}

impl TransportError {
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self::Transient(error.into())
    }

    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(error.into())
    }
}

/// Sends leased outbox items to recipients and federated peers.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(&self, message: &QueuedMessage) -> Result<(), TransportError>;

    /// Sends a coalesced batch of receipts bound for one chat.
    async fn send_receipts(
        &self,
        chat_id: ChatId,
        receipts: &[(ProtocolMessageId, ReceiptStatus)],
    ) -> Result<(), TransportError>;
}

/// Authoritative group state access used by the resync coordinator.
#[async_trait]
pub trait GroupBackend: Send + Sync {
    /// Fetches the authoritative group state and rejoins the member via an
    /// external commit. Returns the leaf index assigned by the repair.
    async fn rejoin(&self, request: &ResyncRequest) -> Result<LeafIndex, TransportError>;
}

/// Blob store holding message attachments.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn delete(&self, attachment_id: AttachmentId) -> anyhow::Result<()>;
}

pub struct MissingTransport;

#[async_trait]
impl Transport for MissingTransport {
    async fn send_message(&self, message: &QueuedMessage) -> Result<(), TransportError> {
        Err(TransportError::transient(anyhow!(
            "transport unavailable for message {:?}",
            message.message_id
        )))
    }

    async fn send_receipts(
        &self,
        chat_id: ChatId,
        _receipts: &[(ProtocolMessageId, ReceiptStatus)],
    ) -> Result<(), TransportError> {
        Err(TransportError::transient(anyhow!(
            "transport unavailable for chat {:?}",
            chat_id
        )))
    }
}

pub struct MissingGroupBackend;

#[async_trait]
impl GroupBackend for MissingGroupBackend {
    async fn rejoin(&self, request: &ResyncRequest) -> Result<LeafIndex, TransportError> {
        Err(TransportError::transient(anyhow!(
            "group backend unavailable for chat {:?}",
            request.chat_id
        )))
    }
}

/// For deployments without attachment blobs; deleting is a no-op.
pub struct NoopAttachmentStore;

#[async_trait]
impl AttachmentStore for NoopAttachmentStore {
    async fn delete(&self, _attachment_id: AttachmentId) -> anyhow::Result<()> {
        Ok(())
    }
}
