//! Scripted collaborator doubles shared by the worker loop tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use shared::domain::{AttachmentId, ChatId, LeafIndex, MessageId, ProtocolMessageId, ReceiptStatus};
use storage::message_queue::QueuedMessage;
use storage::resync_queue::ResyncRequest;
use storage::Storage;
use tokio::sync::broadcast;

use crate::transport::{AttachmentStore, GroupBackend, Transport, TransportError};
use crate::{DeliveryConfig, DeliveryEvent, WorkerContext};

/// Plays back a script of outcomes, then succeeds for every further call.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    pub(crate) sent_messages: Mutex<Vec<MessageId>>,
    pub(crate) sent_receipt_batches: Mutex<Vec<(ChatId, Vec<(ProtocolMessageId, ReceiptStatus)>)>>,
}

impl ScriptedTransport {
    pub(crate) fn push_outcome(&self, outcome: Result<(), TransportError>) {
        self.script.lock().expect("script lock").push_back(outcome);
    }

    fn next_outcome(&self) -> Result<(), TransportError> {
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_message(&self, message: &QueuedMessage) -> Result<(), TransportError> {
        let outcome = self.next_outcome();
        if outcome.is_ok() {
            self.sent_messages
                .lock()
                .expect("sent lock")
                .push(message.message_id);
        }
        outcome
    }

    async fn send_receipts(
        &self,
        chat_id: ChatId,
        receipts: &[(ProtocolMessageId, ReceiptStatus)],
    ) -> Result<(), TransportError> {
        let outcome = self.next_outcome();
        if outcome.is_ok() {
            self.sent_receipt_batches
                .lock()
                .expect("sent lock")
                .push((chat_id, receipts.to_vec()));
        }
        outcome
    }
}

#[derive(Default)]
pub(crate) struct ScriptedGroupBackend {
    script: Mutex<VecDeque<Result<LeafIndex, TransportError>>>,
    pub(crate) rejoined_chats: Mutex<Vec<ChatId>>,
}

impl ScriptedGroupBackend {
    pub(crate) fn push_outcome(&self, outcome: Result<LeafIndex, TransportError>) {
        self.script.lock().expect("script lock").push_back(outcome);
    }
}

#[async_trait]
impl GroupBackend for ScriptedGroupBackend {
    async fn rejoin(&self, request: &ResyncRequest) -> Result<LeafIndex, TransportError> {
        let outcome = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Ok(LeafIndex(0)));
        if outcome.is_ok() {
            self.rejoined_chats
                .lock()
                .expect("rejoined lock")
                .push(request.chat_id);
        }
        outcome
    }
}

#[derive(Default)]
pub(crate) struct RecordingAttachmentStore {
    pub(crate) deleted: Mutex<Vec<AttachmentId>>,
}

#[async_trait]
impl AttachmentStore for RecordingAttachmentStore {
    async fn delete(&self, attachment_id: AttachmentId) -> anyhow::Result<()> {
        self.deleted.lock().expect("deleted lock").push(attachment_id);
        Ok(())
    }
}

pub(crate) struct TestHarness {
    pub(crate) ctx: WorkerContext,
    pub(crate) storage: Storage,
    pub(crate) transport: Arc<ScriptedTransport>,
    pub(crate) groups: Arc<ScriptedGroupBackend>,
    pub(crate) attachments: Arc<RecordingAttachmentStore>,
    pub(crate) events: broadcast::Receiver<DeliveryEvent>,
}

pub(crate) async fn harness() -> TestHarness {
    harness_with_config(DeliveryConfig::default()).await
}

pub(crate) async fn harness_with_config(config: DeliveryConfig) -> TestHarness {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let transport = Arc::new(ScriptedTransport::default());
    let groups = Arc::new(ScriptedGroupBackend::default());
    let attachments = Arc::new(RecordingAttachmentStore::default());
    let (events_tx, events) = broadcast::channel(64);

    let ctx = WorkerContext {
        storage: storage.clone(),
        config,
        transport: transport.clone(),
        groups: groups.clone(),
        attachments: attachments.clone(),
        events: events_tx,
    };

    TestHarness {
        ctx,
        storage,
        transport,
        groups,
        attachments,
        events,
    }
}

pub(crate) fn drain_events(rx: &mut broadcast::Receiver<DeliveryEvent>) -> Vec<DeliveryEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
