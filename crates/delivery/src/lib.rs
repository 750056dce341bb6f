//! Outbound service of the delivery core.
//!
//! Protocol handlers enqueue work through the [`OutboundService`] handle,
//! in the same transaction as the state change that motivates it. A single
//! background task owns all side-effecting I/O: it polls the queues on an
//! interval, reacts to explicit work notifications, and drives the message,
//! receipt, resync, and timed-task loops with a fresh worker identity per
//! pass.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::domain::{
    AttachmentId, ChatId, CommitId, GroupId, LeafIndex, MaterialRef, MessageId,
    ProtocolMessageId, ReceiptStatus, TaskKind, WorkerId,
};
use storage::key_packages::KeyPackageRecord;
use storage::membership::MembershipRecord;
use storage::message_queue::QueuedMessage;
use storage::receipt_queue::QueuedReceipt;
use storage::resync_queue::ResyncRequest;
use storage::timed_tasks::TimedTask;
use storage::Storage;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{error, warn};

pub mod config;
pub mod error;
mod messages;
mod receipts;
mod resync;
mod tasks;
pub mod transport;

pub use config::DeliveryConfig;
pub use error::DeliveryError;
pub use transport::{AttachmentStore, GroupBackend, Transport, TransportError};

/// Observable outcomes of worker passes, for upstream consumers (UI state,
/// federation metrics). Lagging subscribers lose events, never block workers.
#[derive(Debug, Clone)]
pub enum DeliveryEvent {
    MessageSent {
        message_id: MessageId,
        chat_id: ChatId,
    },
    MessageAbandoned {
        message_id: MessageId,
    },
    ReceiptsSent {
        chat_id: ChatId,
        count: usize,
    },
    ResyncRepaired {
        chat_id: ChatId,
        new_leaf_index: LeafIndex,
    },
    /// Resync attempts are exhausted or the backend rejected the repair.
    /// The member must re-join out of band; this is user-visible.
    ResyncFailed {
        chat_id: ChatId,
        attempts: i64,
    },
}

pub struct OutboundService {
    storage: Storage,
    config: DeliveryConfig,
    tx: mpsc::Sender<OutboundServiceOp>,
    events: broadcast::Sender<DeliveryEvent>,
}

impl OutboundService {
    pub fn new(
        storage: Storage,
        config: DeliveryConfig,
        transport: Arc<dyn Transport>,
        groups: Arc<dyn GroupBackend>,
        attachments: Arc<dyn AttachmentStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(
            OutboundServiceTask {
                ctx: WorkerContext {
                    storage: storage.clone(),
                    config: config.clone(),
                    transport,
                    groups,
                    attachments,
                    events: events.clone(),
                },
                rx,
            }
            .run(),
        );
        Self {
            storage,
            config,
            tx,
            events,
        }
    }

    /// Begins processing. The service starts stopped so the embedding
    /// application can finish its own startup first.
    pub async fn start(&self) {
        self.tx.send(OutboundServiceOp::Start).await.ok();
    }

    pub async fn stop(&self) {
        self.tx.send(OutboundServiceOp::Stop).await.ok();
    }

    /// Pokes the worker without waiting for the next poll interval. Dropped
    /// silently when the op channel is full; the interval will catch up.
    pub fn notify_work(&self) {
        let _ = self.tx.try_send(OutboundServiceOp::Work);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Enqueues a chat message for delivery. Callable on an open transaction
    /// via [`QueuedMessage::enqueue`] directly; this wrapper additionally
    /// pokes the worker.
    pub async fn enqueue_message(
        &self,
        message_id: MessageId,
        chat_id: ChatId,
        attachment_id: Option<AttachmentId>,
    ) -> anyhow::Result<()> {
        QueuedMessage::enqueue(
            self.storage.pool(),
            message_id,
            chat_id,
            attachment_id,
            Utc::now(),
        )
        .await?;
        self.notify_work();
        Ok(())
    }

    pub async fn enqueue_receipt(
        &self,
        message_id: MessageId,
        chat_id: ChatId,
        protocol_message_id: &ProtocolMessageId,
        status: ReceiptStatus,
    ) -> anyhow::Result<()> {
        QueuedReceipt::enqueue(
            self.storage.pool(),
            message_id,
            chat_id,
            protocol_message_id,
            status,
            Utc::now(),
        )
        .await?;
        self.notify_work();
        Ok(())
    }

    pub async fn enqueue_resync(
        &self,
        group_id: &GroupId,
        chat_id: ChatId,
        group_state_key: &[u8],
        identity_wrapper_key: &[u8],
        original_leaf_index: LeafIndex,
    ) -> anyhow::Result<()> {
        ResyncRequest::enqueue(
            self.storage.pool(),
            group_id,
            chat_id,
            group_state_key,
            identity_wrapper_key,
            original_leaf_index,
            Utc::now(),
        )
        .await?;
        self.notify_work();
        Ok(())
    }

    pub async fn schedule_task(&self, kind: TaskKind, due_at: DateTime<Utc>) -> anyhow::Result<()> {
        TimedTask::schedule(self.storage.pool(), kind, due_at).await?;
        self.notify_work();
        Ok(())
    }

    /// Called by joining-material issuance whenever newer material
    /// invalidates a record ahead of its generation.
    pub async fn mark_material_superseded(&self, material_ref: &MaterialRef) -> anyhow::Result<bool> {
        Ok(KeyPackageRecord::mark_superseded(self.storage.pool(), material_ref).await?)
    }

    /// Promotes the membership records staged under `commit_id` to merged.
    /// Called by the commit-acceptance logic.
    pub async fn promote_membership(
        &self,
        group_id: &GroupId,
        commit_id: CommitId,
    ) -> anyhow::Result<u64> {
        let mut txn = self.storage.begin_immediate().await?;
        let promoted = MembershipRecord::merge_commit(&mut txn, group_id, commit_id, Utc::now()).await?;
        txn.commit().await?;
        Ok(promoted)
    }

    /// Discards the membership records staged under a rejected commit.
    pub async fn discard_membership(
        &self,
        group_id: &GroupId,
        commit_id: CommitId,
    ) -> anyhow::Result<u64> {
        Ok(MembershipRecord::discard_commit(self.storage.pool(), group_id, commit_id).await?)
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }
}

#[derive(Debug, Copy, Clone)]
enum OutboundServiceOp {
    Start,
    Stop,
    Work,
}

struct OutboundServiceTask {
    ctx: WorkerContext,
    rx: mpsc::Receiver<OutboundServiceOp>,
}

impl OutboundServiceTask {
    async fn run(mut self) {
        if let Err(error) =
            TimedTask::ensure_default_schedules(self.ctx.storage.pool(), Utc::now()).await
        {
            error!(%error, "failed to seed timed task schedules");
        }

        let mut ticker = tokio::time::interval(self.ctx.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut is_stopped = true; // initial state is being stopped
        loop {
            let op = tokio::select! {
                op = self.rx.recv() => match op {
                    Some(op) => op,
                    None => return, // all handles dropped
                },
                _ = ticker.tick() => OutboundServiceOp::Work,
            };

            match op {
                OutboundServiceOp::Start => is_stopped = false,
                OutboundServiceOp::Stop => {
                    is_stopped = true;
                    continue;
                }
                OutboundServiceOp::Work if is_stopped => continue,
                OutboundServiceOp::Work => {}
            }

            self.ctx.work_once().await;
        }
    }
}

/// Shared state of one worker pass over the four queues.
pub(crate) struct WorkerContext {
    pub(crate) storage: Storage,
    pub(crate) config: DeliveryConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) groups: Arc<dyn GroupBackend>,
    pub(crate) attachments: Arc<dyn AttachmentStore>,
    pub(crate) events: broadcast::Sender<DeliveryEvent>,
}

impl WorkerContext {
    /// One full pass: messages, receipts, resyncs, due maintenance. A fresh
    /// worker identity per pass keeps a restarted worker from mistaking a
    /// predecessor's leases for its own.
    pub(crate) async fn work_once(&self) {
        let worker = WorkerId::random();

        if let Err(error) = self.send_queued_messages(worker).await {
            self.log_pass_error("messages", &error);
        }
        if let Err(error) = self.send_queued_receipts(worker).await {
            self.log_pass_error("receipts", &error);
        }
        if let Err(error) = self.perform_queued_resyncs(worker).await {
            self.log_pass_error("resyncs", &error);
        }
        if let Err(error) = self.run_due_tasks(worker).await {
            self.log_pass_error("timed tasks", &error);
        }
    }

    fn log_pass_error(&self, pass: &str, error: &DeliveryError) {
        if error.is_transient() {
            warn!(pass, %error, "worker pass failed; will retry on next poll");
        } else {
            error!(pass, %error, "worker pass failed");
        }
    }

    pub(crate) fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.config.lease_duration
    }

    pub(crate) fn emit(&self, event: DeliveryEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
