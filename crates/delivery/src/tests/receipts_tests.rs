use anyhow::anyhow;
use chrono::Utc;
use shared::domain::{ChatId, MessageId, ProtocolMessageId, ReceiptStatus, WorkerId};
use storage::receipt_queue;

use crate::test_support::{drain_events, harness, TestHarness};
use crate::transport::TransportError;
use crate::DeliveryEvent;

use super::*;

async fn enqueue(h: &TestHarness, chat_id: ChatId, tag: u8, status: ReceiptStatus) {
    let message_id = MessageId::random();
    h.storage
        .insert_message(message_id, chat_id, Utc::now())
        .await
        .expect("message");
    QueuedReceipt::enqueue(
        h.storage.pool(),
        message_id,
        chat_id,
        &ProtocolMessageId(vec![tag; 8]),
        status,
        Utc::now(),
    )
    .await
    .expect("enqueue");
}

#[tokio::test]
async fn coalesces_chat_receipts_into_one_send() {
    let mut h = harness().await;
    let chat_id = ChatId::random();
    enqueue(&h, chat_id, 1, ReceiptStatus::Delivered).await;
    enqueue(&h, chat_id, 2, ReceiptStatus::Read).await;

    h.ctx
        .send_queued_receipts(WorkerId::random())
        .await
        .expect("pass");

    let batches = h.transport.sent_receipt_batches.lock().expect("sent").clone();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].0, chat_id);
    assert_eq!(batches[0].1.len(), 2);
    assert_eq!(
        receipt_queue::LEASE.depth(h.storage.pool()).await.expect("depth"),
        0
    );

    let events = drain_events(&mut h.events);
    assert!(matches!(
        events.as_slice(),
        [DeliveryEvent::ReceiptsSent { chat_id: c, count: 2 }] if *c == chat_id
    ));
}

#[tokio::test]
async fn drains_multiple_chats_in_one_pass() {
    let h = harness().await;
    enqueue(&h, ChatId::random(), 1, ReceiptStatus::Delivered).await;
    enqueue(&h, ChatId::random(), 2, ReceiptStatus::Delivered).await;

    h.ctx
        .send_queued_receipts(WorkerId::random())
        .await
        .expect("pass");

    assert_eq!(h.transport.sent_receipt_batches.lock().expect("sent").len(), 2);
    assert_eq!(
        receipt_queue::LEASE.depth(h.storage.pool()).await.expect("depth"),
        0
    );
}

#[tokio::test]
async fn transient_failure_requeues_batch_and_stops_the_pass() {
    let mut h = harness().await;
    let chat_id = ChatId::random();
    enqueue(&h, chat_id, 1, ReceiptStatus::Delivered).await;
    enqueue(&h, chat_id, 2, ReceiptStatus::Read).await;
    h.transport
        .push_outcome(Err(TransportError::transient(anyhow!("peer unreachable"))));

    h.ctx
        .send_queued_receipts(WorkerId::random())
        .await
        .expect("pass");

    assert_eq!(
        receipt_queue::LEASE.depth(h.storage.pool()).await.expect("depth"),
        2
    );
    assert!(drain_events(&mut h.events).is_empty());

    // The requeued batch is claimable again on the next pass.
    h.ctx
        .send_queued_receipts(WorkerId::random())
        .await
        .expect("second pass");
    assert_eq!(h.transport.sent_receipt_batches.lock().expect("sent").len(), 1);
    assert_eq!(
        receipt_queue::LEASE.depth(h.storage.pool()).await.expect("depth"),
        0
    );
}

#[tokio::test]
async fn permanent_failure_drops_batch_silently() {
    let mut h = harness().await;
    let chat_id = ChatId::random();
    enqueue(&h, chat_id, 1, ReceiptStatus::Delivered).await;
    h.transport
        .push_outcome(Err(TransportError::permanent(anyhow!("recipient gone"))));

    h.ctx
        .send_queued_receipts(WorkerId::random())
        .await
        .expect("pass");

    assert_eq!(
        receipt_queue::LEASE.depth(h.storage.pool()).await.expect("depth"),
        0
    );
    assert!(drain_events(&mut h.events).is_empty());
}
