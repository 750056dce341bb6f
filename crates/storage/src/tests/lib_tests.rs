use chrono::Utc;
use shared::domain::{ChatId, GroupId, LeafIndex, MessageId};

use super::*;
use crate::{message_queue::QueuedMessage, resync_queue::ResyncRequest};

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("delivery_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("delivery.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn deleting_message_cascades_to_queue_row() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let message_id = MessageId::random();
    let chat_id = ChatId::random();
    let now = Utc::now();

    storage
        .insert_message(message_id, chat_id, now)
        .await
        .expect("message");
    QueuedMessage::enqueue(storage.pool(), message_id, chat_id, None, now)
        .await
        .expect("enqueue");

    assert!(storage.delete_message(message_id).await.expect("delete"));

    let depth = crate::message_queue::LEASE
        .depth(storage.pool())
        .await
        .expect("depth");
    assert_eq!(depth, 0);
}

#[tokio::test]
async fn deleting_group_cascades_to_resync_row() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let group_id = GroupId(b"cascade-group".to_vec());
    let chat_id = ChatId::random();
    let now = Utc::now();

    storage
        .insert_group(&group_id, chat_id, now)
        .await
        .expect("group");
    ResyncRequest::enqueue(
        storage.pool(),
        &group_id,
        chat_id,
        b"state-key",
        b"wrapper-key",
        LeafIndex(3),
        now,
    )
    .await
    .expect("enqueue");

    assert!(storage.delete_group(&group_id).await.expect("delete"));

    assert!(!ResyncRequest::is_pending_for_chat(storage.pool(), chat_id)
        .await
        .expect("pending"));
}
