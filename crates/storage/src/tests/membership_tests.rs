use chrono::Utc;
use shared::domain::ChatId;

use super::*;
use crate::Storage;

async fn storage_with_group(group_id: &GroupId) -> Storage {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .insert_group(group_id, ChatId::random(), Utc::now())
        .await
        .expect("group");
    storage
}

fn member(n: u8) -> QualifiedUserId {
    QualifiedUserId {
        user_id: Uuid::new_v4(),
        domain: format!("node{n}.example.com"),
    }
}

async fn stage(
    storage: &Storage,
    group_id: &GroupId,
    leaf: u32,
    change: StagedChange,
    member: &QualifiedUserId,
    commit_id: CommitId,
) {
    MembershipRecord::stage(
        storage.pool(),
        group_id,
        LeafIndex(leaf),
        change,
        member,
        commit_id,
        Utc::now(),
    )
    .await
    .expect("stage");
}

async fn merge(storage: &Storage, group_id: &GroupId, commit_id: CommitId) -> u64 {
    let mut txn = storage.begin_immediate().await.expect("txn");
    let promoted = MembershipRecord::merge_commit(&mut txn, group_id, commit_id, Utc::now())
        .await
        .expect("merge");
    txn.commit().await.expect("commit");
    promoted
}

#[tokio::test]
async fn merge_promotes_all_staged_changes_at_once() {
    let group_id = GroupId(vec![1; 16]);
    let storage = storage_with_group(&group_id).await;

    // Leaf 0 is already a merged member and gets removed by this commit.
    let founder = member(0);
    let founding = CommitId::random();
    stage(&storage, &group_id, 0, StagedChange::Add, &founder, founding).await;
    merge(&storage, &group_id, founding).await;

    let alice = member(1);
    let bob = member(2);
    let commit_id = CommitId::random();
    stage(&storage, &group_id, 0, StagedChange::Removal, &founder, commit_id).await;
    stage(&storage, &group_id, 1, StagedChange::Add, &alice, commit_id).await;
    stage(&storage, &group_id, 2, StagedChange::Add, &bob, commit_id).await;

    assert_eq!(merge(&storage, &group_id, commit_id).await, 2);

    let merged = MembershipRecord::merged_members(storage.pool(), &group_id)
        .await
        .expect("merged");
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].leaf_index, LeafIndex(1));
    assert_eq!(merged[0].member, alice);
    assert_eq!(merged[1].leaf_index, LeafIndex(2));
    assert_eq!(merged[1].member, bob);
    assert!(merged.iter().all(|r| r.commit_id.is_none()));

    // No staged leftovers from either commit.
    let all = MembershipRecord::all_records(storage.pool(), &group_id)
        .await
        .expect("all");
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn discard_leaves_merged_state_untouched() {
    let group_id = GroupId(vec![2; 16]);
    let storage = storage_with_group(&group_id).await;

    let alice = member(1);
    let founding = CommitId::random();
    stage(&storage, &group_id, 0, StagedChange::Add, &alice, founding).await;
    merge(&storage, &group_id, founding).await;

    let rejected = CommitId::random();
    stage(&storage, &group_id, 0, StagedChange::Removal, &alice, rejected).await;
    stage(&storage, &group_id, 1, StagedChange::Add, &member(2), rejected).await;

    let discarded = MembershipRecord::discard_commit(storage.pool(), &group_id, rejected)
        .await
        .expect("discard");
    assert_eq!(discarded, 2);

    let merged = MembershipRecord::merged_members(storage.pool(), &group_id)
        .await
        .expect("merged");
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].leaf_index, LeafIndex(0));
    assert_eq!(merged[0].member, alice);
}

#[tokio::test]
async fn update_replaces_merged_record_for_reused_leaf() {
    let group_id = GroupId(vec![3; 16]);
    let storage = storage_with_group(&group_id).await;

    let alice = member(1);
    let founding = CommitId::random();
    stage(&storage, &group_id, 3, StagedChange::Add, &alice, founding).await;
    merge(&storage, &group_id, founding).await;

    let rotated = member(1);
    let update = CommitId::random();
    stage(&storage, &group_id, 3, StagedChange::Update, &rotated, update).await;
    assert_eq!(merge(&storage, &group_id, update).await, 1);

    let merged = MembershipRecord::merged_members(storage.pool(), &group_id)
        .await
        .expect("merged");
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].member, rotated);
    assert_eq!(merged[0].stage, MembershipStage::Merged);
}

#[tokio::test]
async fn group_deletion_cascades_to_membership() {
    let group_id = GroupId(vec![4; 16]);
    let storage = storage_with_group(&group_id).await;

    let founding = CommitId::random();
    stage(&storage, &group_id, 0, StagedChange::Add, &member(1), founding).await;
    merge(&storage, &group_id, founding).await;

    assert!(storage.delete_group(&group_id).await.expect("delete"));

    let all = MembershipRecord::all_records(storage.pool(), &group_id)
        .await
        .expect("all");
    assert!(all.is_empty());
}

#[tokio::test]
async fn purge_removes_records_orphaned_out_of_band() {
    let group_id = GroupId(vec![5; 16]);
    let storage = storage_with_group(&group_id).await;

    let founding = CommitId::random();
    stage(&storage, &group_id, 0, StagedChange::Add, &member(1), founding).await;
    merge(&storage, &group_id, founding).await;

    // Fabricate an orphan by deleting the group with enforcement off on a
    // dedicated connection, bypassing the cascade.
    let mut conn = storage.pool().acquire().await.expect("conn");
    sqlx::query("PRAGMA foreign_keys = OFF")
        .execute(&mut *conn)
        .await
        .expect("pragma off");
    sqlx::query("DELETE FROM chat_groups WHERE group_id = ?")
        .bind(group_id.as_slice())
        .execute(&mut *conn)
        .await
        .expect("raw delete");
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&mut *conn)
        .await
        .expect("pragma on");
    drop(conn);

    let purged = MembershipRecord::purge_orphaned(storage.pool())
        .await
        .expect("purge");
    assert_eq!(purged, 1);

    let all = MembershipRecord::all_records(storage.pool(), &group_id)
        .await
        .expect("all");
    assert!(all.is_empty());
}
