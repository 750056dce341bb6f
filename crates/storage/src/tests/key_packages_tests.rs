use chrono::Utc;

use super::*;
use crate::Storage;

const LIVE_WINDOW: i64 = 2;
const RETAIN: i64 = 2;

async fn storage() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

fn refs(tag: u8) -> Vec<(MaterialRef, Vec<u8>)> {
    (0..3)
        .map(|i| (MaterialRef(vec![tag, i]), vec![0xAB, tag, i]))
        .collect()
}

async fn install(storage: &Storage, packages: &[(MaterialRef, Vec<u8>)]) -> i64 {
    let mut txn = storage.begin_immediate().await.expect("txn");
    let generation = KeyPackageRecord::install_generation(&mut txn, packages, LIVE_WINDOW, Utc::now())
        .await
        .expect("install");
    txn.commit().await.expect("commit");
    generation
}

async fn sweep(storage: &Storage) -> u64 {
    let mut txn = storage.begin_immediate().await.expect("txn");
    let deleted = KeyPackageRecord::sweep(&mut txn, RETAIN).await.expect("sweep");
    txn.commit().await.expect("commit");
    deleted
}

#[tokio::test]
async fn two_most_recent_generations_stay_live() {
    let storage = storage().await;
    let g1 = refs(1);
    let g2 = refs(2);
    let g3 = refs(3);

    install(&storage, &g1).await;
    install(&storage, &g2).await;

    // Both generations live: a peer may still hold a G1 package.
    for (material_ref, _) in g1.iter().chain(g2.iter()) {
        assert_eq!(
            KeyPackageRecord::is_live(storage.pool(), material_ref)
                .await
                .expect("is_live"),
            Some(true)
        );
    }

    install(&storage, &g3).await;

    for (material_ref, _) in &g1 {
        assert_eq!(
            KeyPackageRecord::is_live(storage.pool(), material_ref)
                .await
                .expect("is_live"),
            Some(false),
            "generation 1 must be superseded after the second rotation"
        );
    }
    for (material_ref, _) in g2.iter().chain(g3.iter()) {
        assert_eq!(
            KeyPackageRecord::is_live(storage.pool(), material_ref)
                .await
                .expect("is_live"),
            Some(true)
        );
    }
}

#[tokio::test]
async fn sweep_honors_retention_window() {
    let storage = storage().await;
    let g1 = refs(1);
    let g2 = refs(2);
    let g3 = refs(3);

    install(&storage, &g1).await;
    install(&storage, &g2).await;

    // Two generations, both within the retention window: nothing to do.
    assert_eq!(sweep(&storage).await, 0);

    install(&storage, &g3).await;

    // G1 is now superseded and two rounds old; G2 is superseded by nothing
    // and must survive.
    assert_eq!(sweep(&storage).await, g1.len() as u64);
    for (material_ref, _) in &g1 {
        assert_eq!(
            KeyPackageRecord::is_live(storage.pool(), material_ref)
                .await
                .expect("is_live"),
            None,
            "swept record must be gone entirely"
        );
    }
    for (material_ref, _) in &g2 {
        assert!(KeyPackageRecord::is_live(storage.pool(), material_ref)
            .await
            .expect("is_live")
            .is_some());
    }

    assert_eq!(
        KeyPackageRecord::count(storage.pool()).await.expect("count"),
        (g2.len() + g3.len()) as i64
    );
}

#[tokio::test]
async fn sweep_of_empty_tracker_is_a_noop() {
    let storage = storage().await;
    assert_eq!(sweep(&storage).await, 0);
}

#[tokio::test]
async fn mark_superseded_clears_liveness_early() {
    let storage = storage().await;
    let g1 = refs(1);
    install(&storage, &g1).await;

    let (target, _) = &g1[0];
    assert!(KeyPackageRecord::mark_superseded(storage.pool(), target)
        .await
        .expect("mark"));
    assert_eq!(
        KeyPackageRecord::is_live(storage.pool(), target)
            .await
            .expect("is_live"),
        Some(false)
    );

    let live = KeyPackageRecord::live_refs(storage.pool())
        .await
        .expect("live refs");
    assert_eq!(live.len(), g1.len() - 1);
}
