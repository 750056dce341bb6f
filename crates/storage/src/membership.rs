//! Ledger of staged and merged group membership records.
//!
//! A commit proposal stages one record per affected leaf; accepting the
//! commit promotes all of them to merged in one transaction, rejecting it
//! discards them without touching merged state. After a crash, recovery
//! can tell "proposal abandoned" (staged rows, merged untouched) from
//! "proposal applied" (merged rows updated) and replay accordingly.

use chrono::{DateTime, Utc};
use shared::domain::{CommitId, GroupId, LeafIndex, MembershipStage, QualifiedUserId};
use sqlx::{Row, SqliteExecutor, SqliteTransaction};
use tracing::debug;
use uuid::Uuid;

/// Membership change carried by a staged commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedChange {
    Add,
    Update,
    Removal,
}

impl StagedChange {
    fn stage(self) -> MembershipStage {
        match self {
            StagedChange::Add => MembershipStage::StagedAdd,
            StagedChange::Update => MembershipStage::StagedUpdate,
            StagedChange::Removal => MembershipStage::StagedRemoval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MembershipRecord {
    pub group_id: GroupId,
    pub leaf_index: LeafIndex,
    pub stage: MembershipStage,
    pub member: QualifiedUserId,
    pub commit_id: Option<CommitId>,
}

impl MembershipRecord {
    /// Stages a membership change for a pending commit.
    pub async fn stage<'e>(
        executor: impl SqliteExecutor<'e>,
        group_id: &GroupId,
        leaf_index: LeafIndex,
        change: StagedChange,
        member: &QualifiedUserId,
        commit_id: CommitId,
        now: DateTime<Utc>,
    ) -> sqlx::Result<()> {
        debug!(?leaf_index, ?change, "staging membership record");

        sqlx::query(
            "INSERT INTO group_membership
                (group_id, leaf_index, stage, user_id, user_domain, commit_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(group_id.as_slice())
        .bind(leaf_index.0 as i64)
        .bind(change.stage().as_str())
        .bind(member.user_id)
        .bind(&member.domain)
        .bind(commit_id.0)
        .bind(now)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Promotes all records staged under `commit_id` to merged in a single
    /// transaction. Any prior merged record for an affected leaf is
    /// replaced; leaves staged for removal end up with no merged record.
    /// Returns the number of leaves promoted to merged.
    pub async fn merge_commit(
        txn: &mut SqliteTransaction<'_>,
        group_id: &GroupId,
        commit_id: CommitId,
        now: DateTime<Utc>,
    ) -> sqlx::Result<u64> {
        sqlx::query(
            "DELETE FROM group_membership
             WHERE group_id = ? AND stage = 'merged' AND leaf_index IN (
                SELECT leaf_index
                FROM group_membership
                WHERE group_id = ? AND commit_id = ?
             )",
        )
        .bind(group_id.as_slice())
        .bind(group_id.as_slice())
        .bind(commit_id.0)
        .execute(txn.as_mut())
        .await?;

        let inserted = sqlx::query(
            "INSERT INTO group_membership
                (group_id, leaf_index, stage, user_id, user_domain, commit_id, created_at)
             SELECT group_id, leaf_index, 'merged', user_id, user_domain, NULL, ?
             FROM group_membership
             WHERE group_id = ? AND commit_id = ? AND stage IN ('staged_add', 'staged_update')",
        )
        .bind(now)
        .bind(group_id.as_slice())
        .bind(commit_id.0)
        .execute(txn.as_mut())
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM group_membership WHERE group_id = ? AND commit_id = ?")
            .bind(group_id.as_slice())
            .bind(commit_id.0)
            .execute(txn.as_mut())
            .await?;

        debug!(promoted = inserted, "merged membership commit");
        Ok(inserted)
    }

    /// Discards all records staged under a rejected commit. Merged state is
    /// untouched.
    pub async fn discard_commit<'e>(
        executor: impl SqliteExecutor<'e>,
        group_id: &GroupId,
        commit_id: CommitId,
    ) -> sqlx::Result<u64> {
        let result =
            sqlx::query("DELETE FROM group_membership WHERE group_id = ? AND commit_id = ?")
                .bind(group_id.as_slice())
                .bind(commit_id.0)
                .execute(executor)
                .await?;
        Ok(result.rows_affected())
    }

    /// Current merged membership of a group, ordered by leaf index.
    pub async fn merged_members<'e>(
        executor: impl SqliteExecutor<'e>,
        group_id: &GroupId,
    ) -> sqlx::Result<Vec<MembershipRecord>> {
        Self::load(executor, group_id, Some(MembershipStage::Merged)).await
    }

    /// Every record of the group, staged and merged.
    pub async fn all_records<'e>(
        executor: impl SqliteExecutor<'e>,
        group_id: &GroupId,
    ) -> sqlx::Result<Vec<MembershipRecord>> {
        Self::load(executor, group_id, None).await
    }

    async fn load<'e>(
        executor: impl SqliteExecutor<'e>,
        group_id: &GroupId,
        stage: Option<MembershipStage>,
    ) -> sqlx::Result<Vec<MembershipRecord>> {
        let rows = match stage {
            Some(stage) => {
                sqlx::query(
                    "SELECT leaf_index, stage, user_id, user_domain, commit_id
                     FROM group_membership
                     WHERE group_id = ? AND stage = ?
                     ORDER BY leaf_index ASC",
                )
                .bind(group_id.as_slice())
                .bind(stage.as_str())
                .fetch_all(executor)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT leaf_index, stage, user_id, user_domain, commit_id
                     FROM group_membership
                     WHERE group_id = ?
                     ORDER BY leaf_index ASC",
                )
                .bind(group_id.as_slice())
                .fetch_all(executor)
                .await?
            }
        };

        rows.into_iter()
            .map(|r| {
                let stage = MembershipStage::parse(r.get::<&str, _>(1))
                    .map_err(|e| sqlx::Error::Decode(e.into()))?;
                Ok(MembershipRecord {
                    group_id: group_id.clone(),
                    leaf_index: LeafIndex(r.get::<i64, _>(0) as u32),
                    stage,
                    member: QualifiedUserId {
                        user_id: r.get::<Uuid, _>(2),
                        domain: r.get::<String, _>(3),
                    },
                    commit_id: r.get::<Option<Uuid>, _>(4).map(CommitId),
                })
            })
            .collect()
    }

    /// Deletes membership records whose group no longer exists. The schema
    /// cascades group deletion, so this only catches records orphaned by
    /// out-of-band interference; it runs as a periodic maintenance task.
    pub async fn purge_orphaned<'e>(executor: impl SqliteExecutor<'e>) -> sqlx::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM group_membership
             WHERE group_id NOT IN (SELECT group_id FROM chat_groups)",
        )
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[path = "tests/membership_tests.rs"]
mod tests;
