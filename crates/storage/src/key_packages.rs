//! Lifecycle tracking for published key packages (joining material).
//!
//! Peers may cache an older key package and open a handshake concurrently
//! with a rotation, so the most recent generations stay live side by side.
//! Superseded records are retained, not deleted; garbage collection only
//! removes material old enough that no in-flight handshake can still
//! reference it.

use chrono::{DateTime, Utc};
use shared::domain::MaterialRef;
use sqlx::{SqliteExecutor, SqliteTransaction};
use tracing::debug;

pub struct KeyPackageRecord;

impl KeyPackageRecord {
    /// Installs a freshly issued generation of key packages as live and
    /// clears the liveness flag of generations older than `live_window`.
    ///
    /// With the default window of 2, issuing generation N leaves N and N-1
    /// live and marks everything older superseded. Returns the new
    /// generation number.
    pub async fn install_generation(
        txn: &mut SqliteTransaction<'_>,
        packages: &[(MaterialRef, Vec<u8>)],
        live_window: i64,
        now: DateTime<Utc>,
    ) -> sqlx::Result<i64> {
        let generation: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(generation), 0) + 1 FROM key_package_refs")
                .fetch_one(txn.as_mut())
                .await?;

        debug!(generation, count = packages.len(), "installing key package generation");

        for (material_ref, key_package) in packages {
            sqlx::query(
                "INSERT INTO key_packages (material_ref, key_package, created_at)
                 VALUES (?, ?, ?)",
            )
            .bind(material_ref.as_slice())
            .bind(key_package.as_slice())
            .bind(now)
            .execute(txn.as_mut())
            .await?;

            sqlx::query(
                "INSERT INTO key_package_refs (material_ref, generation, is_live, created_at)
                 VALUES (?, ?, 1, ?)",
            )
            .bind(material_ref.as_slice())
            .bind(generation)
            .bind(now)
            .execute(txn.as_mut())
            .await?;
        }

        sqlx::query("UPDATE key_package_refs SET is_live = 0 WHERE generation <= ?")
            .bind(generation - live_window)
            .execute(txn.as_mut())
            .await?;

        Ok(generation)
    }

    /// Marks a single record as superseded. Called when newer material
    /// invalidates it ahead of its generation.
    pub async fn mark_superseded<'e>(
        executor: impl SqliteExecutor<'e>,
        material_ref: &MaterialRef,
    ) -> sqlx::Result<bool> {
        let result =
            sqlx::query("UPDATE key_package_refs SET is_live = 0 WHERE material_ref = ?")
                .bind(material_ref.as_slice())
                .execute(executor)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes superseded records older than the retention window of
    /// `keep_generations` full rotation rounds. Live records and records
    /// within the window are never touched. Returns the number of deleted
    /// packages.
    pub async fn sweep(
        txn: &mut SqliteTransaction<'_>,
        keep_generations: i64,
    ) -> sqlx::Result<u64> {
        let max_generation: Option<i64> =
            sqlx::query_scalar("SELECT MAX(generation) FROM key_package_refs")
                .fetch_one(txn.as_mut())
                .await?;
        let Some(max_generation) = max_generation else {
            return Ok(0);
        };

        // Deleting the package cascades to its liveness record.
        let result = sqlx::query(
            "DELETE FROM key_packages
             WHERE material_ref IN (
                SELECT material_ref
                FROM key_package_refs
                WHERE is_live = 0 AND generation <= ?
             )",
        )
        .bind(max_generation - keep_generations)
        .execute(txn.as_mut())
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!(deleted, max_generation, "swept superseded key packages");
        }
        Ok(deleted)
    }

    pub async fn live_refs<'e>(
        executor: impl SqliteExecutor<'e>,
    ) -> sqlx::Result<Vec<MaterialRef>> {
        let refs: Vec<Vec<u8>> = sqlx::query_scalar(
            "SELECT material_ref FROM key_package_refs WHERE is_live = 1 ORDER BY generation ASC",
        )
        .fetch_all(executor)
        .await?;
        Ok(refs.into_iter().map(MaterialRef).collect())
    }

    /// Liveness of a record: `None` if the record does not exist.
    pub async fn is_live<'e>(
        executor: impl SqliteExecutor<'e>,
        material_ref: &MaterialRef,
    ) -> sqlx::Result<Option<bool>> {
        let is_live: Option<i64> = sqlx::query_scalar(
            "SELECT is_live FROM key_package_refs WHERE material_ref = ?",
        )
        .bind(material_ref.as_slice())
        .fetch_optional(executor)
        .await?;
        Ok(is_live.map(|v| v != 0))
    }

    pub async fn count<'e>(executor: impl SqliteExecutor<'e>) -> sqlx::Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM key_package_refs")
            .fetch_one(executor)
            .await
    }
}

#[cfg(test)]
#[path = "tests/key_packages_tests.rs"]
mod tests;
