//! Timed maintenance task executor.
//!
//! Drives the joining-material sweep, lease-staleness sweeps over the other
//! queues, and the orphaned-membership purge. After a run the kind is
//! re-armed with its default interval; a failed run is re-armed all the
//! same, so one bad pass cannot disable maintenance.

use chrono::Utc;
use shared::domain::{TaskKind, WorkerId};
use storage::key_packages::KeyPackageRecord;
use storage::membership::MembershipRecord;
use storage::timed_tasks::TimedTask;
use storage::{message_queue, receipt_queue, resync_queue, timed_tasks};
use tracing::{debug, info, warn};

use crate::error::DeliveryError;
use crate::WorkerContext;

impl WorkerContext {
    pub(crate) async fn run_due_tasks(&self, worker: WorkerId) -> Result<(), DeliveryError> {
        loop {
            let now = Utc::now();
            let Some(kind) =
                TimedTask::claim_due(self.storage.pool(), worker, now, self.stale_before(now))
                    .await?
            else {
                return Ok(());
            };
            debug!(kind = kind.as_str(), "running timed task");

            let result = match kind {
                TaskKind::KeyMaterialSweep => self.sweep_key_material().await,
                TaskKind::LeaseSweep => self.sweep_stale_leases().await,
                TaskKind::MembershipPurge => self.purge_orphaned_membership().await,
            };
            if let Err(error) = result {
                warn!(kind = kind.as_str(), %error, "timed task failed");
            }

            TimedTask::reschedule(
                self.storage.pool(),
                kind,
                worker,
                Utc::now() + kind.default_interval(),
            )
            .await?;
        }
    }

    async fn sweep_key_material(&self) -> Result<(), DeliveryError> {
        let mut txn = self.storage.begin_immediate().await?;
        let deleted = KeyPackageRecord::sweep(&mut txn, self.config.retained_generations).await?;
        txn.commit().await?;
        if deleted > 0 {
            info!(deleted, "swept superseded joining material");
        }
        Ok(())
    }

    /// Clears lock columns left behind by crashed workers. Claimability
    /// never depends on this, it only keeps the columns honest for
    /// inspection tooling.
    async fn sweep_stale_leases(&self) -> Result<(), DeliveryError> {
        let stale_before = self.stale_before(Utc::now());
        let mut cleared = 0;
        for lease in [
            message_queue::LEASE,
            receipt_queue::LEASE,
            resync_queue::LEASE,
            timed_tasks::LEASE,
        ] {
            cleared += lease.sweep_expired(self.storage.pool(), stale_before).await?;
        }
        if cleared > 0 {
            info!(cleared, "released stale leases");
        }
        Ok(())
    }

    async fn purge_orphaned_membership(&self) -> Result<(), DeliveryError> {
        let purged = MembershipRecord::purge_orphaned(self.storage.pool()).await?;
        if purged > 0 {
            info!(purged, "purged orphaned membership records");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/tasks_tests.rs"]
mod tests;
