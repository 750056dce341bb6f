//! Maintenance CLI for inspecting and nudging the delivery queues.

use anyhow::Result;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use delivery::DeliveryConfig;
use shared::domain::TaskKind;
use storage::key_packages::KeyPackageRecord;
use storage::membership::MembershipRecord;
use storage::timed_tasks::TimedTask;
use storage::{message_queue, receipt_queue, resync_queue, timed_tasks, Storage};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://delivery.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the depth of every queue.
    Depths,
    /// Clear lock columns on leases older than the configured duration.
    SweepLeases,
    /// Delete joining material outside the retention window.
    SweepKeyMaterial,
    /// Delete membership records whose group no longer exists.
    PurgeMembership,
    /// Schedule a maintenance task to run immediately.
    RunTask { kind: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;
    let config = DeliveryConfig::load();

    match cli.command {
        Command::Depths => {
            let pool = storage.pool();
            println!("messages:    {}", message_queue::LEASE.depth(pool).await?);
            println!("receipts:    {}", receipt_queue::LEASE.depth(pool).await?);
            println!("resyncs:     {}", resync_queue::LEASE.depth(pool).await?);
            println!("timed tasks: {}", timed_tasks::LEASE.depth(pool).await?);
        }
        Command::SweepLeases => {
            let stale_before = Utc::now() - config.lease_duration;
            let mut cleared = 0;
            for lease in [
                message_queue::LEASE,
                receipt_queue::LEASE,
                resync_queue::LEASE,
                timed_tasks::LEASE,
            ] {
                cleared += lease.sweep_expired(storage.pool(), stale_before).await?;
            }
            println!("cleared {cleared} stale leases");
        }
        Command::SweepKeyMaterial => {
            let mut txn = storage.begin_immediate().await?;
            let deleted = KeyPackageRecord::sweep(&mut txn, config.retained_generations).await?;
            txn.commit().await?;
            println!("deleted {deleted} superseded key packages");
        }
        Command::PurgeMembership => {
            let purged = MembershipRecord::purge_orphaned(storage.pool()).await?;
            println!("purged {purged} orphaned membership records");
        }
        Command::RunTask { kind } => {
            let kind = TaskKind::parse(&kind)?;
            TimedTask::schedule(storage.pool(), kind, Utc::now() - Duration::seconds(1)).await?;
            println!("scheduled {} to run now", kind.as_str());
        }
    }

    Ok(())
}
