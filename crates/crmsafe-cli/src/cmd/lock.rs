use super::Context;
use crate::output::{print_fields, print_json};
use anyhow::bail;
use clap::Subcommand;
use crmsafe_core::lock::{ExecutionLock, LockRecord};
use crmsafe_core::CrmError;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum LockSubcommand {
    /// Show the current execution lock, if any
    Status,

    /// Remove the lock file
    ///
    /// Without --force only an expired lock is removed. --force deletes a
    /// live lock too; only do that when the holding run is known to be dead,
    /// otherwise two runs may mutate the portal at once.
    Release {
        #[arg(long)]
        force: bool,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(ctx: &Context, subcmd: LockSubcommand) -> anyhow::Result<()> {
    let config = ctx.config()?;
    let lock = ExecutionLock::with_expiry(
        &config.reports_path(&ctx.root),
        &config.portal_id,
        config.lock.expiry(),
    );
    match subcmd {
        LockSubcommand::Status => status(&lock, ctx.json),
        LockSubcommand::Release { force } => release(lock, force, ctx.json),
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

fn status(lock: &ExecutionLock, json: bool) -> anyhow::Result<()> {
    let current = lock.current_lock()?;
    if json {
        return print_json(&serde_json::json!({
            "locked": current.is_some(),
            "lock": current,
            "path": lock.path(),
        }));
    }
    match current {
        Some(record) => print_lock(&record),
        None => println!("No execution lock held."),
    }
    Ok(())
}

fn print_lock(record: &LockRecord) {
    print_fields(&[
        ("Execution", record.execution_id.clone()),
        ("Portal", record.portal_id.clone()),
        ("Acquired", record.acquired_at.to_rfc3339()),
        ("Expires", record.expires_at.to_rfc3339()),
    ]);
}

// ---------------------------------------------------------------------------
// release
// ---------------------------------------------------------------------------

fn release(mut lock: ExecutionLock, force: bool, json: bool) -> anyhow::Result<()> {
    let removed = if force {
        lock.force_release()?
    } else {
        match lock.clear_expired() {
            Err(CrmError::LockHeld(live)) => bail!(
                "execution lock held by '{}' until {}; pass --force to remove it",
                live.execution_id,
                live.expires_at.to_rfc3339()
            ),
            other => other?,
        }
    };

    if json {
        return print_json(&serde_json::json!({ "released": removed }));
    }
    match removed {
        Some(record) => println!("Released execution lock held by '{}'.", record.execution_id),
        None => println!("No execution lock to release."),
    }
    Ok(())
}
