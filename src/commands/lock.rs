use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;

use crate::context::CoordinationContext;
use crate::error::Result;
use crate::locking::{Lock, LockManager};
use crate::message::LockAction;
use crate::messaging::MessagingService;
use crate::output::{self, Format};

/// Broadcast a lock notice; the lock operation itself already succeeded,
/// so a failed notice is only logged.
fn notify(ctx: &Arc<CoordinationContext>, sender: &str, lock: &Lock, action: LockAction) {
    let sent = MessagingService::new(ctx.clone())
        .and_then(|svc| svc.notify_lock(sender, lock.resource_path.as_str(), action));
    if let Err(e) = sent {
        tracing::warn!(resource = %lock.resource_path, error = %e, "lock notice not sent");
    }
}

pub fn acquire(
    ctx: Arc<CoordinationContext>,
    path: &str,
    holder: &str,
    reason: &str,
    timeout: Option<u64>,
    broadcast: bool,
    format: Format,
) -> Result<()> {
    let manager = LockManager::open(ctx.clone())?;
    let lock = manager.acquire(path, holder, reason, timeout.map(Duration::from_secs))?;
    if broadcast {
        notify(&ctx, holder, &lock, LockAction::Acquired);
    }
    output::print_lock(&lock, format)
}

pub fn release(
    ctx: Arc<CoordinationContext>,
    path: &str,
    holder: &str,
    broadcast: bool,
    format: Format,
) -> Result<()> {
    let manager = LockManager::open(ctx.clone())?;
    let lock = manager.release(path, holder)?;
    if broadcast {
        notify(&ctx, holder, &lock, LockAction::Released);
    }
    match format {
        Format::Json => println!(
            "{}",
            serde_json::json!({"released": lock.resource_path, "holder": lock.holder_id})
        ),
        Format::Pretty => println!("Released {}", lock.resource_path.as_str().green()),
        Format::Minimal => println!("{}", lock.resource_path),
    }
    Ok(())
}

pub fn refresh(
    ctx: Arc<CoordinationContext>,
    path: &str,
    holder: &str,
    format: Format,
) -> Result<()> {
    let manager = LockManager::open(ctx)?;
    let lock = manager.refresh(path, holder)?;
    output::print_lock(&lock, format)
}

pub fn force_break(
    ctx: Arc<CoordinationContext>,
    path: &str,
    operator: Option<&str>,
    format: Format,
) -> Result<()> {
    let manager = LockManager::open(ctx.clone())?;
    let removed = manager.force_break(path)?;
    if let (Some(sender), Some(lock)) = (operator, removed.as_ref()) {
        notify(&ctx, sender, lock, LockAction::Broken);
    }
    match format {
        Format::Json => println!("{}", serde_json::json!({"broken": path, "lock": removed})),
        Format::Pretty => match &removed {
            Some(lock) => println!(
                "Broke lock on {} held by {}",
                lock.resource_path.as_str().yellow(),
                lock.holder_id.cyan()
            ),
            None => println!("Removed unreadable lock record for {}", path.yellow()),
        },
        Format::Minimal => println!("{path}"),
    }
    Ok(())
}

pub fn show(ctx: Arc<CoordinationContext>, path: &str, format: Format) -> Result<()> {
    let manager = LockManager::open(ctx)?;
    match manager.inspect(path)? {
        Some(lock) => output::print_lock(&lock, format),
        None => {
            match format {
                Format::Json => println!("null"),
                Format::Pretty => println!("{}", "Not locked.".dimmed()),
                Format::Minimal => {}
            }
            Ok(())
        }
    }
}

pub fn list(ctx: Arc<CoordinationContext>, format: Format) -> Result<()> {
    let manager = LockManager::open(ctx)?;
    let locks = manager.list_locks()?;
    output::print_locks(&locks, manager.stale_timeout(), format)
}

pub fn cleanup(
    ctx: Arc<CoordinationContext>,
    older_than: Option<u64>,
    format: Format,
) -> Result<()> {
    let manager = LockManager::open(ctx)?;
    let removed = manager.cleanup_stale(older_than.map(Duration::from_secs), None)?;
    match format {
        Format::Json => println!("{}", serde_json::json!({"removed": removed})),
        Format::Pretty => println!("Removed {} stale lock(s)", removed.to_string().bold()),
        Format::Minimal => println!("{removed}"),
    }
    Ok(())
}
