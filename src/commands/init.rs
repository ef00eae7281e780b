use std::path::Path;

use colored::Colorize;

use crate::commands::load_config;
use crate::context::CoordinationContext;
use crate::error::Result;
use crate::locking::LockManager;
use crate::output::Format;
use crate::store::acks::AckStore;
use crate::store::atomic;
use crate::store::message_log::MessageLog;

/// Create `.tether/` with its secret, stores and a config file holding the
/// effective settings. Safe to re-run: existing state is kept.
pub fn run(project_root: &Path, config: Option<&Path>, format: Format) -> Result<()> {
    let config = load_config(project_root, config)?;
    let ctx = CoordinationContext::init(project_root, config)?;
    LockManager::open(ctx.clone())?;
    MessageLog::from_context(&ctx)?;
    AckStore::open(ctx.acks_dir())?;

    let config_path = CoordinationContext::config_path(ctx.project_root());
    let wrote_config =
        atomic::create_exclusive(&config_path, serde_yaml::to_string(ctx.config())?.as_bytes())?;

    match format {
        Format::Json => println!(
            "{}",
            serde_json::json!({
                "initialized": ctx.project_root(),
                "state_dir": ctx.state_dir(),
                "config_written": wrote_config,
            })
        ),
        Format::Pretty => {
            println!(
                "Initialized {} in {}",
                ".tether/".bold(),
                ctx.project_root().display()
            );
            if wrote_config {
                println!("  {} {}", "config:".dimmed(), config_path.display());
            }
        }
        Format::Minimal => println!("{}", ctx.state_dir().display()),
    }
    Ok(())
}
