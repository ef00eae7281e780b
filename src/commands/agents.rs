use std::sync::Arc;
use std::time::{Duration, Instant};

use colored::Colorize;

use crate::context::CoordinationContext;
use crate::error::{Result, TetherError};
use crate::mux::TmuxMultiplexer;
use crate::output::{self, Format};
use crate::registry::AgentRegistry;

fn registry(ctx: Arc<CoordinationContext>) -> AgentRegistry {
    AgentRegistry::new(ctx, Arc::new(TmuxMultiplexer::new()))
}

pub fn discover(ctx: Arc<CoordinationContext>, timeout: Option<u64>, format: Format) -> Result<()> {
    let deadline = timeout.map(|secs| Instant::now() + Duration::from_secs(secs));
    let found = registry(ctx).discover(deadline)?;
    output::print_agents(&found, format)
}

pub fn list(ctx: Arc<CoordinationContext>, all: bool, format: Format) -> Result<()> {
    let registry = registry(ctx);
    let agents = if all {
        registry.list_all()?
    } else {
        registry.active_agents()?
    };
    output::print_agents(&agents, format)
}

/// Register `id`, defaulting the pane to `$TMUX_PANE`.
pub fn register(
    ctx: Arc<CoordinationContext>,
    id: &str,
    pane: Option<String>,
    format: Format,
) -> Result<()> {
    let pane = pane
        .or_else(|| std::env::var("TMUX_PANE").ok())
        .ok_or_else(|| TetherError::Validation("no pane: pass --pane or run inside tmux".into()))?;
    let record = registry(ctx).register(id, &pane)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string(&record)?),
        Format::Pretty => println!(
            "Registered '{}' on pane {}",
            record.id.cyan().bold(),
            record.pane_reference
        ),
        Format::Minimal => println!("{}", record.id),
    }
    Ok(())
}

pub fn refresh(ctx: Arc<CoordinationContext>, id: &str, format: Format) -> Result<()> {
    let record = registry(ctx).refresh(id)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string(&record)?),
        Format::Pretty => println!("Refreshed '{}'", record.id.cyan()),
        Format::Minimal => println!("{}", record.id),
    }
    Ok(())
}

pub fn nudge(ctx: Arc<CoordinationContext>, id: &str, text: &str, format: Format) -> Result<()> {
    let record = registry(ctx).nudge(id, text)?;
    match format {
        Format::Json => println!(
            "{}",
            serde_json::json!({"nudged": record.id, "pane": record.pane_reference})
        ),
        Format::Pretty => println!(
            "Nudged '{}' in pane {}",
            record.id.cyan(),
            record.pane_reference
        ),
        Format::Minimal => println!("{}", record.id),
    }
    Ok(())
}
