pub mod agents;
pub mod init;
pub mod lock;
pub mod msg;

use std::path::Path;
use std::sync::Arc;

use crate::agent;
use crate::config::CoordinationConfig;
use crate::context::CoordinationContext;
use crate::error::{Result, TetherError};

/// `--config` if given, else `.tether/config.yaml` if present, else defaults.
pub fn load_config(project_root: &Path, explicit: Option<&Path>) -> Result<CoordinationConfig> {
    match explicit {
        Some(path) => CoordinationConfig::load(path),
        None => {
            CoordinationConfig::load_or_default(&CoordinationContext::config_path(project_root))
        }
    }
}

pub fn open_context(
    project_root: &Path,
    config: Option<&Path>,
) -> Result<Arc<CoordinationContext>> {
    CoordinationContext::open(project_root, load_config(project_root, config)?)
}

/// The acting agent: `--agent` if given, else `TETHER_AGENT` / `AGENT_ID`.
pub fn acting_agent(explicit: Option<String>) -> Result<String> {
    explicit
        .or_else(agent::resolve_agent)
        .ok_or_else(|| {
            TetherError::Validation("no agent id: pass --agent or set TETHER_AGENT".into())
        })
}
