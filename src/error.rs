use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TetherError {
    #[error("not a tether workspace (run `tether init` first)")]
    NotInitialized,

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("invalid holder id '{0}'")]
    InvalidHolderId(String),

    #[error("invalid sender '{0}'")]
    InvalidSender(String),

    #[error("invalid content: {0}")]
    InvalidContent(String),

    #[error("invalid agent id '{id}': {reason}")]
    InvalidAgentId { id: String, reason: String },

    #[error("path '{0}' escapes the project root")]
    PathTraversal(String),

    #[error("'{resource}' is locked by '{holder}' since {acquired_at} ({reason})")]
    AlreadyLocked {
        resource: String,
        holder: String,
        reason: String,
        acquired_at: DateTime<Utc>,
    },

    #[error("'{0}' is not locked")]
    NotHeld(String),

    #[error("'{resource}' is held by '{holder}', not by the caller")]
    NotOwner { resource: String, holder: String },

    #[error("sender '{sender}' is rate limited; retry in {}s", .retry_after.as_secs().max(1))]
    RateLimited { sender: String, retry_after: Duration },

    #[error("message {0} failed signature verification")]
    AuthenticationFailure(String),

    #[error("corrupt record '{path}': {detail}")]
    StorageCorruption { path: String, detail: String },

    #[error("agent '{0}' not found in registry")]
    AgentNotFound(String),

    #[error("agent id '{id}' is already bound to pane {pane}")]
    AgentIdConflict { id: String, pane: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("shared secret error: {0}")]
    Secret(String),

    #[error("multiplexer error: {0}")]
    Multiplexer(String),

    #[error("busy: could not lock {0}")]
    Busy(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl TetherError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::Validation(_) => "validation_error",
            Self::InvalidHolderId(_) => "invalid_holder_id",
            Self::InvalidSender(_) => "invalid_sender",
            Self::InvalidContent(_) => "invalid_content",
            Self::InvalidAgentId { .. } => "invalid_agent_id",
            Self::PathTraversal(_) => "path_traversal",
            Self::AlreadyLocked { .. } => "already_locked",
            Self::NotHeld(_) => "not_held",
            Self::NotOwner { .. } => "not_owner",
            Self::RateLimited { .. } => "rate_limited",
            Self::AuthenticationFailure(_) => "authentication_failure",
            Self::StorageCorruption { .. } => "storage_corruption",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::AgentIdConflict { .. } => "agent_id_conflict",
            Self::Config(_) => "config_error",
            Self::Secret(_) => "secret_error",
            Self::Multiplexer(_) => "multiplexer_error",
            Self::Busy(_) => "busy",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
        }
    }

    /// Conflicts and throttling the caller can resolve by waiting and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AlreadyLocked { .. } | Self::RateLimited { .. } | Self::Busy(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TetherError>;
