use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TetherError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingConfig {
    pub messages_per_minute: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            messages_per_minute: 30,
            window_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Seconds after acquisition (or last refresh) at which a lock is presumed abandoned.
    pub stale_timeout: u64,
    pub auto_cleanup: bool,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            stale_timeout: 3600,
            auto_cleanup: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub stale_threshold: u64,
    /// `None` disables automatic re-scans.
    pub auto_refresh_interval: Option<u64>,
    /// Pane commands that mark a pane as hosting an agent.
    pub agent_commands: Vec<String>,
    /// How many trailing lines of pane text to scan for an id marker.
    pub capture_lines: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            stale_threshold: 300,
            auto_refresh_interval: Some(30),
            agent_commands: ["claude", "codex", "aider", "gemini", "node"]
                .into_iter()
                .map(String::from)
                .collect(),
            capture_lines: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub max_content_len: usize,
    pub log_max_bytes: u64,
    pub log_backups: usize,
    /// Seconds a requested acknowledgement stays pending.
    pub ack_timeout: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_content_len: 4096,
            log_max_bytes: 10 * 1024 * 1024,
            log_backups: 5,
            ack_timeout: 600,
        }
    }
}

/// Validated settings for every coordination component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub rate_limiting: RateLimitingConfig,
    pub locking: LockingConfig,
    pub discovery: DiscoveryConfig,
    pub messaging: MessagingConfig,
}

fn check_range<T>(key: &str, value: T, min: T, max: T) -> Result<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(TetherError::Config(format!(
            "{key} = {value} is outside [{min}, {max}]"
        )));
    }
    Ok(())
}

impl CoordinationConfig {
    /// Read and validate a YAML config file. Missing keys take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        let r = &self.rate_limiting;
        check_range("rate_limiting.messages_per_minute", r.messages_per_minute, 1, 1000)?;
        check_range("rate_limiting.window_seconds", r.window_seconds, 1, 3600)?;

        check_range("locking.stale_timeout", self.locking.stale_timeout, 60, 86_400)?;

        let d = &self.discovery;
        check_range("discovery.stale_threshold", d.stale_threshold, 10, 3600)?;
        if let Some(interval) = d.auto_refresh_interval
            && interval < 5
        {
            return Err(TetherError::Config(format!(
                "discovery.auto_refresh_interval = {interval} must be >= 5 or null"
            )));
        }
        check_range("discovery.capture_lines", d.capture_lines, 1, 10_000)?;

        let m = &self.messaging;
        check_range("messaging.max_content_len", m.max_content_len, 1, 65_536)?;
        check_range("messaging.log_max_bytes", m.log_max_bytes, 1024, 1 << 30)?;
        check_range("messaging.log_backups", m.log_backups, 1, 100)?;
        check_range("messaging.ack_timeout", m.ack_timeout, 1, 86_400)?;
        Ok(())
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.locking.stale_timeout)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.discovery.stale_threshold)
    }

    pub fn auto_refresh_interval(&self) -> Option<Duration> {
        self.discovery.auto_refresh_interval.map(Duration::from_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.messaging.ack_timeout)
    }
}
