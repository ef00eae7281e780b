//! Outstanding acknowledgement requests, one JSON file per message id.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TetherError};
use crate::message::Recipient;
use crate::store::atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAck {
    pub message_id: String,
    pub sender_id: String,
    pub recipient: Recipient,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingAck {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

pub struct AckStore {
    dir: PathBuf,
}

impl AckStore {
    pub fn open(dir: PathBuf) -> Result<Self> {
        atomic::ensure_private_dir(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, message_id: &str) -> Result<PathBuf> {
        let safe = !message_id.is_empty()
            && message_id.len() <= 64
            && message_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !safe {
            return Err(TetherError::Validation(format!(
                "malformed message id '{message_id}'"
            )));
        }
        Ok(self.dir.join(format!("{message_id}.json")))
    }

    /// Record a pending ack. Registering the same message twice is a no-op.
    pub fn register(&self, pending: &PendingAck) -> Result<()> {
        let path = self.record_path(&pending.message_id)?;
        if !atomic::create_exclusive(&path, &serde_json::to_vec_pretty(pending)?)? {
            tracing::debug!(message_id = %pending.message_id, "ack already pending");
        }
        Ok(())
    }

    pub fn get(&self, message_id: &str) -> Result<Option<PendingAck>> {
        let path = self.record_path(message_id)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove and return the entry for `message_id`, if still pending.
    pub fn remove(&self, message_id: &str) -> Result<Option<PendingAck>> {
        let path = self.record_path(message_id)?;
        let Some(taken) = atomic::take(&path)? else {
            return Ok(None);
        };
        let pending = read_pending(&taken).ok();
        fs::remove_file(&taken)?;
        Ok(pending)
    }

    /// Every readable entry, oldest first. Corrupt files are skipped.
    pub fn list(&self) -> Result<Vec<PendingAck>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if atomic::is_scratch(&path) || path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            match read_pending(&path) {
                Ok(pending) => out.push(pending),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping corrupt ack record");
                }
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// Drop every entry whose deadline has passed; returns what was dropped.
    pub fn expire(&self, now: DateTime<Utc>) -> Result<Vec<PendingAck>> {
        let mut expired = Vec::new();
        for pending in self.list()? {
            if pending.is_expired(now) && let Some(removed) = self.remove(&pending.message_id)? {
                expired.push(removed);
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired pending acks");
        }
        Ok(expired)
    }
}

fn read_pending(path: &Path) -> Result<PendingAck> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
