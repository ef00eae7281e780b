//! Liveness-tracked directory of agents, fed by multiplexer scans.
//!
//! The snapshot lives in `.tether/agents.json` and is rewritten with
//! temp + rename under the `registry.lock` advisory lock, so concurrent
//! scans and registrations never lose each other's updates.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::agent;
use crate::context::CoordinationContext;
use crate::error::{Result, TetherError};
use crate::mux::{Multiplexer, PaneInfo};
use crate::store::{atomic, lock};

/// Longest notice `nudge` will type into a pane.
pub const MAX_NUDGE_LEN: usize = 200;

static ID_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"agent-id:\s*([a-z][a-z0-9_-]{1,63})(?:\s|$)").expect("static pattern")
});

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    /// The agent's pane no longer exists.
    Gone,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Gone => write!(f, "gone"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub pane_reference: String,
    pub last_seen: DateTime<Utc>,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl AgentRecord {
    pub fn is_stale(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        (now - self.last_seen).to_std().unwrap_or(Duration::ZERO) > threshold
    }

    fn is_live(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        self.status == AgentStatus::Active && !self.is_stale(threshold, now)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub agents: Vec<AgentRecord>,
}

impl RegistrySnapshot {
    fn find(&self, id: &str) -> Option<&AgentRecord> {
        self.agents.iter().find(|a| a.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut AgentRecord> {
        self.agents.iter_mut().find(|a| a.id == id)
    }

    /// Insert or replace `record`, evicting any other id bound to its pane.
    fn upsert(&mut self, record: AgentRecord) {
        self.agents
            .retain(|a| a.id == record.id || a.pane_reference != record.pane_reference);
        match self.find_mut(&record.id) {
            Some(existing) => *existing = record,
            None => self.agents.push(record),
        }
        self.agents.sort_by(|a, b| a.id.cmp(&b.id));
    }
}

struct Candidate {
    pane: PaneInfo,
    marker: Option<String>,
}

// ---------------------------------------------------------------------------
// AgentRegistry
// ---------------------------------------------------------------------------

pub struct AgentRegistry {
    ctx: Arc<CoordinationContext>,
    mux: Arc<dyn Multiplexer>,
    path: PathBuf,
    lock_path: PathBuf,
}

impl AgentRegistry {
    pub fn new(ctx: Arc<CoordinationContext>, mux: Arc<dyn Multiplexer>) -> Self {
        let path = ctx.registry_path();
        let lock_path = ctx.state_dir().join("registry.lock");
        Self {
            ctx,
            mux,
            path,
            lock_path,
        }
    }

    // -- snapshot I/O -------------------------------------------------------

    /// The current snapshot. An unreadable file reads as empty.
    pub fn snapshot(&self) -> Result<RegistrySnapshot> {
        Ok(self.load()?.unwrap_or_default())
    }

    /// `None` when the file exists but does not parse.
    fn load(&self) -> Result<Option<RegistrySnapshot>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(snapshot) => Ok(Some(snapshot)),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "ignoring corrupt registry snapshot");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Some(RegistrySnapshot::default())),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write the snapshot under the registry lock.
    ///
    /// A corrupt snapshot is moved to `agents.json.corrupt` before the
    /// fresh one replaces it.
    fn update<T>(&self, f: impl FnOnce(&mut RegistrySnapshot) -> Result<T>) -> Result<T> {
        let guard = lock::acquire_lock(&self.lock_path)?;
        let result = self.load().and_then(|loaded| {
            let mut snapshot = match loaded {
                Some(snapshot) => snapshot,
                None => {
                    let aside = self.path.with_extension("json.corrupt");
                    fs::rename(&self.path, &aside)?;
                    tracing::warn!(path = %aside.display(), "kept corrupt registry snapshot aside");
                    RegistrySnapshot::default()
                }
            };
            let value = f(&mut snapshot)?;
            atomic::replace(&self.path, &serde_json::to_vec_pretty(&snapshot)?)?;
            Ok(value)
        });
        lock::release_lock(guard)?;
        result
    }

    // -- discovery ----------------------------------------------------------

    fn is_agent_command(&self, command: &str) -> bool {
        let base = command.rsplit('/').next().unwrap_or(command).to_ascii_lowercase();
        self.ctx
            .config()
            .discovery
            .agent_commands
            .iter()
            .any(|c| base == c.to_ascii_lowercase() || base.starts_with(&c.to_ascii_lowercase()))
    }

    /// The last valid `agent-id:` marker visible in the pane.
    fn read_marker(&self, pane: &PaneInfo) -> Option<String> {
        let lines = self.ctx.config().discovery.capture_lines;
        let text = match self.mux.read_pane(&pane.pane_id, lines) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(pane = %pane.pane_id, error = %e, "could not read pane");
                return None;
            }
        };
        let id = ID_MARKER
            .captures_iter(&text)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .last()?;
        match agent::validate_agent_id(&id) {
            Ok(()) => Some(id),
            Err(e) => {
                tracing::warn!(pane = %pane.pane_id, error = %e, "ignoring agent-id marker");
                None
            }
        }
    }

    /// Scan the multiplexer and fold what it shows into the snapshot.
    ///
    /// Panes whose command is a known agent, or whose text carries an
    /// `agent-id:` marker, become active records. A pane keeps the id it
    /// had before unless a marker names a new one. Known pane-backed agents
    /// whose pane is gone are marked `gone`. If `deadline` passes mid-scan
    /// the remaining panes are left as they were. Returns the records
    /// refreshed by this scan.
    pub fn discover(&self, deadline: Option<Instant>) -> Result<Vec<AgentRecord>> {
        let panes = self.mux.list_panes()?;
        let present: HashSet<String> = panes.iter().map(|p| p.pane_id.clone()).collect();

        let mut candidates = Vec::new();
        for pane in panes {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::info!(candidates = candidates.len(), "discovery deadline reached");
                break;
            }
            let marker = self.read_marker(&pane);
            if marker.is_some() || self.is_agent_command(&pane.command) {
                candidates.push(Candidate { pane, marker });
            }
        }

        let now = Utc::now();
        let threshold = self.ctx.config().stale_threshold();
        let refreshed = self.update(|snapshot| {
            let mut refreshed = Vec::new();
            for Candidate { pane, marker } in candidates {
                let id = marker
                    .or_else(|| {
                        snapshot
                            .agents
                            .iter()
                            .find(|a| a.pane_reference == pane.pane_id)
                            .map(|a| a.id.clone())
                    })
                    .unwrap_or_else(|| agent::id_for_pane(&pane.pane_id));

                if let Some(other) = snapshot.find(&id)
                    && other.pane_reference != pane.pane_id
                    && present.contains(&other.pane_reference)
                    && other.is_live(threshold, now)
                {
                    tracing::warn!(
                        id = %id,
                        pane = %pane.pane_id,
                        bound_to = %other.pane_reference,
                        "agent id already bound to another pane; skipping"
                    );
                    continue;
                }

                let record = AgentRecord {
                    id,
                    pane_reference: pane.pane_id.clone(),
                    last_seen: now,
                    status: AgentStatus::Active,
                    command: Some(pane.command.clone()),
                };
                snapshot.upsert(record.clone());
                refreshed.push(record);
            }

            for record in &mut snapshot.agents {
                if record.status == AgentStatus::Active
                    && is_pane_id(&record.pane_reference)
                    && !present.contains(&record.pane_reference)
                {
                    tracing::info!(id = %record.id, pane = %record.pane_reference, "agent pane gone");
                    record.status = AgentStatus::Gone;
                }
            }
            snapshot.scanned_at = Some(now);
            Ok(refreshed)
        })?;

        tracing::info!(found = refreshed.len(), "agent discovery complete");
        Ok(refreshed)
    }

    // -- queries ------------------------------------------------------------

    /// Active records seen within `threshold`.
    pub fn list_active(&self, threshold: Duration) -> Result<Vec<AgentRecord>> {
        let now = Utc::now();
        Ok(self
            .snapshot()?
            .agents
            .into_iter()
            .filter(|a| a.is_live(threshold, now))
            .collect())
    }

    pub fn list_all(&self) -> Result<Vec<AgentRecord>> {
        Ok(self.snapshot()?.agents)
    }

    pub fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        Ok(self.snapshot()?.find(agent_id).cloned())
    }

    /// Live agents under the configured threshold, rescanning first when
    /// the snapshot is older than `discovery.auto_refresh_interval`.
    pub fn active_agents(&self) -> Result<Vec<AgentRecord>> {
        if let Some(interval) = self.ctx.config().auto_refresh_interval() {
            let due = match self.snapshot()?.scanned_at {
                Some(at) => (Utc::now() - at).to_std().unwrap_or(Duration::ZERO) >= interval,
                None => true,
            };
            if due && let Err(e) = self.discover(None) {
                tracing::warn!(error = %e, "auto-refresh discovery failed; using last snapshot");
            }
        }
        self.list_active(self.ctx.config().stale_threshold())
    }

    // -- mutation -----------------------------------------------------------

    /// Heartbeat: mark `agent_id` seen now.
    pub fn refresh(&self, agent_id: &str) -> Result<AgentRecord> {
        self.update(|snapshot| {
            let record = snapshot
                .find_mut(agent_id)
                .ok_or_else(|| TetherError::AgentNotFound(agent_id.into()))?;
            record.last_seen = Utc::now();
            record.status = AgentStatus::Active;
            Ok(record.clone())
        })
    }

    /// Bind `agent_id` to `pane_reference` explicitly.
    ///
    /// Fails with `AgentIdConflict` while the id is live on another pane.
    pub fn register(&self, agent_id: &str, pane_reference: &str) -> Result<AgentRecord> {
        agent::validate_agent_id(agent_id)?;
        let pane_reference = pane_reference.trim();
        if pane_reference.is_empty() || pane_reference.chars().any(char::is_control) {
            return Err(TetherError::Validation(format!(
                "invalid pane reference '{pane_reference}'"
            )));
        }
        let threshold = self.ctx.config().stale_threshold();
        let now = Utc::now();
        self.update(|snapshot| {
            if let Some(existing) = snapshot.find(agent_id)
                && existing.pane_reference != pane_reference
                && existing.is_live(threshold, now)
            {
                return Err(TetherError::AgentIdConflict {
                    id: agent_id.into(),
                    pane: existing.pane_reference.clone(),
                });
            }
            let record = AgentRecord {
                id: agent_id.into(),
                pane_reference: pane_reference.into(),
                last_seen: now,
                status: AgentStatus::Active,
                command: snapshot.find(agent_id).and_then(|a| a.command.clone()),
            };
            snapshot.upsert(record.clone());
            tracing::debug!(id = agent_id, pane = pane_reference, "agent registered");
            Ok(record)
        })
    }

    /// Type a one-line notice into the agent's pane.
    pub fn nudge(&self, agent_id: &str, text: &str) -> Result<AgentRecord> {
        let record = self
            .get(agent_id)?
            .ok_or_else(|| TetherError::AgentNotFound(agent_id.into()))?;
        if record.status == AgentStatus::Gone {
            return Err(TetherError::AgentNotFound(agent_id.into()));
        }
        let line: String = text
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .take(MAX_NUDGE_LEN)
            .collect();
        let line = line.trim();
        if line.is_empty() {
            return Err(TetherError::Validation("nudge text is empty".into()));
        }
        self.mux.send_keys(&record.pane_reference, line)?;
        Ok(record)
    }
}

/// Multiplexer pane ids (`%N`); other references are never marked gone.
fn is_pane_id(reference: &str) -> bool {
    reference
        .strip_prefix('%')
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}
