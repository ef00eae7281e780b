//! Terminal multiplexer seam used by agent discovery.
//!
//! [`TmuxMultiplexer`] shells out to `tmux`; [`MemoryMultiplexer`] is an
//! in-memory stand-in for tests and embedders without a terminal.

use std::process::Command;
use std::sync::Mutex;

use serde::Serialize;

use crate::error::{Result, TetherError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaneInfo {
    /// Server-unique pane id, e.g. `%3`.
    pub pane_id: String,
    pub session: String,
    pub window_index: u32,
    pub pane_index: u32,
    /// Foreground command running in the pane.
    pub command: String,
    pub pid: Option<u32>,
}

pub trait Multiplexer: Send + Sync {
    fn list_panes(&self) -> Result<Vec<PaneInfo>>;

    /// The last `lines` lines of visible text in `pane_id`.
    fn read_pane(&self, pane_id: &str, lines: usize) -> Result<String>;

    /// Type `text` literally into the pane, followed by Enter.
    fn send_keys(&self, pane_id: &str, text: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// tmux
// ---------------------------------------------------------------------------

const PANE_FORMAT: &str = "#{pane_id}\t#{session_name}\t#{window_index}\t#{pane_index}\t#{pane_current_command}\t#{pane_pid}";

#[derive(Debug, Clone, Default)]
pub struct TmuxMultiplexer;

impl TmuxMultiplexer {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("tmux")
            .args(args)
            .output()
            .map_err(|e| TetherError::Multiplexer(format!("failed to run tmux: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(TetherError::Multiplexer(format!(
                "tmux {} failed: {stderr}",
                args.first().copied().unwrap_or_default()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Multiplexer for TmuxMultiplexer {
    fn list_panes(&self) -> Result<Vec<PaneInfo>> {
        match self.run(&["list-panes", "-a", "-F", PANE_FORMAT]) {
            Ok(out) => Ok(out.lines().filter_map(parse_pane_line).collect()),
            // No server means no panes, not a failure.
            Err(TetherError::Multiplexer(msg))
                if msg.contains("no server running") || msg.contains("error connecting") =>
            {
                Ok(vec![])
            }
            Err(e) => Err(e),
        }
    }

    fn read_pane(&self, pane_id: &str, lines: usize) -> Result<String> {
        let start = format!("-{lines}");
        self.run(&["capture-pane", "-p", "-t", pane_id, "-S", &start])
    }

    fn send_keys(&self, pane_id: &str, text: &str) -> Result<()> {
        self.run(&["send-keys", "-t", pane_id, "-l", text])?;
        self.run(&["send-keys", "-t", pane_id, "Enter"])?;
        Ok(())
    }
}

fn parse_pane_line(line: &str) -> Option<PaneInfo> {
    let mut fields = line.split('\t');
    let pane_id = fields.next()?.trim();
    if !pane_id.starts_with('%') {
        return None;
    }
    let session = fields.next()?.to_string();
    let window_index = fields.next()?.trim().parse().ok()?;
    let pane_index = fields.next()?.trim().parse().ok()?;
    let command = fields.next().unwrap_or_default().trim().to_string();
    let pid = fields.next().and_then(|p| p.trim().parse().ok());
    Some(PaneInfo {
        pane_id: pane_id.to_string(),
        session,
        window_index,
        pane_index,
        command,
        pid,
    })
}

// ---------------------------------------------------------------------------
// In-memory double
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    panes: Vec<(PaneInfo, String)>,
    sent: Vec<(String, String)>,
}

/// Scriptable multiplexer: panes and their text are set directly, typed
/// keys are recorded.
#[derive(Default)]
pub struct MemoryMultiplexer {
    state: Mutex<MemoryState>,
}

impl MemoryMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Add a pane running `command` in session `session`, window 0.
    pub fn add_pane(&self, pane_id: &str, session: &str, command: &str) -> PaneInfo {
        let mut state = self.state();
        let pane = PaneInfo {
            pane_id: pane_id.to_string(),
            session: session.to_string(),
            window_index: 0,
            pane_index: state.panes.len() as u32,
            command: command.to_string(),
            pid: None,
        };
        state.panes.retain(|(p, _)| p.pane_id != pane_id);
        state.panes.push((pane.clone(), String::new()));
        pane
    }

    pub fn set_text(&self, pane_id: &str, text: &str) {
        let mut state = self.state();
        if let Some((_, current)) = state.panes.iter_mut().find(|(p, _)| p.pane_id == pane_id) {
            *current = text.to_string();
        }
    }

    pub fn remove_pane(&self, pane_id: &str) {
        self.state().panes.retain(|(p, _)| p.pane_id != pane_id);
    }

    /// `(pane_id, text)` pairs passed to `send_keys`, in order.
    pub fn sent_keys(&self) -> Vec<(String, String)> {
        self.state().sent.clone()
    }
}

impl Multiplexer for MemoryMultiplexer {
    fn list_panes(&self) -> Result<Vec<PaneInfo>> {
        Ok(self.state().panes.iter().map(|(p, _)| p.clone()).collect())
    }

    fn read_pane(&self, pane_id: &str, lines: usize) -> Result<String> {
        let state = self.state();
        let (_, text) = state
            .panes
            .iter()
            .find(|(p, _)| p.pane_id == pane_id)
            .ok_or_else(|| TetherError::Multiplexer(format!("can't find pane: {pane_id}")))?;
        let all: Vec<&str> = text.lines().collect();
        let skip = all.len().saturating_sub(lines);
        Ok(all[skip..].join("\n"))
    }

    fn send_keys(&self, pane_id: &str, text: &str) -> Result<()> {
        let mut state = self.state();
        if !state.panes.iter().any(|(p, _)| p.pane_id == pane_id) {
            return Err(TetherError::Multiplexer(format!("can't find pane: {pane_id}")));
        }
        state.sent.push((pane_id.to_string(), text.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_list_panes_output() {
        let pane = parse_pane_line("%12\twork\t1\t2\tclaude\t4242").unwrap();
        assert_eq!(pane.pane_id, "%12");
        assert_eq!((pane.session.as_str(), pane.window_index, pane.pane_index), ("work", 1, 2));
        assert_eq!(pane.command, "claude");
        assert_eq!(pane.pid, Some(4242));
    }

    #[test]
    fn rejects_garbage_lines() {
        assert!(parse_pane_line("").is_none());
        assert!(parse_pane_line("no server running on /tmp/tmux").is_none());
        assert!(parse_pane_line("%1\tsess\tx\t0\tbash\t1").is_none());
    }

    #[test]
    fn memory_double_reads_tail_and_records_keys() {
        let mux = MemoryMultiplexer::new();
        mux.add_pane("%1", "main", "claude");
        mux.set_text("%1", "one\ntwo\nthree");
        assert_eq!(mux.read_pane("%1", 2).unwrap(), "two\nthree");

        mux.send_keys("%1", "hello").unwrap();
        assert_eq!(mux.sent_keys(), vec![("%1".to_string(), "hello".to_string())]);

        mux.remove_pane("%1");
        assert!(mux.list_panes().unwrap().is_empty());
        assert!(matches!(
            mux.send_keys("%1", "x"),
            Err(TetherError::Multiplexer(_))
        ));
    }
}
