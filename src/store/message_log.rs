//! Append-only JSONL log of signed messages with size-based rotation.
//!
//! Appends and rotation run under one advisory lock (`messages.lock`), so
//! the append that crosses the size threshold is written to the current
//! file before that file is renamed to `.1`. Readers use a [`LogCursor`]
//! that survives rotation: it remembers the first message id of the file
//! it points into, and that file is found again among the backups.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::context::CoordinationContext;
use crate::error::Result;
use crate::message::Message;
use crate::store::{atomic, lock};

/// Position in the log. The default cursor starts at the oldest retained
/// message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCursor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub rotated: bool,
}

pub struct MessageLog {
    path: PathBuf,
    lock_path: PathBuf,
    max_bytes: u64,
    backups: usize,
}

impl MessageLog {
    pub fn open(path: PathBuf, max_bytes: u64, backups: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            atomic::ensure_private_dir(parent)?;
        }
        let lock_path = path.with_extension("lock");
        Ok(Self {
            path,
            lock_path,
            max_bytes,
            backups: backups.max(1),
        })
    }

    pub fn from_context(ctx: &CoordinationContext) -> Result<Self> {
        let messaging = &ctx.config().messaging;
        Self::open(
            ctx.message_log_path(),
            messaging.log_max_bytes,
            messaging.log_backups,
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `messages.jsonl.N`; `.1` is the most recent backup.
    pub fn backup_path(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    // -- writing ------------------------------------------------------------

    /// Append one record, rotating afterwards if the file grew past the
    /// threshold.
    ///
    /// Once the line is written the append has happened: a failed rotation
    /// is logged and retried on the next append, never reported as an error.
    pub fn append(&self, message: &Message) -> Result<AppendOutcome> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let guard = lock::acquire_lock(&self.lock_path)?;
        let size = {
            let mut file = atomic::private_options()
                .create(true)
                .append(true)
                .open(&self.path)?;
            file.write_all(&line)?;
            file.sync_data()?;
            file.metadata()?.len()
        };

        let rotated = size > self.max_bytes
            && match self.rotate_locked() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "message log rotation failed");
                    false
                }
            };
        lock::release_lock(guard)?;
        Ok(AppendOutcome { rotated })
    }

    /// Shift backups up by one and move the current file to `.1`.
    /// Caller holds the log lock.
    fn rotate_locked(&self) -> Result<()> {
        remove_if_exists(&self.backup_path(self.backups))?;
        for n in (1..self.backups).rev() {
            rename_if_exists(&self.backup_path(n), &self.backup_path(n + 1))?;
        }
        fs::rename(&self.path, self.backup_path(1))?;
        tracing::info!(path = %self.path.display(), backups = self.backups, "rotated message log");
        Ok(())
    }

    // -- reading ------------------------------------------------------------

    /// Existing segments, oldest backup first, current file last.
    fn segments(&self) -> Vec<PathBuf> {
        (1..=self.backups)
            .rev()
            .map(|n| self.backup_path(n))
            .chain(std::iter::once(self.path.clone()))
            .filter(|p| p.is_file())
            .collect()
    }

    /// Messages appended after `cursor`, plus the cursor to resume from.
    pub fn read_from(&self, cursor: &LogCursor) -> Result<(Vec<Message>, LogCursor)> {
        let _guard = lock::acquire_lock(&self.lock_path)?;

        let segments = self.segments();
        let mut firsts = Vec::with_capacity(segments.len());
        for segment in &segments {
            firsts.push(first_id(segment)?);
        }

        let (start, start_offset) = match &cursor.anchor {
            None => (0, 0),
            Some(anchor) => match firsts.iter().position(|f| f.as_ref() == Some(anchor)) {
                Some(i) => (i, cursor.offset),
                None => {
                    tracing::warn!(anchor = %anchor, "log cursor points past retained backups; replaying history");
                    (0, 0)
                }
            },
        };

        let mut messages = Vec::new();
        let mut next = cursor.clone();
        for (i, segment) in segments.iter().enumerate().skip(start) {
            let offset = if i == start { start_offset } else { 0 };
            let (batch, end) = read_segment(segment, offset)?;
            messages.extend(batch);
            if let Some(first) = &firsts[i] {
                next = LogCursor {
                    anchor: Some(first.clone()),
                    offset: end,
                };
            }
        }
        Ok((messages, next))
    }

    /// Every retained message, oldest first.
    pub fn read_all(&self) -> Result<Vec<Message>> {
        Ok(self.read_from(&LogCursor::default())?.0)
    }

    /// The last `limit` retained messages.
    pub fn tail(&self, limit: usize) -> Result<Vec<Message>> {
        let mut all = self.read_all()?;
        let len = all.len();
        if len > limit {
            all = all.split_off(len - limit);
        }
        Ok(all)
    }

    /// A cursor positioned after everything currently in the log.
    pub fn end_cursor(&self) -> Result<LogCursor> {
        Ok(self.read_from(&LogCursor::default())?.1)
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn rename_if_exists(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn first_id(path: &Path) -> Result<Option<String>> {
    let (messages, _) = read_lines(path, 0, Some(1))?;
    Ok(messages.into_iter().next().map(|m| m.id))
}

fn read_segment(path: &Path, offset: u64) -> Result<(Vec<Message>, u64)> {
    read_lines(path, offset, None)
}

/// Parse complete lines starting at `offset`. A trailing line without a
/// newline is left for the next read. Corrupt lines are logged and skipped.
fn read_lines(path: &Path, offset: u64, limit: Option<usize>) -> Result<(Vec<Message>, u64)> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((vec![], offset)),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    let offset = offset.min(len);
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let mut messages = Vec::new();
    let mut consumed = 0usize;
    while let Some(newline) = buf[consumed..].iter().position(|b| *b == b'\n') {
        let line = &buf[consumed..consumed + newline];
        consumed += newline + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Message>(line) {
            Ok(message) => messages.push(message),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    offset = offset + (consumed - newline - 1) as u64,
                    error = %e,
                    "skipping corrupt message record"
                );
            }
        }
        if limit.is_some_and(|l| messages.len() >= l) {
            break;
        }
    }
    Ok((messages, offset + consumed as u64))
}
