//! Advisory per-resource locks stored as one JSON record per resource
//! under `.tether/locks/`.
//!
//! There is no lock around the store itself. Creation goes through
//! [`atomic::create_exclusive`]. Removal is per generation: a record
//! (identified by holder and acquisition time) may only be deleted by the
//! caller that exclusively creates its `<hash>.<generation>.claim` file, so
//! a release, break or reclaim never touches a record it did not read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::agent;
use crate::context::CoordinationContext;
use crate::error::{Result, TetherError};
use crate::resource::ResourcePath;
use crate::store::atomic;

/// Longest accepted lock reason, in characters.
pub const MAX_REASON_LEN: usize = 256;

const READ_ATTEMPTS: usize = 3;
const CLAIM_EXTENSION: &str = "claim";
const MAX_POLL_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub resource_path: ResourcePath,
    pub holder_id: String,
    pub reason: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl Lock {
    /// The later of acquisition and the holder's last heartbeat.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.refreshed_at
            .map_or(self.acquired_at, |r| r.max(self.acquired_at))
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        age_since(self.last_activity(), now)
    }

    pub fn is_stale(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > timeout
    }
}

fn age_since(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

/// What a record path currently holds.
enum Slot {
    Empty,
    Held(Lock),
    /// Unparseable after retries; judged by file modification time.
    Corrupt { modified: DateTime<Utc> },
}

impl Slot {
    fn is_stale(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        match self {
            Slot::Empty => true,
            Slot::Held(lock) => lock.is_stale(timeout, now),
            Slot::Corrupt { modified } => age_since(*modified, now) > timeout,
        }
    }

    /// Identity of one lock generation. Heartbeats keep it; a new
    /// acquisition changes it.
    fn generation(&self) -> Option<String> {
        let seed = match self {
            Slot::Empty => return None,
            Slot::Held(lock) => format!(
                "held\0{}\0{}",
                lock.holder_id,
                lock.acquired_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
            ),
            Slot::Corrupt { modified } => format!(
                "corrupt\0{}",
                modified.to_rfc3339_opts(SecondsFormat::Nanos, true)
            ),
        };
        Some(hex::encode(&Sha256::digest(seed.as_bytes())[..8]))
    }
}

pub struct LockManager {
    ctx: Arc<CoordinationContext>,
    dir: PathBuf,
    stale_timeout: Duration,
}

impl LockManager {
    /// Open the lock store, running one stale sweep when
    /// `locking.auto_cleanup` is enabled.
    pub fn open(ctx: Arc<CoordinationContext>) -> Result<Self> {
        let dir = ctx.locks_dir();
        atomic::ensure_private_dir(&dir)?;
        let stale_timeout = ctx.config().stale_timeout();
        let manager = Self {
            ctx,
            dir,
            stale_timeout,
        };
        if manager.ctx.config().locking.auto_cleanup {
            let removed = manager.cleanup_stale(None, None)?;
            if removed > 0 {
                tracing::info!(removed, "auto-cleanup removed stale locks");
            }
        }
        Ok(manager)
    }

    pub fn stale_timeout(&self) -> Duration {
        self.stale_timeout
    }

    pub fn resolve(&self, path: &str) -> Result<ResourcePath> {
        ResourcePath::resolve(self.ctx.project_root(), path)
    }

    fn record_path(&self, resource: &ResourcePath) -> PathBuf {
        let digest = Sha256::digest(resource.as_str().as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }

    // -- acquire ------------------------------------------------------------

    /// Acquire the lock on `path` for `holder_id`.
    ///
    /// Without a timeout this makes one attempt (plus at most one stale
    /// reclamation). With a timeout, `AlreadyLocked` is retried with
    /// exponential backoff until the timeout elapses. Re-acquiring a lock
    /// the caller already holds refreshes it.
    pub fn acquire(
        &self,
        path: &str,
        holder_id: &str,
        reason: &str,
        timeout: Option<Duration>,
    ) -> Result<Lock> {
        let resource = self.resolve(path)?;
        agent::validate_agent_id(holder_id)
            .map_err(|_| TetherError::InvalidHolderId(holder_id.into()))?;
        let reason = validate_reason(reason)?;

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut delay = Duration::from_millis(10);
        loop {
            match self.try_acquire(&resource, holder_id, &reason) {
                Err(TetherError::AlreadyLocked { .. })
                    if deadline.is_some_and(|d| Instant::now() < d) =>
                {
                    let remaining = deadline
                        .map(|d| d.saturating_duration_since(Instant::now()))
                        .unwrap_or_default();
                    std::thread::sleep(delay.min(remaining));
                    delay = (delay * 2).min(MAX_POLL_DELAY);
                }
                other => return other,
            }
        }
    }

    fn try_acquire(&self, resource: &ResourcePath, holder_id: &str, reason: &str) -> Result<Lock> {
        let record = self.record_path(resource);
        let now = Utc::now();
        let lock = Lock {
            resource_path: resource.clone(),
            holder_id: holder_id.into(),
            reason: reason.into(),
            acquired_at: now,
            refreshed_at: None,
        };
        let bytes = serde_json::to_vec_pretty(&lock)?;

        if atomic::create_exclusive(&record, &bytes)? {
            tracing::debug!(resource = %resource, holder = holder_id, "lock acquired");
            return Ok(lock);
        }

        match self.read_slot(&record)? {
            Slot::Held(existing)
                if existing.holder_id == holder_id
                    && !existing.is_stale(self.stale_timeout, now) =>
            {
                return self.refresh_resource(resource, holder_id);
            }
            Slot::Held(existing) if !existing.is_stale(self.stale_timeout, now) => {
                return Err(already_locked(existing));
            }
            Slot::Corrupt { modified } if age_since(modified, now) <= self.stale_timeout => {
                return Err(TetherError::AlreadyLocked {
                    resource: resource.to_string(),
                    holder: "<unreadable>".into(),
                    reason: "lock record is corrupt".into(),
                    acquired_at: modified,
                });
            }
            Slot::Empty => {}
            stale => {
                self.reclaim_if_stale(&record, &stale, self.stale_timeout)?;
            }
        }

        // One retry only. Losing here means a concurrent acquirer or
        // reclaimer won; the caller sees a retryable AlreadyLocked.
        if atomic::create_exclusive(&record, &bytes)? {
            tracing::info!(resource = %resource, holder = holder_id, "lock acquired after reclaim");
            return Ok(lock);
        }
        match self.read_slot(&record)? {
            Slot::Held(existing) => Err(already_locked(existing)),
            Slot::Corrupt { modified } => Err(TetherError::AlreadyLocked {
                resource: resource.to_string(),
                holder: "<unreadable>".into(),
                reason: "lock record is corrupt".into(),
                acquired_at: modified,
            }),
            Slot::Empty => Err(TetherError::AlreadyLocked {
                resource: resource.to_string(),
                holder: "<contended>".into(),
                reason: "lock changed hands during acquire".into(),
                acquired_at: now,
            }),
        }
    }

    // -- release / refresh / break -------------------------------------------

    /// Release a lock held by `holder_id`, returning the removed record.
    pub fn release(&self, path: &str, holder_id: &str) -> Result<Lock> {
        let resource = self.resolve(path)?;
        agent::validate_agent_id(holder_id)
            .map_err(|_| TetherError::InvalidHolderId(holder_id.into()))?;
        let record = self.record_path(&resource);

        let slot = self.read_slot(&record)?;
        let lock = match &slot {
            Slot::Empty => return Err(TetherError::NotHeld(resource.to_string())),
            Slot::Corrupt { .. } => {
                return Err(TetherError::StorageCorruption {
                    path: record.display().to_string(),
                    detail: "cannot verify holder; use force-break".into(),
                });
            }
            Slot::Held(existing) if existing.holder_id != holder_id => {
                return Err(TetherError::NotOwner {
                    resource: resource.to_string(),
                    holder: existing.holder_id.clone(),
                });
            }
            Slot::Held(existing) => existing.clone(),
        };

        // Losing the claim means a reclaimer or breaker got there first.
        if !self.remove_generation(&record, &slot)? {
            return Err(TetherError::NotHeld(resource.to_string()));
        }
        tracing::debug!(resource = %resource, holder = holder_id, "lock released");
        Ok(lock)
    }

    /// Holder heartbeat: bump `refreshed_at` so the lock does not go stale.
    pub fn refresh(&self, path: &str, holder_id: &str) -> Result<Lock> {
        let resource = self.resolve(path)?;
        agent::validate_agent_id(holder_id)
            .map_err(|_| TetherError::InvalidHolderId(holder_id.into()))?;
        self.refresh_resource(&resource, holder_id)
    }

    fn refresh_resource(&self, resource: &ResourcePath, holder_id: &str) -> Result<Lock> {
        let record = self.record_path(resource);
        let now = Utc::now();
        let mut lock = match self.read_slot(&record)? {
            Slot::Held(lock) => lock,
            Slot::Empty => return Err(TetherError::NotHeld(resource.to_string())),
            Slot::Corrupt { .. } => {
                return Err(TetherError::StorageCorruption {
                    path: record.display().to_string(),
                    detail: "cannot verify holder; use force-break".into(),
                });
            }
        };
        if lock.holder_id != holder_id {
            return Err(TetherError::NotOwner {
                resource: resource.to_string(),
                holder: lock.holder_id,
            });
        }
        // A stale lock may already be in a reclaimer's hands.
        if lock.is_stale(self.stale_timeout, now) {
            return Err(TetherError::NotHeld(resource.to_string()));
        }
        lock.refreshed_at = Some(now);
        atomic::replace(&record, &serde_json::to_vec_pretty(&lock)?)?;
        Ok(lock)
    }

    /// Operator override: remove the lock whoever holds it.
    ///
    /// Returns the removed record, or `None` if it was unreadable.
    pub fn force_break(&self, path: &str) -> Result<Option<Lock>> {
        let resource = self.resolve(path)?;
        let record = self.record_path(&resource);
        let slot = self.read_slot(&record)?;
        if matches!(slot, Slot::Empty) || !self.remove_generation(&record, &slot)? {
            return Err(TetherError::NotHeld(resource.to_string()));
        }
        let lock = match slot {
            Slot::Held(lock) => Some(lock),
            Slot::Empty | Slot::Corrupt { .. } => None,
        };
        tracing::warn!(
            resource = %resource,
            holder = lock.as_ref().map(|l| l.holder_id.as_str()).unwrap_or("<unreadable>"),
            "lock force-broken"
        );
        Ok(lock)
    }

    // -- inspection ---------------------------------------------------------

    pub fn inspect(&self, path: &str) -> Result<Option<Lock>> {
        let resource = self.resolve(path)?;
        match self.read_slot(&self.record_path(&resource))? {
            Slot::Held(lock) => Ok(Some(lock)),
            Slot::Empty | Slot::Corrupt { .. } => Ok(None),
        }
    }

    /// Snapshot of every readable lock, sorted by resource path.
    pub fn list_locks(&self) -> Result<Vec<Lock>> {
        let mut locks = Vec::new();
        for record in self.record_files()? {
            if let Slot::Held(lock) = self.read_slot(&record)? {
                locks.push(lock);
            }
        }
        locks.sort_by(|a, b| a.resource_path.cmp(&b.resource_path));
        Ok(locks)
    }

    /// Remove every lock idle for longer than `threshold` (default: the
    /// configured stale timeout). Stops early once `deadline` passes.
    pub fn cleanup_stale(
        &self,
        threshold: Option<Duration>,
        deadline: Option<Instant>,
    ) -> Result<usize> {
        let threshold = threshold.unwrap_or(self.stale_timeout);
        let now = Utc::now();
        let mut removed = 0;

        for entry in fs::read_dir(&self.dir)? {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::info!(removed, "stale lock cleanup hit its deadline");
                break;
            }
            let path = entry?.path();
            if atomic::is_scratch(&path) {
                // Temp files left by a writer that crashed mid-publish.
                if file_modified(&path).is_some_and(|m| age_since(m, now) > threshold) {
                    let _ = fs::remove_file(&path);
                }
                continue;
            }
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => {}
                Some(CLAIM_EXTENSION) => {
                    // Claims only need to outlive a slow contender.
                    let expired = file_modified(&path)
                        .is_some_and(|m| age_since(m, now) > self.stale_timeout);
                    if expired {
                        let _ = fs::remove_file(&path);
                    }
                    continue;
                }
                _ => continue,
            }
            let slot = self.read_slot(&path)?;
            if self.reclaim_if_stale(&path, &slot, threshold)? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "removed stale locks");
        }
        Ok(removed)
    }

    // -- internals ----------------------------------------------------------

    fn record_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if atomic::is_scratch(&path) {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Read a record, retrying a few times before calling it corrupt.
    fn read_slot(&self, path: &Path) -> Result<Slot> {
        let mut last_error = String::new();
        for attempt in 0..READ_ATTEMPTS {
            match read_lock_file(path) {
                Ok(lock) => return Ok(Slot::Held(lock)),
                Err(TetherError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    return Ok(Slot::Empty);
                }
                Err(TetherError::Json(e)) => {
                    last_error = e.to_string();
                    if attempt + 1 < READ_ATTEMPTS {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        let Some(modified) = file_modified(path) else {
            return Ok(Slot::Empty);
        };
        tracing::warn!(path = %path.display(), error = %last_error, "skipping corrupt lock record");
        Ok(Slot::Corrupt { modified })
    }

    /// Delete `observed` if it is stale and no one else has claimed it.
    /// Returns whether a record was removed.
    fn reclaim_if_stale(
        &self,
        record: &Path,
        observed: &Slot,
        threshold: Duration,
    ) -> Result<bool> {
        if matches!(observed, Slot::Empty) || !observed.is_stale(threshold, Utc::now()) {
            return Ok(false);
        }
        if !self.remove_generation(record, observed)? {
            return Ok(false);
        }
        if let Slot::Held(lock) = observed {
            tracing::info!(
                resource = %lock.resource_path,
                holder = %lock.holder_id,
                "reclaimed stale lock"
            );
        }
        Ok(true)
    }

    /// Remove the record at `record` if it is still the generation the
    /// caller read as `observed`.
    ///
    /// The caller must first win the generation's claim file, so at most
    /// one caller removes each generation. The re-read after claiming
    /// rejects any newer generation that took the slot.
    fn remove_generation(&self, record: &Path, observed: &Slot) -> Result<bool> {
        let Some(generation) = observed.generation() else {
            return Ok(false);
        };
        let stem = record
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let claim = self.dir.join(format!("{stem}.{generation}.{CLAIM_EXTENSION}"));
        if !atomic::create_exclusive(&claim, b"")? {
            tracing::debug!(record = %record.display(), "lock generation already claimed");
            return Ok(false);
        }
        if self.read_slot(record)?.generation().as_deref() != Some(generation.as_str()) {
            return Ok(false);
        }
        match fs::remove_file(record) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_lock_file(path: &Path) -> Result<Lock> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

fn file_modified(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

fn already_locked(existing: Lock) -> TetherError {
    TetherError::AlreadyLocked {
        resource: existing.resource_path.to_string(),
        holder: existing.holder_id,
        reason: existing.reason,
        acquired_at: existing.acquired_at,
    }
}

fn validate_reason(reason: &str) -> Result<String> {
    let reason = reason.trim();
    if reason.chars().count() > MAX_REASON_LEN {
        return Err(TetherError::Validation(format!(
            "lock reason exceeds {MAX_REASON_LEN} characters"
        )));
    }
    if reason.chars().any(char::is_control) {
        return Err(TetherError::Validation(
            "lock reason contains control characters".into(),
        ));
    }
    Ok(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinationConfig;
    use crate::secret::SharedSecret;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, LockManager) {
        let dir = tempdir().unwrap();
        let secret = SharedSecret::from_bytes(vec![1; 32]).unwrap();
        let ctx =
            CoordinationContext::with_secret(dir.path(), CoordinationConfig::default(), secret)
                .unwrap();
        let manager = LockManager::open(ctx).unwrap();
        (dir, manager)
    }

    /// Rewrite a record so it looks `secs` seconds old.
    fn age_record(manager: &LockManager, path: &str, secs: i64) {
        let resource = manager.resolve(path).unwrap();
        let record = manager.record_path(&resource);
        let mut lock = read_lock_file(&record).unwrap();
        lock.acquired_at = Utc::now() - chrono::Duration::seconds(secs);
        lock.refreshed_at = None;
        fs::write(&record, serde_json::to_vec_pretty(&lock).unwrap()).unwrap();
    }

    #[test]
    fn lock_round_trips_without_refresh_field() {
        let lock = Lock {
            resource_path: ResourcePath::from_stored("src/lib.rs".into()),
            holder_id: "agent-a".into(),
            reason: "editing".into(),
            acquired_at: Utc::now(),
            refreshed_at: None,
        };
        let json = serde_json::to_string(&lock).unwrap();
        assert!(!json.contains("refreshed_at"));
        assert!(json.contains("\"resource_path\":\"src/lib.rs\""));
        let parsed: Lock = serde_json::from_str(&json).unwrap();
        assert_eq!(lock, parsed);
    }

    #[test]
    fn acquire_and_conflict() {
        let (_dir, manager) = setup();
        let lock = manager.acquire("src/lib.rs", "agent-a", "refactor", None).unwrap();
        assert_eq!(lock.holder_id, "agent-a");
        assert_eq!(lock.resource_path.as_str(), "src/lib.rs");

        let err = manager
            .acquire("./src/lib.rs", "agent-b", "also editing", None)
            .unwrap_err();
        match err {
            TetherError::AlreadyLocked { holder, reason, .. } => {
                assert_eq!(holder, "agent-a");
                assert_eq!(reason, "refactor");
            }
            other => panic!("expected AlreadyLocked, got {other:?}"),
        }
    }

    #[test]
    fn reacquire_by_holder_refreshes() {
        let (_dir, manager) = setup();
        let first = manager.acquire("a.rs", "agent-a", "x", None).unwrap();
        let again = manager.acquire("a.rs", "agent-a", "x", None).unwrap();
        assert_eq!(again.acquired_at, first.acquired_at);
        assert!(again.refreshed_at.is_some());
    }

    #[test]
    fn record_file_is_named_by_resource_hash() {
        let (_dir, manager) = setup();
        manager.acquire("src/lib.rs", "agent-a", "", None).unwrap();
        let files = manager.record_files().unwrap();
        assert_eq!(files.len(), 1);
        let stem = files[0].file_stem().unwrap().to_str().unwrap();
        assert_eq!(stem.len(), 64);
        assert!(stem.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn traversal_reported_before_holder_validation() {
        let (_dir, manager) = setup();
        for holder in ["agent-a", "", "ADMIN", "system"] {
            let err = manager
                .acquire("../../etc/passwd", holder, "", None)
                .unwrap_err();
            assert!(matches!(err, TetherError::PathTraversal(_)), "{holder}: {err:?}");
        }
    }

    #[test]
    fn invalid_holder_rejected() {
        let (_dir, manager) = setup();
        for holder in ["", "Bad Holder", "admin"] {
            let err = manager.acquire("a.rs", holder, "", None).unwrap_err();
            assert!(matches!(err, TetherError::InvalidHolderId(_)));
        }
        assert!(manager.list_locks().unwrap().is_empty());
    }

    #[test]
    fn oversized_reason_rejected() {
        let (_dir, manager) = setup();
        let reason = "x".repeat(MAX_REASON_LEN + 1);
        let err = manager.acquire("a.rs", "agent-a", &reason, None).unwrap_err();
        assert!(matches!(err, TetherError::Validation(_)));
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let (_dir, manager) = setup();
        manager.acquire("a.rs", "agent-a", "old", None).unwrap();
        age_record(&manager, "a.rs", 7200);

        let lock = manager.acquire("a.rs", "agent-b", "new", None).unwrap();
        assert_eq!(lock.holder_id, "agent-b");
        assert_eq!(manager.inspect("a.rs").unwrap().unwrap().holder_id, "agent-b");
    }

    fn slot_of(manager: &LockManager, path: &str) -> (PathBuf, Slot) {
        let record = manager.record_path(&manager.resolve(path).unwrap());
        let slot = manager.read_slot(&record).unwrap();
        (record, slot)
    }

    #[test]
    fn late_reclaimer_leaves_newer_lock_in_place() {
        let (_dir, manager) = setup();
        manager.acquire("a.rs", "agent-old", "", None).unwrap();
        age_record(&manager, "a.rs", 7200);
        let (record, stale) = slot_of(&manager, "a.rs");

        // Another caller reclaims first and now holds the lock.
        manager.acquire("a.rs", "agent-one", "", None).unwrap();

        // A reclaimer still working from the stale read must not move it.
        assert!(!manager.reclaim_if_stale(&record, &stale, manager.stale_timeout).unwrap());
        assert!(matches!(
            manager.acquire("a.rs", "agent-three", "", None),
            Err(TetherError::AlreadyLocked { ref holder, .. }) if holder == "agent-one"
        ));
        assert_eq!(manager.release("a.rs", "agent-one").unwrap().holder_id, "agent-one");
    }

    #[test]
    fn stale_generation_is_removed_once() {
        let (_dir, manager) = setup();
        manager.acquire("a.rs", "agent-a", "", None).unwrap();
        age_record(&manager, "a.rs", 7200);
        let (record, stale) = slot_of(&manager, "a.rs");

        assert!(manager.reclaim_if_stale(&record, &stale, manager.stale_timeout).unwrap());
        assert!(!manager.reclaim_if_stale(&record, &stale, manager.stale_timeout).unwrap());
        assert!(manager.inspect("a.rs").unwrap().is_none());
    }

    #[test]
    fn release_after_reclaim_sees_new_owner() {
        let (_dir, manager) = setup();
        manager.acquire("a.rs", "agent-a", "", None).unwrap();
        age_record(&manager, "a.rs", 7200);
        let (record, stale) = slot_of(&manager, "a.rs");
        assert!(manager.reclaim_if_stale(&record, &stale, manager.stale_timeout).unwrap());

        manager.acquire("a.rs", "agent-b", "", None).unwrap();
        assert!(matches!(
            manager.release("a.rs", "agent-a"),
            Err(TetherError::NotOwner { ref holder, .. }) if holder == "agent-b"
        ));
        assert_eq!(manager.inspect("a.rs").unwrap().unwrap().holder_id, "agent-b");
    }

    #[test]
    fn fresh_lock_is_never_reclaimed() {
        let (_dir, manager) = setup();
        manager.acquire("a.rs", "agent-a", "", None).unwrap();
        let (record, fresh) = slot_of(&manager, "a.rs");
        assert!(!manager.reclaim_if_stale(&record, &fresh, manager.stale_timeout).unwrap());
        assert!(manager.inspect("a.rs").unwrap().is_some());
    }

    #[test]
    fn cleanup_drops_expired_claim_files() {
        let (_dir, manager) = setup();
        manager.acquire("a.rs", "agent-a", "", None).unwrap();
        manager.release("a.rs", "agent-a").unwrap();
        let claims = |m: &LockManager| -> Vec<PathBuf> {
            fs::read_dir(&m.dir)
                .unwrap()
                .map(|e| e.unwrap().path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(CLAIM_EXTENSION))
                .collect()
        };
        let found = claims(&manager);
        assert_eq!(found.len(), 1);

        assert_eq!(manager.cleanup_stale(None, None).unwrap(), 0);
        assert_eq!(claims(&manager).len(), 1);

        let old = std::time::SystemTime::now() - Duration::from_secs(7200);
        fs::File::options()
            .write(true)
            .open(&found[0])
            .unwrap()
            .set_modified(old)
            .unwrap();
        manager.cleanup_stale(None, None).unwrap();
        assert!(claims(&manager).is_empty());
    }

    #[test]
    fn release_requires_owner() {
        let (_dir, manager) = setup();
        manager.acquire("a.rs", "agent-a", "mine", None).unwrap();

        let err = manager.release("a.rs", "agent-b").unwrap_err();
        assert!(matches!(err, TetherError::NotOwner { ref holder, .. } if holder == "agent-a"));
        assert_eq!(manager.inspect("a.rs").unwrap().unwrap().holder_id, "agent-a");

        let released = manager.release("a.rs", "agent-a").unwrap();
        assert_eq!(released.reason, "mine");
        assert!(manager.inspect("a.rs").unwrap().is_none());

        let err = manager.release("a.rs", "agent-a").unwrap_err();
        assert!(matches!(err, TetherError::NotHeld(_)));
    }

    #[test]
    fn refresh_updates_heartbeat_only_for_holder() {
        let (_dir, manager) = setup();
        manager.acquire("a.rs", "agent-a", "", None).unwrap();
        let refreshed = manager.refresh("a.rs", "agent-a").unwrap();
        assert!(refreshed.refreshed_at.is_some());
        assert!(matches!(
            manager.refresh("a.rs", "agent-b"),
            Err(TetherError::NotOwner { .. })
        ));
        assert!(matches!(
            manager.refresh("b.rs", "agent-a"),
            Err(TetherError::NotHeld(_))
        ));
    }

    #[test]
    fn refresh_of_stale_lock_is_refused() {
        let (_dir, manager) = setup();
        manager.acquire("a.rs", "agent-a", "", None).unwrap();
        age_record(&manager, "a.rs", 7200);
        assert!(matches!(
            manager.refresh("a.rs", "agent-a"),
            Err(TetherError::NotHeld(_))
        ));
    }

    #[test]
    fn refreshed_lock_is_not_stale() {
        let (_dir, manager) = setup();
        manager.acquire("a.rs", "agent-a", "", None).unwrap();
        let resource = manager.resolve("a.rs").unwrap();
        let record = manager.record_path(&resource);
        let mut lock = read_lock_file(&record).unwrap();
        lock.acquired_at = Utc::now() - chrono::Duration::seconds(7200);
        lock.refreshed_at = Some(Utc::now());
        fs::write(&record, serde_json::to_vec(&lock).unwrap()).unwrap();

        assert!(matches!(
            manager.acquire("a.rs", "agent-b", "", None),
            Err(TetherError::AlreadyLocked { .. })
        ));
    }

    #[test]
    fn force_break_ignores_holder() {
        let (_dir, manager) = setup();
        manager.acquire("a.rs", "agent-a", "", None).unwrap();
        let broken = manager.force_break("a.rs").unwrap().unwrap();
        assert_eq!(broken.holder_id, "agent-a");
        assert!(matches!(manager.force_break("a.rs"), Err(TetherError::NotHeld(_))));
    }

    #[test]
    fn corrupt_records_are_skipped_in_listing() {
        let (_dir, manager) = setup();
        manager.acquire("good.rs", "agent-a", "", None).unwrap();
        fs::write(manager.dir.join(format!("{}.json", "f".repeat(64))), "NOT JSON").unwrap();

        let locks = manager.list_locks().unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].resource_path.as_str(), "good.rs");
    }

    #[test]
    fn fresh_corrupt_record_blocks_acquire_and_release() {
        let (_dir, manager) = setup();
        let resource = manager.resolve("a.rs").unwrap();
        fs::write(manager.record_path(&resource), "{").unwrap();

        let err = manager.acquire("a.rs", "agent-a", "", None).unwrap_err();
        assert!(matches!(
            err,
            TetherError::AlreadyLocked { ref holder, .. } if holder == "<unreadable>"
        ));
        assert!(matches!(
            manager.release("a.rs", "agent-a"),
            Err(TetherError::StorageCorruption { .. })
        ));
        assert!(manager.force_break("a.rs").unwrap().is_none());
        manager.acquire("a.rs", "agent-a", "", None).unwrap();
    }

    #[test]
    fn cleanup_removes_only_stale_locks() {
        let (_dir, manager) = setup();
        manager.acquire("old.rs", "agent-a", "", None).unwrap();
        manager.acquire("new.rs", "agent-b", "", None).unwrap();
        age_record(&manager, "old.rs", 7200);

        assert_eq!(manager.cleanup_stale(None, None).unwrap(), 1);
        let remaining = manager.list_locks().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].resource_path.as_str(), "new.rs");
    }

    #[test]
    fn cleanup_with_custom_threshold() {
        let (_dir, manager) = setup();
        manager.acquire("a.rs", "agent-a", "", None).unwrap();
        age_record(&manager, "a.rs", 120);
        assert_eq!(manager.cleanup_stale(None, None).unwrap(), 0);
        assert_eq!(manager.cleanup_stale(Some(Duration::from_secs(60)), None).unwrap(), 1);
    }

    #[test]
    fn cleanup_respects_expired_deadline() {
        let (_dir, manager) = setup();
        manager.acquire("a.rs", "agent-a", "", None).unwrap();
        age_record(&manager, "a.rs", 7200);
        let removed = manager
            .cleanup_stale(None, Some(Instant::now() - Duration::from_millis(1)))
            .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(manager.list_locks().unwrap().len(), 1);
    }

    #[test]
    fn acquire_with_timeout_waits_for_release() {
        let (_dir, manager) = setup();
        let manager = Arc::new(manager);
        manager.acquire("a.rs", "agent-a", "", None).unwrap();

        let releaser = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                manager.release("a.rs", "agent-a").unwrap();
            })
        };
        let lock = manager
            .acquire("a.rs", "agent-b", "", Some(Duration::from_secs(5)))
            .unwrap();
        releaser.join().unwrap();
        assert_eq!(lock.holder_id, "agent-b");
    }

    #[test]
    fn acquire_with_timeout_gives_up() {
        let (_dir, manager) = setup();
        manager.acquire("a.rs", "agent-a", "", None).unwrap();
        let start = Instant::now();
        let err = manager
            .acquire("a.rs", "agent-b", "", Some(Duration::from_millis(150)))
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(start.elapsed() >= Duration::from_millis(150));
    }
}
