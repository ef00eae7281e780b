//! Filesystem primitives that never expose a half-written record.
//!
//! `create_exclusive` is the compare-and-swap used by the lock store: the
//! record is fully written to a private temp file and then hard-linked into
//! place. `link(2)` refuses to overwrite, so exactly one creator wins and
//! readers only ever see complete files. `replace` is the usual temp +
//! rename for records that a single owner rewrites.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Create `dir` (and parents) and restrict it to the owning user.
pub fn ensure_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Open options for a new owner-only (0600) file.
pub fn private_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let token = uuid::Uuid::new_v4().simple().to_string();
    path.with_file_name(format!(".{name}.{}.{suffix}", &token[..12]))
}

fn write_temp(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let tmp = sibling(path, "tmp");
    let mut file: File = private_options().write(true).create_new(true).open(&tmp)?;
    let written = file.write_all(bytes).and_then(|()| file.sync_all());
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(tmp)
}

/// Publish `bytes` at `path` only if nothing exists there yet.
///
/// Returns `Ok(false)` when another writer already owns `path`.
pub fn create_exclusive(path: &Path, bytes: &[u8]) -> Result<bool> {
    let tmp = write_temp(path, bytes)?;
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Atomically replace (or create) `path` with `bytes`.
pub fn replace(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = write_temp(path, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Move `path` aside to a unique name so no other process can claim the
/// same file. Returns `None` when it was already gone.
pub fn take(path: &Path) -> Result<Option<PathBuf>> {
    let taken = sibling(path, "taken");
    match fs::rename(path, &taken) {
        Ok(()) => Ok(Some(taken)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// True for the temp and tombstone names produced by this module.
pub fn is_scratch(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && (n.ends_with(".tmp") || n.ends_with(".taken")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_exclusive_only_first_writer_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("record.json");

        assert!(create_exclusive(&path, b"first").unwrap());
        assert!(!create_exclusive(&path, b"second").unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "first");

        // No temp files left behind on either path.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_scratch(&e.path()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn replace_overwrites_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        replace(&path, b"one").unwrap();
        replace(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
    }

    #[test]
    fn take_moves_file_aside_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("record.json");
        fs::write(&path, "x").unwrap();

        let taken = take(&path).unwrap().unwrap();
        assert!(!path.exists());
        assert!(is_scratch(&taken));
        assert!(take(&path).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn records_and_dirs_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let private = dir.path().join("state");
        ensure_private_dir(&private).unwrap();
        let mode = fs::metadata(&private).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        let path = private.join("record.json");
        create_exclusive(&path, b"{}").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
