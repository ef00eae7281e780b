use fs2::FileExt;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TetherError};
use crate::store::atomic;

/// Take an exclusive advisory lock on `path`, returning the locked handle.
///
/// Retries with exponential backoff (1ms to 512ms, ~1s total) before failing
/// with `Busy`. The lock is released when the handle is dropped.
pub fn acquire_lock(path: &Path) -> Result<File> {
    let file = atomic::private_options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let mut delay = Duration::from_millis(1);
    let max_delay = Duration::from_millis(512);

    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(_) if delay <= max_delay => {
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(_) => {
                return Err(TetherError::Busy(path.display().to_string()));
            }
        }
    }
}

/// Release lock explicitly (normally handled by Drop).
pub fn release_lock(file: File) -> Result<()> {
    FileExt::unlock(&file)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_and_release_lock() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");

        let file = acquire_lock(&lock_path).unwrap();
        release_lock(file).unwrap();
        let _file = acquire_lock(&lock_path).unwrap();
    }

    #[test]
    fn acquire_fails_busy_after_retries_exhausted() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("held.lock");

        let _file = acquire_lock(&lock_path).unwrap();

        let start = std::time::Instant::now();
        let err = acquire_lock(&lock_path).unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, TetherError::Busy(_)));
        assert!(err.is_retryable());
        assert!(
            elapsed >= Duration::from_millis(500),
            "expected retry backoff, but elapsed was {elapsed:?}",
        );
    }
}
