use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{Result, TetherError};
use crate::store::atomic;

/// Minimum secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// The process-wide key used to sign messages.
///
/// Loaded once at startup; the bytes never leave this type except through
/// [`SharedSecret::as_bytes`].
#[derive(Clone)]
pub struct SharedSecret(Vec<u8>);

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret(<{} bytes>)", self.0.len())
    }
}

impl SharedSecret {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < MIN_SECRET_LEN {
            return Err(TetherError::Secret(format!(
                "secret is {} bytes, need at least {MIN_SECRET_LEN}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Load a hex-encoded secret, refusing files other users can read.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TetherError::Secret(format!(
                "no secret at {} (run `tether init`)",
                path.display()
            )));
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(path)?.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(TetherError::Secret(format!(
                    "{} is accessible by other users (mode {:o}); chmod 600 it",
                    path.display(),
                    mode & 0o777
                )));
            }
        }
        let text = fs::read_to_string(path)?;
        let bytes = hex::decode(text.trim())
            .map_err(|e| TetherError::Secret(format!("{} is not hex: {e}", path.display())))?;
        Self::from_bytes(bytes)
    }

    /// Write a fresh random secret to `path`. Fails if one already exists.
    pub fn generate(path: &Path) -> Result<Self> {
        let mut bytes = vec![0_u8; MIN_SECRET_LEN];
        getrandom::fill(&mut bytes)
            .map_err(|e| TetherError::Secret(format!("random source failed: {e}")))?;

        let mut file = atomic::private_options()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(hex::encode(&bytes).as_bytes())?;
        file.sync_all()?;
        tracing::info!(path = %path.display(), "generated shared secret");
        Self::from_bytes(bytes)
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::generate(path)
        }
    }
}
