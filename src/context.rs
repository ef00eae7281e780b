use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::CoordinationConfig;
use crate::error::{Result, TetherError};
use crate::secret::SharedSecret;
use crate::store::atomic;

/// Name of the per-project state directory.
pub const STATE_DIR: &str = ".tether";

/// Everything a coordination component needs, built once per process.
///
/// Immutable after construction; components receive it through an `Arc`
/// instead of reaching for globals.
#[derive(Debug)]
pub struct CoordinationContext {
    project_root: PathBuf,
    state_dir: PathBuf,
    config: CoordinationConfig,
    secret: SharedSecret,
}

impl CoordinationContext {
    /// Open an initialized workspace: canonical root, validated config,
    /// and the shared secret from `.tether/secret.key`.
    pub fn open(project_root: &Path, config: CoordinationConfig) -> Result<Arc<Self>> {
        let project_root = project_root.canonicalize()?;
        let state_dir = project_root.join(STATE_DIR);
        if !state_dir.is_dir() {
            return Err(TetherError::NotInitialized);
        }
        let secret = SharedSecret::load(&state_dir.join("secret.key"))?;
        Self::build(project_root, state_dir, config, secret)
    }

    /// Create the state directory and secret if missing, then open.
    pub fn init(project_root: &Path, config: CoordinationConfig) -> Result<Arc<Self>> {
        let project_root = project_root.canonicalize()?;
        let state_dir = project_root.join(STATE_DIR);
        atomic::ensure_private_dir(&state_dir)?;
        let secret = SharedSecret::load_or_generate(&state_dir.join("secret.key"))?;
        Self::build(project_root, state_dir, config, secret)
    }

    /// Assemble a context from parts (tests and embedders that manage their own secret).
    pub fn with_secret(
        project_root: &Path,
        config: CoordinationConfig,
        secret: SharedSecret,
    ) -> Result<Arc<Self>> {
        let project_root = project_root.canonicalize()?;
        let state_dir = project_root.join(STATE_DIR);
        atomic::ensure_private_dir(&state_dir)?;
        Self::build(project_root, state_dir, config, secret)
    }

    fn build(
        project_root: PathBuf,
        state_dir: PathBuf,
        config: CoordinationConfig,
        secret: SharedSecret,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            project_root,
            state_dir,
            config,
            secret,
        }))
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn secret(&self) -> &SharedSecret {
        &self.secret
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn acks_dir(&self) -> PathBuf {
        self.state_dir.join("acks")
    }

    pub fn message_log_path(&self) -> PathBuf {
        self.state_dir.join("messages.jsonl")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join("agents.json")
    }

    pub fn config_path(project_root: &Path) -> PathBuf {
        project_root.join(STATE_DIR).join("config.yaml")
    }
}

/// Walk up from `start` to the nearest directory containing `.tether/`.
pub fn find_project_root(start: &Path) -> Result<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join(STATE_DIR).is_dir() {
            return Ok(dir);
        }
        if !dir.pop() {
            return Err(TetherError::NotInitialized);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_requires_init() {
        let dir = tempdir().unwrap();
        let err = CoordinationContext::open(dir.path(), CoordinationConfig::default()).unwrap_err();
        assert!(matches!(err, TetherError::NotInitialized));
    }

    #[test]
    fn init_then_open_shares_secret() {
        let dir = tempdir().unwrap();
        let first = CoordinationContext::init(dir.path(), CoordinationConfig::default()).unwrap();
        let second = CoordinationContext::open(dir.path(), CoordinationConfig::default()).unwrap();
        assert_eq!(first.secret().as_bytes(), second.secret().as_bytes());
        assert!(second.state_dir().ends_with(STATE_DIR));
    }

    #[test]
    fn invalid_config_is_rejected_at_startup() {
        let dir = tempdir().unwrap();
        let mut config = CoordinationConfig::default();
        config.rate_limiting.window_seconds = 0;
        let err = CoordinationContext::init(dir.path(), config).unwrap_err();
        assert!(matches!(err, TetherError::Config(_)));
    }

    #[test]
    fn project_root_found_from_subdirectory() {
        let dir = tempdir().unwrap();
        CoordinationContext::init(dir.path(), CoordinationConfig::default()).unwrap();
        let nested = dir.path().join("src/deep");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_project_root(&nested).unwrap(), dir.path());

        let elsewhere = tempdir().unwrap();
        assert!(matches!(
            find_project_root(elsewhere.path()),
            Err(TetherError::NotInitialized)
        ));
    }
}
