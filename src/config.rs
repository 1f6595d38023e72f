//! Tool configuration loaded from a JSON file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheDirectoryRegistry, CachePaths, LockRegistry};
use crate::error::SyncError;
use crate::fetch::ShallowBranchSwitch;
use crate::git::{self, BackendKind, GitBackend};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct SyncConfig {
    /// Directory holding `_cache/`.
    pub base_dir: PathBuf,
    pub backend: BackendKind,
    /// `git` executable for the CLI backend; `git` on `PATH` when unset.
    pub git_path: Option<String>,
    /// Give up waiting for a busy slot after this many seconds; wait until
    /// the holder is done or the run is cancelled when unset.
    pub lock_timeout_secs: Option<u64>,
    pub shallow_branch_switch: ShallowBranchSwitch,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_dir: CachePaths::default().root().to_path_buf(),
            backend: BackendKind::default(),
            git_path: None,
            lock_timeout_secs: None,
            shallow_branch_switch: ShallowBranchSwitch::default(),
        }
    }
}

impl SyncConfig {
    /// Read `path`, or return the defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, SyncError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(SyncError::Config("baseDir cannot be empty".to_string()));
        }
        if self.lock_timeout_secs == Some(0) {
            return Err(SyncError::Config(
                "lockTimeoutSecs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_secs.map(Duration::from_secs)
    }

    pub fn backend(&self) -> Arc<dyn GitBackend> {
        Arc::from(git::backend(self.backend, self.git_path.as_deref()))
    }

    pub fn registry(&self) -> CacheDirectoryRegistry {
        let locks = Arc::new(match self.lock_timeout() {
            Some(timeout) => LockRegistry::with_timeout(timeout),
            None => LockRegistry::new(),
        });
        CacheDirectoryRegistry::new(CachePaths::new(&self.base_dir), locks)
    }
}
