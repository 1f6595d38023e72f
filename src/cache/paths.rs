//! Cache directory path management
//!
//! This module provides the `CachePaths` struct which manages all filesystem paths
//! for the cache directory layout:
//!
//! ```text
//! <base>/
//! └── _cache/
//!     ├── <hash>-1/
//!     │   ├── description       # Canonical signature of the slot owner
//!     │   └── repository/       # Git directory shared across builds
//!     ├── <hash>-1.lock         # flock-based cross-process locking
//!     └── <hash>-2/             # Next probe after a hash collision
//! ```

use std::path::{Path, PathBuf};

const CACHE_DIR: &str = "_cache";
const DESCRIPTION_FILE: &str = "description";
const REPOSITORY_DIR: &str = "repository";

/// Manages all filesystem paths for the cache directory layout
#[derive(Debug, Clone)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    /// Creates a new CachePaths with the specified base directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the base directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the slot container: `{root}/_cache`
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    /// Returns the directory name of a slot: `{hash}-{index}`
    pub fn slot_name(hash: &str, index: u64) -> String {
        format!("{}-{}", hash, index)
    }

    /// Returns the slot directory: `{root}/_cache/{hash}-{index}`
    pub fn slot_dir(&self, hash: &str, index: u64) -> PathBuf {
        self.cache_dir().join(Self::slot_name(hash, index))
    }

    /// Returns the description file inside a slot
    pub fn description_file(slot: &Path) -> PathBuf {
        slot.join(DESCRIPTION_FILE)
    }

    /// Returns the git directory inside a slot
    pub fn repository_dir(slot: &Path) -> PathBuf {
        slot.join(REPOSITORY_DIR)
    }

    /// Returns the lock file sitting next to a slot: `{slot}.lock`
    pub fn lock_file(slot: &Path) -> PathBuf {
        let mut name = slot
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        slot.with_file_name(name)
    }

    /// Parses `{hash}-{index}` back into its parts.
    pub fn parse_slot_name(name: &str) -> Option<(&str, u64)> {
        let (hash, index) = name.rsplit_once('-')?;
        if hash.is_empty() || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let index = index.parse::<u64>().ok().filter(|i| *i > 0)?;
        Some((hash, index))
    }
}

impl Default for CachePaths {
    /// Creates a CachePaths using the system cache directory + "gitsync"
    ///
    /// Uses `dirs::cache_dir()` which resolves to:
    /// - Linux: `~/.cache`
    /// - macOS: `~/Library/Caches`
    /// - Windows: `C:\Users\<user>\AppData\Local`
    fn default() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));
        Self::new(cache_dir.join("gitsync"))
    }
}
