//! Cache slot allocation.
//!
//! A slot is `<base>/_cache/<hash>-<index>` where `hash` is derived from the
//! repository signature. Different signatures may hash identically, so each
//! slot records its owner in a `description` file and probing moves on to the
//! next index whenever the description disagrees.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::CachePaths;
use super::lock::{LockRegistry, PathGuard, RepoLock};
use crate::error::SyncError;
use crate::types::CancelToken;

/// Maps a signature to the hash part of a slot name.
pub type SignatureHasher = fn(&str) -> String;

/// Hex-encoded SHA-256 of the signature.
pub fn sha256_hex(signature: &str) -> String {
    hex::encode(Sha256::digest(signature.as_bytes()))
}

/// An allocated cache slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSlot {
    /// Canonical slot directory.
    pub root: PathBuf,
    /// Signature recorded in the slot's description.
    pub signature: String,
}

impl CacheSlot {
    /// The git directory callers fetch into.
    pub fn repository(&self) -> PathBuf {
        CachePaths::repository_dir(&self.root)
    }

    pub fn description_file(&self) -> PathBuf {
        CachePaths::description_file(&self.root)
    }
}

/// Exclusive hold on a slot for both threads and other processes.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    _file: RepoLock,
    process: PathGuard<'a>,
}

impl SlotGuard<'_> {
    pub fn path(&self) -> &Path {
        self.process.path()
    }
}

enum Probe {
    Owned,
    Collision,
    Absent,
}

/// Allocates, locks, verifies and deletes cache slots.
pub struct CacheDirectoryRegistry {
    paths: CachePaths,
    locks: Arc<LockRegistry>,
    hasher: SignatureHasher,
}

impl CacheDirectoryRegistry {
    pub fn new(paths: CachePaths, locks: Arc<LockRegistry>) -> Self {
        Self {
            paths,
            locks,
            hasher: sha256_hex,
        }
    }

    /// Replace the signature hash function.
    pub fn with_hasher(mut self, hasher: SignatureHasher) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    /// Return the slot owned by `signature`, creating it on first use.
    pub fn acquire(&self, signature: &str, cancel: &CancelToken) -> Result<CacheSlot, SyncError> {
        let cache_dir = self.cache_dir()?;
        let hash = (self.hasher)(signature);

        for index in 1u64.. {
            let candidate = cache_dir.join(CachePaths::slot_name(&hash, index));
            let _guard = self.lock(&candidate, cancel)?;

            match probe(&candidate, signature)? {
                Probe::Owned => {
                    log::debug!("Reusing cache slot {}", candidate.display());
                    return Ok(slot(candidate, signature));
                }
                Probe::Collision => {
                    log::debug!(
                        "Cache slot {} belongs to another repository, probing next index",
                        candidate.display()
                    );
                }
                Probe::Absent => {
                    fs::create_dir_all(&candidate)?;
                    fs::write(CachePaths::description_file(&candidate), signature)?;
                    log::info!("Created cache slot {}", candidate.display());
                    return Ok(slot(candidate, signature));
                }
            }
        }

        unreachable!("slot probing only ends by returning")
    }

    /// Look up the slot owned by `signature` without creating one.
    pub fn find(&self, signature: &str, cancel: &CancelToken) -> Result<Option<CacheSlot>, SyncError> {
        let cache_dir = self.cache_dir()?;
        let hash = (self.hasher)(signature);

        for index in 1u64.. {
            let candidate = cache_dir.join(CachePaths::slot_name(&hash, index));
            let _guard = self.lock(&candidate, cancel)?;

            match probe(&candidate, signature)? {
                Probe::Owned => return Ok(Some(slot(candidate, signature))),
                Probe::Collision => continue,
                Probe::Absent => return Ok(None),
            }
        }

        unreachable!("slot probing only ends by returning")
    }

    /// Hold the slot's lock, serializing fetch, checkout and deletion on it.
    pub fn lock_slot(&self, slot: &CacheSlot, cancel: &CancelToken) -> Result<SlotGuard<'_>, SyncError> {
        self.lock(&slot.root, cancel)
    }

    /// Remove a slot and everything in it. Returns `false` if it was already gone.
    pub fn delete(&self, slot: &CacheSlot, cancel: &CancelToken) -> Result<bool, SyncError> {
        let _guard = self.lock(&slot.root, cancel)?;
        match fs::remove_dir_all(&slot.root) {
            Ok(()) => {
                log::info!("Deleted cache slot {}", slot.root.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Inventory of slots whose description can be read.
    pub fn list(&self) -> Result<Vec<CacheSlot>, SyncError> {
        let cache_dir = self.paths.cache_dir();
        let entries = match fs::read_dir(&cache_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut slots = Vec::new();
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if CachePaths::parse_slot_name(name).is_none() {
                continue;
            }
            let root = entry.path();
            match fs::read_to_string(CachePaths::description_file(&root)) {
                Ok(signature) => slots.push(CacheSlot { root, signature }),
                Err(e) => log::warn!("Skipping cache slot {}: {}", root.display(), e),
            }
        }

        slots.sort_by(|a, b| a.root.cmp(&b.root));
        Ok(slots)
    }

    fn cache_dir(&self) -> Result<PathBuf, SyncError> {
        let cache_dir = self.paths.cache_dir();
        fs::create_dir_all(&cache_dir)?;
        Ok(fs::canonicalize(&cache_dir)?)
    }

    fn lock(&self, slot_dir: &Path, cancel: &CancelToken) -> Result<SlotGuard<'_>, SyncError> {
        let process = self.locks.acquire(slot_dir, cancel)?;
        let lock_path = CachePaths::lock_file(process.path());
        let file = RepoLock::acquire(&lock_path, self.locks.timeout(), cancel).map_err(|e| {
            SyncError::Lock {
                path: process.path().to_path_buf(),
                reason: e.to_string(),
            }
        })?;
        Ok(SlotGuard {
            _file: file,
            process,
        })
    }
}

fn slot(root: PathBuf, signature: &str) -> CacheSlot {
    CacheSlot {
        root,
        signature: signature.to_string(),
    }
}

fn probe(candidate: &Path, signature: &str) -> Result<Probe, SyncError> {
    if !candidate.exists() {
        return Ok(Probe::Absent);
    }
    match fs::read_to_string(CachePaths::description_file(candidate)) {
        Ok(existing) if existing == signature => Ok(Probe::Owned),
        Ok(_) => Ok(Probe::Collision),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // Creation was interrupted before the description landed; reclaim it.
            log::warn!(
                "Cache slot {} has no description, reclaiming it",
                candidate.display()
            );
            Ok(Probe::Absent)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;
    use tempfile::tempdir;

    fn registry(base: &Path) -> CacheDirectoryRegistry {
        CacheDirectoryRegistry::new(CachePaths::new(base), Arc::new(LockRegistry::new()))
    }

    fn constant_hash(_: &str) -> String {
        "c0ffee".to_string()
    }

    #[test]
    fn acquire_is_idempotent() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());
        let cancel = CancelToken::new();

        let first = registry.acquire("url: a\nusername: ", &cancel).unwrap();
        let second = registry.acquire("url: a\nusername: ", &cancel).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.repository(), first.root.join("repository"));
        assert_eq!(
            fs::read_to_string(first.description_file()).unwrap(),
            "url: a\nusername: "
        );
    }

    #[test]
    fn acquire_uses_hash_and_first_index() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());
        let slot = registry.acquire("sig", &CancelToken::new()).unwrap();
        let expected = format!("{}-1", sha256_hex("sig"));
        assert_eq!(slot.root.file_name().unwrap().to_str().unwrap(), expected);
    }

    #[test]
    fn colliding_signatures_get_separate_slots() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path()).with_hasher(constant_hash);
        let cancel = CancelToken::new();

        let a = registry.acquire("signature a", &cancel).unwrap();
        let b = registry.acquire("signature b", &cancel).unwrap();

        assert_ne!(a.root, b.root);
        assert!(a.root.ends_with("c0ffee-1"));
        assert!(b.root.ends_with("c0ffee-2"));
        assert_ne!(
            fs::read_to_string(a.description_file()).unwrap(),
            fs::read_to_string(b.description_file()).unwrap()
        );

        // Probing still finds each owner after the collision.
        assert_eq!(registry.acquire("signature b", &cancel).unwrap(), b);
        assert_eq!(registry.find("signature a", &cancel).unwrap(), Some(a));
    }

    #[test]
    fn find_does_not_create() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());
        assert_eq!(registry.find("nobody", &CancelToken::new()).unwrap(), None);
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn interrupted_creation_is_reclaimed() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path()).with_hasher(constant_hash);
        fs::create_dir_all(registry.paths().slot_dir("c0ffee", 1)).unwrap();

        let slot = registry.acquire("sig", &CancelToken::new()).unwrap();
        assert!(slot.root.ends_with("c0ffee-1"));
        assert_eq!(fs::read_to_string(slot.description_file()).unwrap(), "sig");
    }

    #[test]
    fn delete_removes_slot_and_allows_recreation() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());
        let cancel = CancelToken::new();

        let slot = registry.acquire("sig", &cancel).unwrap();
        fs::create_dir_all(slot.repository()).unwrap();
        assert!(registry.delete(&slot, &cancel).unwrap());
        assert!(!slot.root.exists());
        assert!(!registry.delete(&slot, &cancel).unwrap());

        let again = registry.acquire("sig", &cancel).unwrap();
        assert_eq!(again.root, slot.root);
    }

    #[test]
    fn list_reports_slots_and_skips_lock_files() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());
        let cancel = CancelToken::new();
        registry.acquire("one", &cancel).unwrap();
        registry.acquire("two", &cancel).unwrap();

        let signatures: HashSet<_> = registry
            .list()
            .unwrap()
            .into_iter()
            .map(|s| s.signature)
            .collect();
        assert_eq!(signatures, HashSet::from(["one".to_string(), "two".to_string()]));
    }

    #[test]
    fn lock_slot_blocks_acquire_of_same_slot() {
        let dir = tempdir().unwrap();
        let locks = Arc::new(LockRegistry::with_timeout(std::time::Duration::from_millis(100)));
        let registry = CacheDirectoryRegistry::new(CachePaths::new(dir.path()), locks);
        let cancel = CancelToken::new();

        let slot = registry.acquire("sig", &cancel).unwrap();
        let _guard = registry.lock_slot(&slot, &cancel).unwrap();
        let err = registry.acquire("sig", &cancel).unwrap_err();
        assert!(matches!(err, SyncError::Lock { .. }));
    }

    #[test]
    fn concurrent_acquire_yields_one_slot() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(registry(dir.path()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.acquire("shared", &CancelToken::new()).unwrap())
            })
            .collect();
        let roots: HashSet<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().root)
            .collect();

        assert_eq!(roots.len(), 1);
        assert_eq!(registry.list().unwrap().len(), 1);
    }
}
