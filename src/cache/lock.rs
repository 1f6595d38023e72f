//! Path-scoped locking.
//!
//! Two layers cooperate:
//! - [`LockRegistry`]: in-process mutual exclusion keyed by canonical path.
//!   Handles are reference counted and dropped from the map as soon as no
//!   holder or waiter references them, so the path is the only identity.
//! - [`RepoLock`]: an advisory `flock` on a file next to the slot, which
//!   extends the exclusion to other processes sharing the same base directory.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fs2::FileExt;

use crate::error::SyncError;
use crate::types::CancelToken;

/// How long a waiter sleeps before re-checking cancellation and the timeout.
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct PathLock {
    held: Mutex<bool>,
    released: Condvar,
}

/// In-process registry of per-path exclusive locks.
///
/// Waiters block until the holder releases the path, or until their cancel
/// token fires. A timeout is opt-in.
#[derive(Debug)]
pub struct LockRegistry {
    locks: DashMap<PathBuf, Arc<PathLock>>,
    timeout: Option<Duration>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            timeout: None,
        }
    }

    /// Give up waiting after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout: Some(timeout),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Number of paths that currently have a live lock handle.
    pub fn tracked(&self) -> usize {
        self.locks.len()
    }

    /// Block until the lock for `path` is free, then take it.
    ///
    /// Fails with [`SyncError::Lock`] when `cancel` fires, or when the
    /// registry has a timeout and it elapses while waiting.
    pub fn acquire(&self, path: &Path, cancel: &CancelToken) -> Result<PathGuard<'_>, SyncError> {
        let key = canonical_key(path);
        let handle = self.handle(&key);
        let start = Instant::now();

        let outcome = {
            let mut held = handle.held.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if cancel.is_cancelled() {
                    break Err("interrupted while waiting for the lock".to_string());
                }
                if !*held {
                    *held = true;
                    break Ok(());
                }
                if let Some(timeout) = self.timeout.filter(|t| start.elapsed() >= *t) {
                    break Err(format!("lock acquisition timed out after {:?}", timeout));
                }
                held = handle
                    .released
                    .wait_timeout(held, WAIT_SLICE)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        };

        match outcome {
            Ok(()) => Ok(PathGuard {
                registry: self,
                path: key,
                handle: Some(handle),
            }),
            Err(reason) => {
                drop(handle);
                self.recycle(&key);
                Err(SyncError::Lock { path: key, reason })
            }
        }
    }

    /// Take the lock for `path` only if nobody holds it.
    pub fn try_acquire(&self, path: &Path) -> Option<PathGuard<'_>> {
        let key = canonical_key(path);
        let handle = self.handle(&key);
        let taken = {
            let mut held = handle.held.lock().unwrap_or_else(PoisonError::into_inner);
            !std::mem::replace(&mut *held, true)
        };
        if taken {
            Some(PathGuard {
                registry: self,
                path: key,
                handle: Some(handle),
            })
        } else {
            drop(handle);
            self.recycle(&key);
            None
        }
    }

    fn handle(&self, key: &Path) -> Arc<PathLock> {
        let entry = self.locks.entry(key.to_path_buf()).or_default();
        Arc::clone(entry.value())
    }

    // Only the map itself holds the handle: nobody is holding or waiting.
    fn recycle(&self, key: &Path) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Exclusive hold on a path; released when dropped.
#[derive(Debug)]
pub struct PathGuard<'a> {
    registry: &'a LockRegistry,
    path: PathBuf,
    handle: Option<Arc<PathLock>>,
}

impl PathGuard<'_> {
    /// The canonical path this guard holds.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            *handle.held.lock().unwrap_or_else(PoisonError::into_inner) = false;
            handle.released.notify_one();
            drop(handle);
            self.registry.recycle(&self.path);
        }
    }
}

/// Canonical absolute form of `path`, even when its tail does not exist yet.
pub fn canonical_key(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
            canonical_key(parent).join(name)
        }
        _ => std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()),
    }
}

/// A guard that holds an exclusive cross-process lock on a slot.
/// Lock is released when dropped.
#[derive(Debug)]
pub struct RepoLock {
    file: File,
}

impl RepoLock {
    /// Acquire an exclusive lock, blocking until available or cancelled.
    /// Creates the lock file and parent dirs if needed.
    ///
    /// Returns an error with `ErrorKind::TimedOut` if a `timeout` is given and
    /// the lock cannot be acquired within it, or `ErrorKind::Interrupted` when
    /// cancelled.
    pub fn acquire(
        lock_path: &Path,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> io::Result<Self> {
        // Create parent dirs
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Open/create lock file
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        // Try to acquire lock with polling and exponential backoff
        let start = Instant::now();
        let mut sleep_duration = Duration::from_millis(10);
        let max_sleep = Duration::from_millis(500);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if cancel.is_cancelled() {
                        return Err(io::Error::new(
                            io::ErrorKind::Interrupted,
                            "lock acquisition interrupted",
                        ));
                    }
                    // Lock is held by another process, check timeout
                    let mut nap = sleep_duration;
                    if let Some(timeout) = timeout {
                        if start.elapsed() >= timeout {
                            return Err(io::Error::new(
                                io::ErrorKind::TimedOut,
                                format!("lock acquisition timed out after {:?}", timeout),
                            ));
                        }
                        nap = nap.min(timeout.saturating_sub(start.elapsed()));
                    }
                    std::thread::sleep(nap);
                    sleep_duration = (sleep_duration * 2).min(max_sleep);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_creates_lock_file() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("subdir").join("slot.lock");

        assert!(!lock_path.exists());

        let lock = RepoLock::acquire(&lock_path, None, &CancelToken::new()).unwrap();

        assert!(lock_path.exists());

        drop(lock);
    }

    #[test]
    fn test_repo_lock_times_out_while_held() {
        let dir = tempdir().unwrap();
        let lock_path = Arc::new(dir.path().join("slot.lock"));
        let barrier = Arc::new(Barrier::new(2));

        let lock_path_clone = Arc::clone(&lock_path);
        let barrier_clone = Arc::clone(&barrier);

        let handle1 = thread::spawn(move || {
            let lock =
                RepoLock::acquire(&lock_path_clone, None, &CancelToken::new())
                    .unwrap();
            barrier_clone.wait();
            thread::sleep(Duration::from_millis(500));
            drop(lock);
        });

        let handle2 = thread::spawn(move || {
            barrier.wait();
            let result =
                RepoLock::acquire(&lock_path, Some(Duration::from_millis(100)), &CancelToken::new());
            let err = result.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        });

        handle1.join().unwrap();
        handle2.join().unwrap();
    }

    #[test]
    fn test_repo_lock_honours_cancellation() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("slot.lock");
        let _held = RepoLock::acquire(&lock_path, None, &CancelToken::new()).unwrap();

        // flock is per open file description, so a second open contends even in-process.
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = RepoLock::acquire(&lock_path, None, &cancel).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn test_default_registry_waits_for_slow_holders() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slot");
        let registry = Arc::new(LockRegistry::new());
        assert_eq!(registry.timeout(), None);
        let barrier = Arc::new(Barrier::new(2));

        let holder = {
            let registry = Arc::clone(&registry);
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let guard = registry.acquire(&path, &CancelToken::new()).unwrap();
                barrier.wait();
                thread::sleep(Duration::from_millis(300));
                drop(guard);
            })
        };

        barrier.wait();
        let started = Instant::now();
        let guard = registry.acquire(&path, &CancelToken::new()).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        drop(guard);
        holder.join().unwrap();
    }

    #[test]
    fn test_unbounded_wait_still_honours_cancellation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slot");
        let registry = Arc::new(LockRegistry::new());
        let _held = registry.acquire(&path, &CancelToken::new()).unwrap();

        let cancel = CancelToken::new();
        let waiter = {
            let registry = Arc::clone(&registry);
            let cancel = cancel.clone();
            thread::spawn(move || registry.acquire(&path, &cancel).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(100));
        cancel.cancel();
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, SyncError::Lock { .. }));
    }

    #[test]
    fn test_registry_recycles_idle_handles() {
        let dir = tempdir().unwrap();
        let registry = LockRegistry::new();
        let cancel = CancelToken::new();

        let guard = registry.acquire(&dir.path().join("a"), &cancel).unwrap();
        assert_eq!(registry.tracked(), 1);
        drop(guard);
        assert_eq!(registry.tracked(), 0);

        // A recreated handle behaves exactly like the first one.
        let again = registry.acquire(&dir.path().join("a"), &cancel).unwrap();
        assert!(registry.try_acquire(&dir.path().join("a")).is_none());
        drop(again);
        assert!(registry.try_acquire(&dir.path().join("a")).is_some());
    }

    #[test]
    fn test_registry_keys_by_canonical_path() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let registry = LockRegistry::new();

        let _guard = registry
            .acquire(&dir.path().join("slot"), &CancelToken::new())
            .unwrap();
        let aliased = dir.path().join("sub").join("..").join("slot");
        assert!(registry.try_acquire(&aliased).is_none());
    }

    #[test]
    fn test_same_path_serializes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slot");
        let registry = Arc::new(LockRegistry::new());
        let first_done = Arc::new(AtomicBool::new(false));
        let barrier = Arc::new(Barrier::new(2));

        let holder = {
            let registry = Arc::clone(&registry);
            let path = path.clone();
            let first_done = Arc::clone(&first_done);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let guard = registry.acquire(&path, &CancelToken::new()).unwrap();
                barrier.wait();
                thread::sleep(Duration::from_millis(200));
                first_done.store(true, Ordering::SeqCst);
                drop(guard);
            })
        };

        barrier.wait();
        let guard = registry.acquire(&path, &CancelToken::new()).unwrap();
        assert!(
            first_done.load(Ordering::SeqCst),
            "second caller must wait for the first critical section"
        );
        drop(guard);
        holder.join().unwrap();
        assert_eq!(registry.tracked(), 0);
    }

    #[test]
    fn test_different_paths_do_not_block() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(LockRegistry::with_timeout(Duration::from_millis(200)));
        let barrier = Arc::new(Barrier::new(2));

        let holder = {
            let registry = Arc::clone(&registry);
            let path = dir.path().join("one");
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let _guard = registry.acquire(&path, &CancelToken::new()).unwrap();
                barrier.wait();
                barrier.wait();
            })
        };

        barrier.wait();
        let started = Instant::now();
        let other = registry.acquire(&dir.path().join("two"), &CancelToken::new());
        assert!(other.is_ok());
        assert!(started.elapsed() < Duration::from_millis(200));
        drop(other);
        barrier.wait();
        holder.join().unwrap();
    }

    #[test]
    fn test_registry_times_out_and_cancels() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slot");
        let registry = LockRegistry::with_timeout(Duration::from_millis(100));
        let _held = registry.acquire(&path, &CancelToken::new()).unwrap();

        let err = registry.acquire(&path, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, SyncError::Lock { .. }));

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = registry.acquire(&path, &cancel).unwrap_err();
        match err {
            SyncError::Lock { reason, .. } => assert!(reason.contains("interrupted")),
            other => panic!("expected lock error, got {:?}", other),
        }
        // Failed waiters do not leave extra handles behind.
        assert_eq!(registry.tracked(), 1);
    }
}
