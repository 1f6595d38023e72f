//! Checkout engine
//!
//! Materializes a revision into a working directory. The history may live in
//! the working directory itself or in a separate cache slot, in which case the
//! working directory borrows its objects through `objects/info/alternates`
//! instead of copying them.
//!
//! The baseline of a checkout is what the working repository itself records
//! as checked out (its `HEAD`, backed by a non-empty index). The caller's
//! `previous` revision is advisory and only logged when it disagrees.

pub(crate) mod verify;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{ErrorCode, Oid, Repository};

use crate::error::SyncError;
use crate::git::{GitBackend, resolve_commit, resolve_revision};
use crate::sink::{ProgressSink, RedactingSink};
use crate::types::CancelToken;

const INDEX_LOCK: &str = "index.lock";

/// Symbolic `HEAD` target used while nothing is checked out.
const UNBORN_HEAD: &str = "refs/heads/gitsync-unborn";

/// Moves working trees to exact revisions.
pub struct CheckoutEngine {
    backend: Arc<dyn GitBackend>,
}

impl CheckoutEngine {
    pub fn new(backend: Arc<dyn GitBackend>) -> Self {
        Self { backend }
    }

    /// Check out `target` from `history_source` into `work_dir` and return its full commit id.
    ///
    /// `previous` is the revision the caller believes is checked out. It is
    /// checked against the working repository's own record, which wins.
    pub fn checkout(
        &self,
        history_source: &Path,
        work_dir: &Path,
        target: &str,
        previous: Option<&str>,
        sink: &dyn ProgressSink,
    ) -> Result<String, SyncError> {
        self.checkout_with_cancel(
            history_source,
            work_dir,
            target,
            previous,
            sink,
            &CancelToken::new(),
        )
    }

    /// [`Self::checkout`], stopping with `Interrupted` when `cancel` fires
    /// before the working tree is modified.
    pub fn checkout_with_cancel(
        &self,
        history_source: &Path,
        work_dir: &Path,
        target: &str,
        previous: Option<&str>,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<String, SyncError> {
        let sink = RedactingSink::new(sink);
        let history = Repository::open(history_source).map_err(|e| {
            if e.code() == ErrorCode::NotFound {
                SyncError::missing(target, format!("{} holds no history", history_source.display()))
            } else {
                SyncError::Git(e)
            }
        })?;

        let target_commit = resolve_commit(&history, target)?;
        target_commit
            .tree()
            .map_err(|e| SyncError::missing_object(target, e.message().to_string()))?;
        let target_id = target_commit.id();

        let claimed = previous.map(|revision| (revision, resolve_revision(&history, revision)));

        let git_dir = prepare_work_repo(&history, work_dir)?;
        drop(target_commit);
        drop(history);
        remove_stale_index_lock(&git_dir)?;

        let repo = Repository::open(work_dir)?;
        let baseline = recorded_baseline(&repo)?;
        match claimed {
            Some((revision, None)) => log::info!(
                "Previous revision {} is unknown, using the working tree's own record",
                revision
            ),
            Some((revision, Some(id))) if Some(id) != baseline => log::info!(
                "Previous revision {} does not match the working tree ({}), using the working tree's record",
                revision,
                baseline.map_or_else(|| "nothing checked out".to_string(), |b| b.to_string())
            ),
            _ => {}
        }
        if baseline.is_none() {
            // An unborn HEAD makes the empty tree the baseline.
            repo.set_head(UNBORN_HEAD)?;
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Interrupted {
                operation: format!("checkout of {}", target_id),
            });
        }
        sink.report(&format!("Checking out {}", target_id), None);
        self.backend
            .perform_checkout(work_dir, baseline, target_id, &sink, cancel)?;

        repo.set_head_detached(target_id)?;
        log::info!("Checked out {} into {}", target_id, work_dir.display());
        Ok(target_id.to_string())
    }
}

/// The commit the working repository has checked out, if any.
///
/// Nothing is checked out when the index is empty, or when `HEAD` does not
/// lead to a commit whose tree is available.
fn recorded_baseline(repo: &Repository) -> Result<Option<Oid>, SyncError> {
    if repo.index()?.is_empty() {
        return Ok(None);
    }
    let Ok(head) = repo.head() else {
        return Ok(None);
    };
    Ok(head
        .peel_to_commit()
        .ok()
        .filter(|commit| commit.tree().is_ok())
        .map(|commit| commit.id()))
}

/// Open or create the repository of `work_dir`, sharing `history`'s objects.
///
/// Returns the git directory of the working repository.
fn prepare_work_repo(history: &Repository, work_dir: &Path) -> Result<PathBuf, SyncError> {
    fs::create_dir_all(work_dir)?;
    let work_dir = fs::canonicalize(work_dir)?;
    if let Some(tree) = history.workdir() {
        if fs::canonicalize(tree)? == work_dir {
            return Ok(history.path().to_path_buf());
        }
    }

    let repo = match Repository::open(&work_dir) {
        Ok(repo) => repo,
        Err(e) if e.code() == ErrorCode::NotFound => {
            log::info!("Initializing working repository in {}", work_dir.display());
            Repository::init(&work_dir)?
        }
        Err(e) => return Err(e.into()),
    };

    let objects = fs::canonicalize(history.path().join("objects"))?;
    let alternates = repo.path().join("objects").join("info").join("alternates");
    let wanted = format!("{}\n", objects.display());
    if fs::read_to_string(&alternates).ok().as_deref() != Some(wanted.as_str()) {
        if let Some(parent) = alternates.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&alternates, wanted)?;
    }
    Ok(repo.path().to_path_buf())
}

/// Drop an `index.lock` left behind by a crashed run.
fn remove_stale_index_lock(git_dir: &Path) -> Result<(), SyncError> {
    let lock = git_dir.join(INDEX_LOCK);
    match fs::remove_file(&lock) {
        Ok(()) => {
            log::warn!("Removed stale {}", lock.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
