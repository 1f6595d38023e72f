//! Checks the libgit2 backend runs before it touches a working tree.
//!
//! libgit2's safe checkout already refuses to overwrite changes to paths the
//! move touches. Two cases are left to us: a local edit to a path both
//! revisions agree on, which safe mode would keep, and a blob missing from
//! the object store, which would fail the checkout after it started writing.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use git2::{Delta, DiffOptions, ObjectType, Repository, Tree, TreeWalkMode, TreeWalkResult};

use crate::error::SyncError;

/// Verify that the working tree of `repo` can move from `baseline` (`None` = empty) to `target`.
///
/// Returns the number of paths the move changes.
pub(crate) fn verify_checkout(
    repo: &Repository,
    baseline: Option<&Tree<'_>>,
    target: &Tree<'_>,
) -> Result<usize, SyncError> {
    verify_objects(repo, target)?;
    if let Some(baseline) = baseline {
        verify_clean(repo, baseline, target)?;
    }
    let diff = repo.diff_tree_to_tree(baseline, Some(target), None)?;
    Ok(diff.deltas().len())
}

/// Every blob of `target` must be readable before the first file is written.
fn verify_objects(repo: &Repository, target: &Tree<'_>) -> Result<(), SyncError> {
    let odb = repo.odb()?;
    let mut missing = None;
    target.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(ObjectType::Blob) && !odb.exists(entry.id()) {
            missing = Some(format!("{}{}", root, entry.name().unwrap_or("?")));
            return TreeWalkResult::Abort;
        }
        TreeWalkResult::Ok
    })
    .or_else(|e| if missing.is_some() { Ok(()) } else { Err(e) })?;

    match missing {
        Some(path) => Err(SyncError::missing_object(
            target.id().to_string(),
            format!("object for {} is not in the object store", path),
        )),
        None => Ok(()),
    }
}

/// A path edited since `baseline` may only stay if it already matches `target`.
///
/// Both comparisons run through the repository's filters, so line ending
/// conversion does not show up as an edit.
fn verify_clean(repo: &Repository, baseline: &Tree<'_>, target: &Tree<'_>) -> Result<(), SyncError> {
    let mut opts = DiffOptions::new();
    opts.include_typechange(true).ignore_submodules(true);
    let edited = edited_paths(
        &repo.diff_tree_to_workdir_with_index(Some(baseline), Some(&mut opts))?,
    );
    if edited.is_empty() {
        return Ok(());
    }

    let mut opts = DiffOptions::new();
    opts.include_typechange(true)
        .ignore_submodules(true)
        .disable_pathspec_match(true);
    for path in &edited {
        opts.pathspec(path.as_path());
    }
    let differs = edited_paths(&repo.diff_tree_to_workdir(Some(target), Some(&mut opts))?);

    for path in &edited {
        if target.get_path(path).is_err() || differs.contains(path) {
            return Err(SyncError::Conflict {
                path: path.clone(),
                reason: "local changes would be overwritten".to_string(),
            });
        }
    }
    Ok(())
}

/// Paths whose working copy exists but differs from the old side of `diff`.
fn edited_paths(diff: &git2::Diff<'_>) -> BTreeSet<PathBuf> {
    diff.deltas()
        .filter(|d| matches!(d.status(), Delta::Modified | Delta::Typechange))
        .filter_map(|d| d.old_file().path().map(Path::to_path_buf))
        .collect()
}
