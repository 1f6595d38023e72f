//! Changeset extraction between two revisions.

use std::path::Path;

use git2::{Commit, Delta, DiffOptions, Repository, Sort};
use regex::Regex;
use serde::Serialize;

use crate::error::SyncError;
use crate::git::{resolve_commit, resolve_revision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
    TypeChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Author {
    pub name: String,
    pub email: String,
}

/// One commit in a changeset, or a synthetic placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEntry {
    pub id: String,
    pub author: Option<Author>,
    /// Commit time in seconds since the epoch.
    pub timestamp: i64,
    pub message: String,
    pub files: Vec<FileChange>,
    /// Two or more parents; no file list is computed for merges.
    pub merge: bool,
    /// Stands in for history that could not be walked.
    pub synthetic: bool,
}

/// Commits reachable from the target but not from the previous revision, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Changeset {
    pub entries: Vec<ChangeEntry>,
    /// Commits in range beyond the materialization limit.
    pub skipped: usize,
}

impl Changeset {
    /// Total number of commits in range.
    pub fn total(&self) -> usize {
        self.entries.len() + self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Apply `filter` to every file list. Commits are kept even when all their files are filtered out.
    pub fn filtered(&self, filter: &ChangeFilter) -> Changeset {
        let entries = self
            .entries
            .iter()
            .map(|entry| ChangeEntry {
                files: entry
                    .files
                    .iter()
                    .filter(|f| filter.matches(&f.path))
                    .cloned()
                    .collect(),
                ..entry.clone()
            })
            .collect();
        Changeset {
            entries,
            skipped: self.skipped,
        }
    }
}

/// Include/exclude path patterns.
#[derive(Debug, Clone, Default)]
pub struct ChangeFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl ChangeFilter {
    pub fn new(include: Option<&str>, exclude: Option<&str>) -> Result<Self, SyncError> {
        let compile = |pattern: Option<&str>, name: &str| {
            pattern
                .filter(|p| !p.is_empty())
                .map(|p| {
                    Regex::new(p)
                        .map_err(|e| SyncError::InvalidInput(format!("{} pattern: {}", name, e)))
                })
                .transpose()
        };
        Ok(Self {
            include: compile(include, "include")?,
            exclude: compile(exclude, "exclude")?,
        })
    }

    /// A path passes when it matches `include` (if set) and does not match `exclude`.
    pub fn matches(&self, path: &str) -> bool {
        self.include.as_ref().is_none_or(|re| re.is_match(path))
            && !self.exclude.as_ref().is_some_and(|re| re.is_match(path))
    }
}

/// Computes changesets from local history.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChangeSetExtractor;

impl ChangeSetExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Commits in `previous..target`, at most `limit` of them materialized.
    ///
    /// Without `previous` the whole history of `target` is walked. When
    /// `previous` is unknown or not an ancestor of `target`, the result is a
    /// single synthetic entry instead of a walk.
    pub fn extract(
        &self,
        dir: &Path,
        previous: Option<&str>,
        target: &str,
        limit: usize,
    ) -> Result<Changeset, SyncError> {
        let repo = Repository::open(dir)?;
        let target_commit = resolve_commit(&repo, target)?;
        let target_id = target_commit.id();

        let hidden = match previous {
            None => None,
            Some(previous) => match resolve_revision(&repo, previous) {
                Some(id) if id == target_id => return Ok(Changeset::default()),
                Some(id) if repo.graph_descendant_of(target_id, id).unwrap_or(false) => Some(id),
                _ => {
                    log::info!(
                        "Cannot determine changes between {} and {}: unrelated history",
                        previous,
                        target
                    );
                    return Ok(unrelated(previous, &target_commit));
                }
            },
        };

        let mut walk = repo.revwalk()?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
        walk.push(target_id)?;
        if let Some(hidden) = hidden {
            walk.hide(hidden)?;
        }

        let mut changeset = Changeset::default();
        for id in walk {
            let id = id?;
            if changeset.entries.len() >= limit {
                changeset.skipped += 1;
                continue;
            }
            let commit = repo.find_commit(id)?;
            changeset.entries.push(entry(&repo, &commit)?);
        }

        log::debug!(
            "Changeset for {}: {} commits, {} skipped",
            target,
            changeset.entries.len(),
            changeset.skipped
        );
        Ok(changeset)
    }
}

fn unrelated(previous: &str, target: &Commit<'_>) -> Changeset {
    Changeset {
        entries: vec![ChangeEntry {
            id: target.id().to_string(),
            author: None,
            timestamp: target.time().seconds(),
            message: format!(
                "changes cannot be determined between {} and {}",
                previous,
                target.id()
            ),
            files: Vec::new(),
            merge: false,
            synthetic: true,
        }],
        skipped: 0,
    }
}

fn entry(repo: &Repository, commit: &Commit<'_>) -> Result<ChangeEntry, SyncError> {
    let merge = commit.parent_count() > 1;
    let files = if merge {
        Vec::new()
    } else {
        file_changes(repo, commit)?
    };
    let author = commit.author();
    Ok(ChangeEntry {
        id: commit.id().to_string(),
        author: Some(Author {
            name: author.name().unwrap_or_default().to_string(),
            email: author.email().unwrap_or_default().to_string(),
        }),
        timestamp: commit.time().seconds(),
        message: commit.message().unwrap_or_default().trim_end().to_string(),
        files,
        merge,
        synthetic: false,
    })
}

fn file_changes(repo: &Repository, commit: &Commit<'_>) -> Result<Vec<FileChange>, SyncError> {
    let tree = commit.tree()?;
    // Past a shallow boundary the parent is not available; treat it like a root.
    let parent_tree = match commit.parent_ids().next() {
        Some(parent) => repo.find_commit(parent).and_then(|p| p.tree()).ok(),
        None => None,
    };

    let mut opts = DiffOptions::new();
    opts.include_typechange(true);
    let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))?;

    let mut files = Vec::new();
    for delta in diff.deltas() {
        let (kind, file) = match delta.status() {
            Delta::Added | Delta::Copied => (ChangeKind::Added, delta.new_file()),
            Delta::Modified => (ChangeKind::Modified, delta.new_file()),
            Delta::Deleted => (ChangeKind::Deleted, delta.old_file()),
            Delta::Renamed => (ChangeKind::Renamed, delta.new_file()),
            Delta::Typechange => (ChangeKind::TypeChanged, delta.new_file()),
            _ => continue,
        };
        if delta.status() != Delta::Typechange && delta.old_file().id() == delta.new_file().id() {
            continue;
        }
        if let Some(path) = file.path() {
            files.push(FileChange {
                path: path.to_string_lossy().into_owned(),
                kind,
            });
        }
    }
    Ok(files)
}
