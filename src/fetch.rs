//! Fetch engine
//!
//! Keeps a git directory in sync with one branch of a remote while tracking
//! how complete its history is. A directory moves through three states:
//!
//! ```text
//! Absent ──shallow──▶ Shallow ──unshallow──▶ Full
//!    └──────────full──────────────────────────▲
//! ```
//!
//! Full directories never shrink again: other consumers of the same cache
//! slot may rely on the history. Shallow directories only deepen through an
//! explicit [`FetchEngine::unshallow`].

use std::fs;
use std::path::Path;
use std::sync::Arc;

use git2::{ErrorCode, Repository};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::git::{Deadline, FetchPlan, GitBackend, HistoryDepth, RemoteAccess};
use crate::sink::{CredentialStore, ProgressSink, RedactingSink, redact_url};
use crate::types::{CancelToken, RepositoryAccessData, validate_git_ref};

/// History completeness of a git directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryState {
    /// No refs at all (fresh or emptied directory).
    Absent,
    /// History is cut off at one or more shallow boundaries.
    Shallow,
    /// Complete history.
    Full,
}

/// What a shallow directory does when asked for a branch it never fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShallowBranchSwitch {
    /// Fetch the new branch at depth 1; its boundary coexists with the others.
    #[default]
    FreshShallowFetch,
    /// Refuse with `MissingRevision` until the directory is unshallowed.
    Reject,
}

/// Result of a fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchOutcome {
    /// Branch that was fetched (the remote default when none was requested).
    pub branch: String,
    pub before: HistoryState,
    pub after: HistoryState,
    /// Commit the local branch ref now points at.
    pub head: String,
}

/// Synchronizes git directories against their remotes.
pub struct FetchEngine {
    backend: Arc<dyn GitBackend>,
    credentials: Arc<dyn CredentialStore>,
    branch_switch: ShallowBranchSwitch,
}

impl FetchEngine {
    pub fn new(backend: Arc<dyn GitBackend>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            backend,
            credentials,
            branch_switch: ShallowBranchSwitch::default(),
        }
    }

    pub fn with_branch_switch(mut self, policy: ShallowBranchSwitch) -> Self {
        self.branch_switch = policy;
        self
    }

    /// Fetch `access.branch` (or the remote default) into `target`.
    ///
    /// `shallow` only matters for a directory without history; see the module
    /// docs for how existing directories are treated.
    pub fn fetch(
        &self,
        target: &Path,
        access: &RepositoryAccessData,
        shallow: bool,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<FetchOutcome, SyncError> {
        self.run(target, access, sink, cancel, |state, branch, known| {
            self.choose_depth(state, shallow, branch, known)
        })
    }

    /// Deepen a shallow directory to full history.
    ///
    /// Directories that are already complete get an ordinary full fetch.
    pub fn unshallow(
        &self,
        target: &Path,
        access: &RepositoryAccessData,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<FetchOutcome, SyncError> {
        self.run(target, access, sink, cancel, |state, _, _| {
            Ok(match state {
                HistoryState::Shallow => HistoryDepth::Unshallow,
                HistoryState::Absent | HistoryState::Full => HistoryDepth::Full,
            })
        })
    }

    fn run(
        &self,
        target: &Path,
        access: &RepositoryAccessData,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
        depth: impl FnOnce(HistoryState, &str, bool) -> Result<HistoryDepth, SyncError>,
    ) -> Result<FetchOutcome, SyncError> {
        let deadline = Deadline::start(access.command_timeout);
        validate_url(&access.url)?;
        if let Some(branch) = access.branch() {
            validate_git_ref(branch, "branch")?;
        }
        deadline.check("fetch")?;

        let sink = RedactingSink::new(sink);
        let remote = RemoteAccess {
            access,
            credentials: self.credentials.as_ref(),
        };

        let repo = open_or_init(target)?;
        let before = history_state(&repo)?;

        let branch = match access.branch() {
            Some(branch) => branch.to_string(),
            None => {
                let branch =
                    self.backend
                        .remote_default_branch(target, remote, &deadline, &sink, cancel)?;
                validate_git_ref(&branch, "default branch")?;
                log::info!(
                    "Default branch of {} is {}",
                    redact_url(remote.url()),
                    branch
                );
                branch
            }
        };
        let local_ref = format!("refs/heads/{}", branch);
        let known = repo.find_reference(&local_ref).is_ok();
        drop(repo);

        let depth = depth(before, &branch, known)?;
        sink.report(
            &format!(
                "Fetching {} from {} ({})",
                branch,
                redact_url(remote.url()),
                describe(depth)
            ),
            None,
        );

        let plan = FetchPlan {
            git_dir: target,
            branch: &branch,
            depth,
            deadline,
        };
        self.backend.perform_fetch(&plan, remote, &sink, cancel)?;

        // Re-open because git2 caches refs.
        let repo = Repository::open(target)?;
        let head = repo
            .find_reference(&local_ref)
            .and_then(|r| r.peel_to_commit())
            .map_err(|_| SyncError::missing(&branch, "the remote has no such branch"))?
            .id()
            .to_string();
        let after = history_state(&repo)?;

        log::info!(
            "Fetched {} at {} into {} ({:?} -> {:?})",
            branch,
            head,
            target.display(),
            before,
            after
        );
        Ok(FetchOutcome {
            branch,
            before,
            after,
            head,
        })
    }

    fn choose_depth(
        &self,
        state: HistoryState,
        shallow: bool,
        branch: &str,
        known: bool,
    ) -> Result<HistoryDepth, SyncError> {
        match state {
            HistoryState::Absent if shallow => Ok(HistoryDepth::Shallow(1)),
            HistoryState::Absent | HistoryState::Full => Ok(HistoryDepth::Full),
            HistoryState::Shallow => {
                if !shallow {
                    log::info!("Directory is shallow; run unshallow to fetch full history");
                }
                if known {
                    return Ok(HistoryDepth::Shallow(1));
                }
                match self.branch_switch {
                    ShallowBranchSwitch::FreshShallowFetch => {
                        log::info!(
                            "Branch {} is new to this shallow directory, fetching it at depth 1",
                            branch
                        );
                        Ok(HistoryDepth::Shallow(1))
                    }
                    ShallowBranchSwitch::Reject => Err(SyncError::missing(
                        branch,
                        "the branch was never fetched into this shallow directory",
                    )),
                }
            }
        }
    }
}

fn describe(depth: HistoryDepth) -> String {
    match depth {
        HistoryDepth::Full => "full history".to_string(),
        HistoryDepth::Shallow(n) => format!("depth {}", n),
        HistoryDepth::Unshallow => "unshallow".to_string(),
    }
}

fn validate_url(url: &str) -> Result<(), SyncError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(SyncError::InvalidInput("url cannot be empty".to_string()));
    }
    if url.starts_with('-') {
        return Err(SyncError::InvalidInput(
            "url cannot start with '-'".to_string(),
        ));
    }
    Ok(())
}

/// Open the repository at `dir`, initializing a non-bare one when missing.
pub(crate) fn open_or_init(dir: &Path) -> Result<Repository, SyncError> {
    match Repository::open(dir) {
        Ok(repo) => Ok(repo),
        Err(e) if e.code() == ErrorCode::NotFound => {
            fs::create_dir_all(dir)?;
            log::info!("Initializing git directory {}", dir.display());
            Ok(Repository::init(dir)?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Classify how much history `repo` holds.
pub fn history_state(repo: &Repository) -> Result<HistoryState, SyncError> {
    if repo.references()?.next().is_none() {
        return Ok(HistoryState::Absent);
    }
    if repo.is_shallow() {
        return Ok(HistoryState::Shallow);
    }
    Ok(HistoryState::Full)
}
