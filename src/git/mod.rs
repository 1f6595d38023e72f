//! Git transport and working-tree backends.
//!
//! Two implementations share one interface:
//!
//! **libgit2 ([`LibGitBackend`])** for in-process fetches and checkouts.
//!
//! **CLI ([`CliGitBackend`], with hardening)** for transports libgit2 handles
//! poorly, most notably shallow fetches over the local `file://` transport.
//!
//! Revision lookup and repository opening always go through libgit2.

mod cli;
mod libgit;
mod resolve;

use std::path::Path;
use std::time::{Duration, Instant};

use git2::Oid;
use serde::{Deserialize, Serialize};

pub use cli::CliGitBackend;
pub use libgit::LibGitBackend;
pub use resolve::{resolve_commit, resolve_revision};

use crate::error::SyncError;
use crate::sink::{CredentialStore, ProgressSink};
use crate::types::{CancelToken, RepositoryAccessData};

/// Which backend performs network and working-tree operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Library,
    Cli,
}

/// How much history a fetch asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryDepth {
    /// Complete history.
    Full,
    /// History truncated to the given number of commits.
    Shallow(u32),
    /// Deepen an existing shallow directory to complete history.
    Unshallow,
}

/// Wall-clock bound for a whole operation, measured from its start.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    timeout: Duration,
}

impl Deadline {
    pub fn start(timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.timeout
    }

    /// Fail with `Timeout` once the deadline has passed.
    pub fn check(&self, operation: &str) -> Result<(), SyncError> {
        if self.expired() {
            return Err(self.error(operation));
        }
        Ok(())
    }

    pub fn error(&self, operation: &str) -> SyncError {
        SyncError::Timeout {
            operation: operation.to_string(),
            timeout: self.timeout,
        }
    }
}

/// The remote and the means to authenticate against it.
#[derive(Clone, Copy)]
pub struct RemoteAccess<'a> {
    pub access: &'a RepositoryAccessData,
    pub credentials: &'a dyn CredentialStore,
}

impl RemoteAccess<'_> {
    pub fn url(&self) -> &str {
        self.access.url.trim()
    }
}

/// A single-branch fetch into an existing git directory.
#[derive(Debug, Clone, Copy)]
pub struct FetchPlan<'a> {
    pub git_dir: &'a Path,
    pub branch: &'a str,
    pub depth: HistoryDepth,
    pub deadline: Deadline,
}

impl FetchPlan<'_> {
    /// Force-updating refspec mapping the remote branch onto the same local name.
    pub fn refspec(&self) -> String {
        format!("+refs/heads/{0}:refs/heads/{0}", self.branch)
    }
}

/// Transport and working-tree operations a backend has to provide.
pub trait GitBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Branch the remote's `HEAD` points at.
    fn remote_default_branch(
        &self,
        git_dir: &Path,
        remote: RemoteAccess<'_>,
        deadline: &Deadline,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<String, SyncError>;

    fn perform_fetch(
        &self,
        plan: &FetchPlan<'_>,
        remote: RemoteAccess<'_>,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), SyncError>;

    /// Move the working tree and index of `work_dir` from `baseline` to `target`.
    ///
    /// `baseline` is the commit the work repository records as checked out,
    /// and `HEAD` already names it; `None` means nothing is checked out and
    /// `HEAD` is unborn. Moving `HEAD` to `target` is left to the caller.
    fn perform_checkout(
        &self,
        work_dir: &Path,
        baseline: Option<Oid>,
        target: Oid,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), SyncError>;
}

/// Build the backend selected in configuration.
pub fn backend(kind: BackendKind, git_path: Option<&str>) -> Box<dyn GitBackend> {
    match kind {
        BackendKind::Library => Box::new(LibGitBackend::new()),
        BackendKind::Cli => Box::new(match git_path {
            Some(path) => CliGitBackend::with_git_path(path),
            None => CliGitBackend::new(),
        }),
    }
}

/// Whether a `git` executable can be run, for tests that need the CLI backend.
#[cfg(test)]
pub(crate) fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
