//! Error taxonomy shared by every component.
//!
//! Errors are structured: each variant maps to a stable [`ErrorCode`] plus a
//! list of arguments, so presentation layers can localize them through an
//! [`ErrorText`] implementation instead of parsing display strings.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Captured result of a failed `git` child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    /// The command line, with credentials redacted.
    pub command: String,
    /// Exit status, or `None` when the process was killed by a signal.
    pub exit_status: Option<i32>,
    /// Combined stderr/stdout text, redacted.
    pub captured_output: String,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_status {
            Some(code) => write!(f, "`{}` exited with status {}", self.command, code),
            None => write!(f, "`{}` was terminated by a signal", self.command),
        }
    }
}

/// Errors returned by cache, fetch, checkout and changeset operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The transport could not reach or talk to the remote.
    #[error("network error: {message}")]
    Network {
        message: String,
        failure: Option<CommandFailure>,
    },
    /// The remote rejected the supplied credentials.
    #[error("authentication failed: {message}")]
    Auth {
        message: String,
        failure: Option<CommandFailure>,
    },
    /// A network operation ran past its deadline and was aborted.
    #[error("{operation} timed out after {}s", .timeout.as_secs())]
    Timeout {
        operation: String,
        timeout: Duration,
    },
    /// The calling thread asked to stop.
    #[error("{operation} was interrupted")]
    Interrupted { operation: String },
    /// A ref or object cannot be resolved, including shallow boundary misses.
    #[error("revision '{revision}' cannot be resolved: {reason}")]
    MissingRevision {
        revision: String,
        reason: String,
        /// The revision resolved, but objects it needs are absent from the local store.
        local_store: bool,
    },
    /// The working tree has local changes the checkout would overwrite.
    #[error("checkout conflict at {}: {reason}", .path.display())]
    Conflict { path: PathBuf, reason: String },
    /// Lock acquisition failed or was interrupted.
    #[error("failed to lock {}: {reason}", .path.display())]
    Lock { path: PathBuf, reason: String },
    /// An underlying IO operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// libgit2 reported an error that fits no other category.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// The git executable failed in a way that fits no other category.
    #[error("git command failed: {0}")]
    Command(CommandFailure),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A configuration file could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Stable identifiers for [`SyncError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Network,
    Auth,
    Timeout,
    Interrupted,
    MissingRevision,
    Conflict,
    Lock,
    Io,
    Git,
    Command,
    InvalidInput,
    Config,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "repository.network",
            Self::Auth => "repository.auth",
            Self::Timeout => "repository.timeout",
            Self::Interrupted => "repository.interrupted",
            Self::MissingRevision => "repository.missing-revision",
            Self::Conflict => "repository.checkout-conflict",
            Self::Lock => "repository.lock",
            Self::Io => "repository.io",
            Self::Git => "repository.git",
            Self::Command => "repository.command",
            Self::InvalidInput => "repository.invalid-input",
            Self::Config => "repository.config",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Network { .. } => ErrorCode::Network,
            Self::Auth { .. } => ErrorCode::Auth,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Interrupted { .. } => ErrorCode::Interrupted,
            Self::MissingRevision { .. } => ErrorCode::MissingRevision,
            Self::Conflict { .. } => ErrorCode::Conflict,
            Self::Lock { .. } => ErrorCode::Lock,
            Self::Io(_) => ErrorCode::Io,
            Self::Git(_) => ErrorCode::Git,
            Self::Command(_) => ErrorCode::Command,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::Config(_) => ErrorCode::Config,
        }
    }

    /// Positional arguments for the message registered under [`Self::code`].
    pub fn arguments(&self) -> Vec<String> {
        match self {
            Self::Network { message, .. } | Self::Auth { message, .. } => vec![message.clone()],
            Self::Timeout { operation, timeout } => {
                vec![operation.clone(), timeout.as_secs().to_string()]
            }
            Self::Interrupted { operation } => vec![operation.clone()],
            Self::MissingRevision {
                revision, reason, ..
            } => vec![revision.clone(), reason.clone()],
            Self::Conflict { path, reason } | Self::Lock { path, reason } => {
                vec![path.display().to_string(), reason.clone()]
            }
            Self::Io(e) => vec![e.to_string()],
            Self::Git(e) => vec![e.message().to_string()],
            Self::Command(failure) => vec![
                failure.command.clone(),
                failure
                    .exit_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                failure.captured_output.clone(),
            ],
            Self::InvalidInput(msg) | Self::Config(msg) => vec![msg.clone()],
        }
    }

    /// The captured child-process output, when the error came from the git CLI.
    pub fn command_failure(&self) -> Option<&CommandFailure> {
        match self {
            Self::Network { failure, .. } | Self::Auth { failure, .. } => failure.as_ref(),
            Self::Command(failure) => Some(failure),
            _ => None,
        }
    }

    /// Whether the failure suggests a damaged local cache rather than a remote problem.
    ///
    /// Revisions the remote does not have are not corruption; objects that a
    /// resolved revision points at but the store lacks are.
    pub fn suggests_local_corruption(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::MissingRevision {
                    local_store: true,
                    ..
                }
        )
    }

    pub(crate) fn missing(revision: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MissingRevision {
            revision: revision.into(),
            reason: reason.into(),
            local_store: false,
        }
    }

    /// `revision` resolved, but the local object store cannot supply it.
    pub(crate) fn missing_object(revision: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MissingRevision {
            revision: revision.into(),
            reason: reason.into(),
            local_store: true,
        }
    }
}

/// Localized message lookup for error codes.
pub trait ErrorText {
    fn lookup(&self, code: ErrorCode, args: &[String]) -> String;
}

/// English messages used by the command line tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorText;

impl ErrorText for DefaultErrorText {
    fn lookup(&self, code: ErrorCode, args: &[String]) -> String {
        let arg = |i: usize| args.get(i).map(String::as_str).unwrap_or("?");
        match code {
            ErrorCode::Network => format!("Could not reach the repository: {}", arg(0)),
            ErrorCode::Auth => format!("Authentication failed: {}", arg(0)),
            ErrorCode::Timeout => format!("{} did not finish within {}s", arg(0), arg(1)),
            ErrorCode::Interrupted => format!("{} was interrupted", arg(0)),
            ErrorCode::MissingRevision => {
                format!("Revision '{}' is not available: {}", arg(0), arg(1))
            }
            ErrorCode::Conflict => format!(
                "Checkout would overwrite local changes in {}: {}",
                arg(0),
                arg(1)
            ),
            ErrorCode::Lock => format!("Could not lock {}: {}", arg(0), arg(1)),
            ErrorCode::Io => format!("Filesystem error: {}", arg(0)),
            ErrorCode::Git => format!("Git error: {}", arg(0)),
            ErrorCode::Command => format!("{} failed ({}):\n{}", arg(0), arg(1), arg(2)),
            ErrorCode::InvalidInput => format!("Invalid input: {}", arg(0)),
            ErrorCode::Config => format!("Invalid configuration: {}", arg(0)),
        }
    }
}
