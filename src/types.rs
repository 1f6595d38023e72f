//! Shared types: repository access data, cache signatures, cancellation.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::sink::strip_url_credentials;

/// Default bound for a whole network operation (10 minutes).
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Everything needed to reach a remote repository.
///
/// `password`, `ssh_key` and `ssh_passphrase` hold *secret references* that
/// are resolved by a [`crate::sink::CredentialStore`] at the point of use.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RepositoryAccessData {
    pub url: String,
    pub branch: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_key: Option<String>,
    pub ssh_passphrase: Option<String>,
    pub use_shallow_clones: bool,
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,
    pub verbose_logs: bool,
}

impl Default for RepositoryAccessData {
    fn default() -> Self {
        Self {
            url: String::new(),
            branch: String::new(),
            username: None,
            password: None,
            ssh_key: None,
            ssh_passphrase: None,
            use_shallow_clones: false,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            verbose_logs: false,
        }
    }
}

impl RepositoryAccessData {
    /// Creates access data for an anonymous remote.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_shallow_clones(mut self, shallow: bool) -> Self {
        self.use_shallow_clones = shallow;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Branch name, or `None` when the remote's default branch should be used.
    pub fn branch(&self) -> Option<&str> {
        let branch = self.branch.trim();
        (!branch.is_empty()).then_some(branch)
    }
}

// Secrets stay out of debug output.
impl fmt::Debug for RepositoryAccessData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hidden = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("RepositoryAccessData")
            .field("url", &strip_url_credentials(&self.url))
            .field("branch", &self.branch)
            .field("username", &self.username)
            .field("password", &hidden(&self.password))
            .field("ssh_key", &hidden(&self.ssh_key))
            .field("ssh_passphrase", &hidden(&self.ssh_passphrase))
            .field("use_shallow_clones", &self.use_shallow_clones)
            .field("command_timeout", &self.command_timeout)
            .field("verbose_logs", &self.verbose_logs)
            .finish()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Canonical identity of a cached repository.
///
/// Only the credential-free URL, the username and (for shallow caches) the
/// branch take part: a shallow cache's history is bounded by its branch, so
/// different branches must not share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheSignature(String);

impl CacheSignature {
    pub fn from_access(access: &RepositoryAccessData) -> Self {
        let mut signature = format!(
            "url: {}\nusername: {}",
            strip_url_credentials(access.url.trim()),
            access.username.as_deref().unwrap_or("")
        );
        if access.use_shallow_clones {
            signature.push_str("\nshallow-branch: ");
            signature.push_str(access.branch().unwrap_or("HEAD"));
        }
        Self(signature)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheSignature {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Cooperative cancellation flag shared between a caller and blocking work.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Validate that a git ref (branch name or revision) does not contain dangerous patterns.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..` (path traversal)
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
pub fn validate_git_ref(value: &str, name: &str) -> Result<(), SyncError> {
    if value.is_empty() {
        return Err(SyncError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.contains("..") {
        return Err(SyncError::InvalidInput(format!(
            "{} cannot contain '..'",
            name
        )));
    }
    if value.starts_with('-') {
        return Err(SyncError::InvalidInput(format!(
            "{} cannot start with '-'",
            name
        )));
    }
    if value.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return Err(SyncError::InvalidInput(format!(
            "{} cannot contain null or control characters",
            name
        )));
    }
    Ok(())
}
