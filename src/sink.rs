//! Collaborator interfaces: progress reporting and credential resolution.
//!
//! Anything written to a [`ProgressSink`] may end up in build logs, so URLs are
//! redacted before they are handed over and [`RedactingSink`] scrubs whatever
//! slips through (for example the git CLI echoing a remote URL).

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::error::SyncError;

const REDACTED: &str = "********";

static URL_PASSWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<prefix>[A-Za-z][A-Za-z0-9+.\-]*://[^/@:\s]*):[^/@\s]*@")
        .expect("static regex is valid")
});

/// Receives human-readable progress for long-running operations.
pub trait ProgressSink: Send + Sync {
    /// Announce a task and, when known, the number of units it will process.
    fn report(&self, task: &str, units_total: Option<u64>);

    /// Append a single progress line.
    fn log(&self, line: &str);
}

/// Sends progress to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn report(&self, task: &str, units_total: Option<u64>) {
        match units_total {
            Some(total) => log::info!("{} ({} units)", task, total),
            None => log::info!("{}", task),
        }
    }

    fn log(&self, line: &str) {
        log::info!("{}", line);
    }
}

/// Wraps another sink and strips URL passwords from every line.
pub struct RedactingSink<'a> {
    inner: &'a dyn ProgressSink,
}

impl<'a> RedactingSink<'a> {
    pub fn new(inner: &'a dyn ProgressSink) -> Self {
        Self { inner }
    }
}

impl ProgressSink for RedactingSink<'_> {
    fn report(&self, task: &str, units_total: Option<u64>) {
        self.inner.report(&redact_text(task), units_total);
    }

    fn log(&self, line: &str) {
        self.inner.log(&redact_text(line));
    }
}

/// Replace the password of any `scheme://user:password@` URL in `text`.
pub fn redact_text(text: &str) -> String {
    URL_PASSWORD
        .replace_all(text, format!("${{prefix}}:{}@", REDACTED).as_str())
        .into_owned()
}

/// Return `url` with its password (if any) masked, suitable for logging.
pub fn redact_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some(REDACTED)).is_ok() {
                parsed.to_string()
            } else {
                redact_text(url)
            }
        }
        Ok(_) => url.to_string(),
        // scp-like and local paths carry no password field.
        Err(_) => redact_text(url),
    }
}

/// Return `url` without its password, keeping the username.
pub fn strip_url_credentials(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(None).is_ok() {
                parsed.to_string()
            } else {
                url.to_string()
            }
        }
        _ => url.to_string(),
    }
}

/// Resolves stored secret references to plaintext at the point of use.
///
/// Implementations must not cache the plaintext beyond the call.
pub trait CredentialStore: Send + Sync {
    fn decrypt(&self, secret: &str) -> Result<String, SyncError>;
}

/// Resolves `env:NAME` and `file:PATH` references; anything else is taken literally.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCredentialStore;

impl CredentialStore for DefaultCredentialStore {
    fn decrypt(&self, secret: &str) -> Result<String, SyncError> {
        if let Some(name) = secret.strip_prefix("env:") {
            return std::env::var(name).map_err(|_| SyncError::Auth {
                message: format!("credential variable {} is not set", name),
                failure: None,
            });
        }
        if let Some(path) = secret.strip_prefix("file:") {
            let contents = std::fs::read_to_string(Path::new(path)).map_err(|e| SyncError::Auth {
                message: format!("cannot read credential file {}: {}", path, e),
                failure: None,
            })?;
            // Single-line files hold passwords; keep key files byte-exact.
            let trimmed = contents.trim_end_matches(['\r', '\n']);
            if !trimmed.contains('\n') {
                return Ok(trimmed.to_string());
            }
            return Ok(contents);
        }
        Ok(secret.to_string())
    }
}
