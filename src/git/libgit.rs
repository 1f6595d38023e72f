//! In-process backend built on libgit2.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use git2::build::CheckoutBuilder;
use git2::{
    AutotagOption, CheckoutNotificationType, Cred, CredentialType, Direction, ErrorClass,
    ErrorCode, FetchOptions, Oid, RemoteCallbacks, Repository,
};

use super::{Deadline, FetchPlan, GitBackend, HistoryDepth, RemoteAccess};
use crate::checkout::verify::verify_checkout;
use crate::error::SyncError;
use crate::sink::{ProgressSink, redact_text, redact_url};
use crate::types::CancelToken;

/// libgit2's marker depth for "fetch everything behind the shallow boundary".
const UNSHALLOW_DEPTH: i32 = i32::MAX;

/// Serializes writes to libgit2's process-wide socket timeouts.
static SOCKET_TIMEOUTS: Mutex<()> = Mutex::new(());

/// Bound libgit2's socket connect and read waits by what is left of `deadline`.
///
/// Transfer callbacks only run when data arrives, so a server that accepts
/// the connection and then stays silent is cut off here. The values are
/// global: each new socket copies whatever was set last.
fn bound_socket_waits(url: &str, deadline: &Deadline) -> Result<(), SyncError> {
    if !is_network_url(url) {
        return Ok(());
    }
    let millis = deadline.remaining().as_millis().saturating_add(1);
    let millis = i32::try_from(millis).unwrap_or(i32::MAX);
    let _serial = SOCKET_TIMEOUTS.lock().unwrap_or_else(PoisonError::into_inner);
    // SAFETY: both options are plain integers read when a socket is created;
    // the mutex keeps concurrent callers from writing them at the same time.
    unsafe {
        git2::opts::set_server_connect_timeout_in_milliseconds(millis)?;
        git2::opts::set_server_timeout_in_milliseconds(millis)?;
    }
    Ok(())
}

/// Whether libgit2 reaches `url` over a socket rather than the filesystem.
fn is_network_url(url: &str) -> bool {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.scheme() != "file",
        // scp-like `user@host:path`
        Err(_) => url
            .split_once(':')
            .is_some_and(|(host, _)| !host.is_empty() && !host.contains('/')),
    }
}

/// Backend running every operation through libgit2.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibGitBackend;

impl LibGitBackend {
    pub fn new() -> Self {
        Self
    }
}

/// Why a transport callback asked libgit2 to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    Cancelled,
    Deadline,
}

/// State shared between the transport callbacks and the caller.
struct Transport<'a> {
    remote: RemoteAccess<'a>,
    deadline: &'a Deadline,
    cancel: &'a CancelToken,
    sink: &'a dyn ProgressSink,
    aborted: Cell<Option<Abort>>,
    credential_error: RefCell<Option<SyncError>>,
}

impl<'a> Transport<'a> {
    fn new(
        remote: RemoteAccess<'a>,
        deadline: &'a Deadline,
        cancel: &'a CancelToken,
        sink: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            remote,
            deadline,
            cancel,
            sink,
            aborted: Cell::new(None),
            credential_error: RefCell::new(None),
        }
    }

    /// Returns `false` once the transfer must be torn down.
    fn keep_going(&self) -> bool {
        if self.cancel.is_cancelled() {
            self.aborted.set(Some(Abort::Cancelled));
            return false;
        }
        if self.deadline.expired() {
            self.aborted.set(Some(Abort::Deadline));
            return false;
        }
        true
    }

    fn callbacks(&'a self) -> RemoteCallbacks<'a> {
        let mut callbacks = RemoteCallbacks::new();
        let attempts = Cell::new(0u32);
        let verbose = self.remote.access.verbose_logs;
        let reported = Cell::new(false);
        let last_percent = Cell::new(None::<u64>);

        callbacks.credentials(move |url, username_from_url, allowed| {
            attempts.set(attempts.get() + 1);
            if attempts.get() > 1 {
                // libgit2 keeps asking after a rejection; one attempt is all we have.
                return Err(git2::Error::new(
                    ErrorCode::Auth,
                    ErrorClass::Net,
                    "credentials were rejected",
                ));
            }
            self.credentials(url, username_from_url, allowed)
        });

        callbacks.transfer_progress(move |progress| {
            if !self.keep_going() {
                return false;
            }
            let total = progress.total_objects() as u64;
            if total > 0 && !reported.get() {
                reported.set(true);
                self.sink.report("Receiving objects", Some(total));
            }
            if verbose && total > 0 {
                let percent = progress.received_objects() as u64 * 100 / total;
                if last_percent.get().is_none_or(|last| percent >= last + 10) {
                    last_percent.set(Some(percent));
                    self.sink.log(&format!(
                        "Received {}/{} objects ({}%)",
                        progress.received_objects(),
                        total,
                        percent
                    ));
                }
            }
            true
        });

        callbacks.sideband_progress(move |data| {
            if !self.keep_going() {
                return false;
            }
            if verbose {
                let text = String::from_utf8_lossy(data);
                for line in text.split(['\r', '\n']).filter(|l| !l.trim().is_empty()) {
                    self.sink.log(&redact_text(line.trim_end()));
                }
            }
            true
        });

        callbacks.certificate_check(move |_cert, _host| {
            if self.keep_going() {
                Ok(git2::CertificateCheckStatus::CertificatePassthrough)
            } else {
                Err(git2::Error::from_str("transfer aborted"))
            }
        });

        callbacks
    }

    fn credentials(
        &self,
        url: &str,
        username_from_url: Option<&str>,
        allowed: CredentialType,
    ) -> Result<Cred, git2::Error> {
        let access = self.remote.access;
        let username = access
            .username
            .as_deref()
            .filter(|u| !u.is_empty())
            .or(username_from_url);

        let result = if allowed.contains(CredentialType::SSH_KEY) && access.ssh_key.is_some() {
            self.ssh_key(username.unwrap_or("git"))
        } else if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) && access.password.is_some() {
            self.user_pass(username.unwrap_or(""))
        } else if allowed.contains(CredentialType::USERNAME) {
            Cred::username(username.unwrap_or("git")).map_err(SyncError::from)
        } else {
            Err(SyncError::Auth {
                message: format!("no usable credentials for {}", redact_url(url)),
                failure: None,
            })
        };

        result.map_err(|e| {
            let message = e.to_string();
            *self.credential_error.borrow_mut() = Some(e);
            git2::Error::new(ErrorCode::Auth, ErrorClass::Callback, message)
        })
    }

    fn ssh_key(&self, username: &str) -> Result<Cred, SyncError> {
        let access = self.remote.access;
        let store = self.remote.credentials;
        let key = match access.ssh_key.as_deref() {
            Some(secret) => store.decrypt(secret)?,
            None => String::new(),
        };
        let passphrase = match access.ssh_passphrase.as_deref() {
            Some(secret) => Some(store.decrypt(secret)?),
            None => None,
        };
        Ok(Cred::ssh_key_from_memory(
            username,
            None,
            &key,
            passphrase.as_deref().filter(|p| !p.is_empty()),
        )?)
    }

    fn user_pass(&self, username: &str) -> Result<Cred, SyncError> {
        let password = match self.remote.access.password.as_deref() {
            Some(secret) => self.remote.credentials.decrypt(secret)?,
            None => String::new(),
        };
        Ok(Cred::userpass_plaintext(username, &password)?)
    }

    /// Map a libgit2 failure onto the error taxonomy.
    fn classify(&self, error: git2::Error, operation: &str) -> SyncError {
        if let Some(e) = self.credential_error.borrow_mut().take() {
            return e;
        }
        match self.aborted.get() {
            Some(Abort::Cancelled) => {
                return SyncError::Interrupted {
                    operation: operation.to_string(),
                };
            }
            Some(Abort::Deadline) => return self.deadline.error(operation),
            None => {}
        }
        if self.cancel.is_cancelled() {
            return SyncError::Interrupted {
                operation: operation.to_string(),
            };
        }
        if self.deadline.expired() || error.code() == ErrorCode::Timeout {
            return self.deadline.error(operation);
        }
        classify_git_error(error)
    }
}

fn classify_git_error(error: git2::Error) -> SyncError {
    let message = redact_text(error.message());
    if error.code() == ErrorCode::Auth {
        return SyncError::Auth {
            message,
            failure: None,
        };
    }
    match error.class() {
        ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssh | ErrorClass::Ssl => {
            SyncError::Network {
                message,
                failure: None,
            }
        }
        _ => SyncError::Git(git2::Error::new(error.code(), error.class(), message)),
    }
}

impl GitBackend for LibGitBackend {
    fn name(&self) -> &'static str {
        "libgit2"
    }

    fn remote_default_branch(
        &self,
        git_dir: &Path,
        remote: RemoteAccess<'_>,
        deadline: &Deadline,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<String, SyncError> {
        deadline.check("remote HEAD lookup")?;
        let repo = Repository::open(git_dir)?;
        let transport = Transport::new(remote, deadline, cancel, sink);
        let mut git_remote = repo.remote_anonymous(remote.url())?;
        bound_socket_waits(remote.url(), deadline)?;

        let connection = git_remote
            .connect_auth(Direction::Fetch, Some(transport.callbacks()), None)
            .map_err(|e| transport.classify(e, "remote HEAD lookup"))?;

        if let Ok(buf) = connection.default_branch() {
            if let Some(branch) = buf.as_str().and_then(|b| b.strip_prefix("refs/heads/")) {
                return Ok(branch.to_string());
            }
        }

        // Servers without symref support: pick the branch sharing HEAD's commit.
        let heads = connection.list()?;
        let head = heads.iter().find(|h| h.name() == "HEAD").map(|h| h.oid());
        head.and_then(|oid| {
            heads
                .iter()
                .filter(|h| h.oid() == oid)
                .find_map(|h| h.name().strip_prefix("refs/heads/"))
                .map(str::to_string)
        })
        .ok_or_else(|| SyncError::missing("HEAD", "the remote does not advertise a default branch"))
    }

    fn perform_fetch(
        &self,
        plan: &FetchPlan<'_>,
        remote: RemoteAccess<'_>,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), SyncError> {
        plan.deadline.check("fetch")?;
        let repo = Repository::open(plan.git_dir)?;
        let transport = Transport::new(remote, &plan.deadline, cancel, sink);
        let mut git_remote = repo.remote_anonymous(remote.url())?;

        let mut options = FetchOptions::new();
        options.remote_callbacks(transport.callbacks());
        options.download_tags(AutotagOption::None);
        options.update_fetchhead(false);
        match plan.depth {
            HistoryDepth::Full => {}
            HistoryDepth::Shallow(depth) => {
                options.depth(i32::try_from(depth).unwrap_or(i32::MAX));
            }
            HistoryDepth::Unshallow => {
                options.depth(UNSHALLOW_DEPTH);
            }
        }

        let refspec = plan.refspec();
        bound_socket_waits(remote.url(), &plan.deadline)?;
        git_remote
            .fetch(&[refspec.as_str()], Some(&mut options), None)
            .map_err(|e| transport.classify(e, "fetch"))?;

        let stats = git_remote.stats();
        if stats.received_objects() > 0 {
            sink.log(&format!(
                "Fetched {} objects ({} bytes)",
                stats.received_objects(),
                stats.received_bytes()
            ));
        }
        Ok(())
    }

    fn perform_checkout(
        &self,
        work_dir: &Path,
        baseline: Option<Oid>,
        target: Oid,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(), SyncError> {
        let repo = Repository::open(work_dir)?;
        let target_commit = repo
            .find_commit(target)
            .map_err(|e| SyncError::missing_object(target.to_string(), e.message().to_string()))?;
        let target_tree = target_commit
            .tree()
            .map_err(|e| SyncError::missing_object(target.to_string(), e.message().to_string()))?;
        let baseline_tree = baseline
            .map(|oid| repo.find_commit(oid).and_then(|c| c.tree()))
            .transpose()?;

        let changed = verify_checkout(&repo, baseline_tree.as_ref(), &target_tree)?;
        sink.report("Updating working tree", Some(changed as u64));

        // libgit2 reports every conflict before it modifies anything.
        let conflict = RefCell::new(None::<PathBuf>);
        let mut builder = CheckoutBuilder::new();
        builder
            .safe()
            .recreate_missing(true)
            .remove_untracked(false)
            .notify_on(CheckoutNotificationType::CONFLICT | CheckoutNotificationType::UPDATED)
            .notify(|kind, path, _, _, _| {
                if cancel.is_cancelled() {
                    return false;
                }
                if kind.contains(CheckoutNotificationType::CONFLICT) {
                    if let Some(path) = path {
                        conflict.borrow_mut().get_or_insert_with(|| path.to_path_buf());
                    }
                }
                true
            });
        let result = repo.checkout_tree(target_commit.as_object(), Some(&mut builder));
        drop(builder);
        result.map_err(|e| {
            if cancel.is_cancelled() {
                return SyncError::Interrupted {
                    operation: format!("checkout of {}", target),
                };
            }
            match conflict.borrow_mut().take() {
                Some(path) => SyncError::Conflict {
                    path,
                    reason: "local changes would be overwritten".to_string(),
                },
                None if e.code() == ErrorCode::Conflict => SyncError::Conflict {
                    path: work_dir.to_path_buf(),
                    reason: redact_text(e.message()),
                },
                None => classify_git_error(e),
            }
        })?;

        // Entries neither revision tracks survive a safe checkout; the index
        // must describe the target alone.
        let mut index = repo.index()?;
        if index.write_tree()? != target_tree.id() {
            log::debug!("Resetting the index of {} to {}", work_dir.display(), target);
            index.read_tree(&target_tree)?;
            index.write()?;
        }
        Ok(())
    }
}
