//! Backend driving the `git` executable with security hardening.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, unbounded};
use git2::Oid;
use tempfile::NamedTempFile;

use super::{Deadline, FetchPlan, GitBackend, HistoryDepth, RemoteAccess};
use crate::error::{CommandFailure, SyncError};
use crate::sink::{ProgressSink, redact_text, redact_url};
use crate::types::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const USERNAME_VAR: &str = "GITSYNC_USERNAME";
const PASSWORD_VAR: &str = "GITSYNC_PASSWORD";
const CREDENTIAL_HELPER: &str =
    "credential.helper=!f() { echo \"username=${GITSYNC_USERNAME}\"; echo \"password=${GITSYNC_PASSWORD}\"; }; f";

/// Git CLI wrapper with security hardening.
#[derive(Debug, Clone)]
pub struct CliGitBackend {
    git_path: String,
}

impl Default for CliGitBackend {
    fn default() -> Self {
        Self::new()
    }
}

enum Output {
    Line(String),
    Stdout(Vec<u8>),
}

/// Authentication material that has to stay alive while the child runs.
#[derive(Default)]
struct Auth {
    _key_file: Option<NamedTempFile>,
}

/// A prepared invocation plus the text used to describe it in errors.
struct Invocation {
    command: Command,
    display: String,
}

impl CliGitBackend {
    /// Create a new backend using the system git.
    pub fn new() -> Self {
        Self::with_git_path("git")
    }

    pub fn with_git_path(path: impl Into<String>) -> Self {
        Self {
            git_path: path.into(),
        }
    }

    /// Create a hardened Command with security settings.
    ///
    /// Applies:
    /// - `GIT_LFS_SKIP_SMUDGE=1` - skip LFS file downloads
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `core.hooksPath=` - disable hooks execution
    fn command(&self, dir: &Path) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.env("GIT_LFS_SKIP_SMUDGE", "1");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.args(["-c", "core.hooksPath="]);
        cmd.arg("-C").arg(dir);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Attach credentials to `cmd` without putting secrets on its command line.
    fn authenticate(&self, cmd: &mut Command, remote: RemoteAccess<'_>) -> Result<Auth, SyncError> {
        let access = remote.access;
        let mut auth = Auth::default();

        if let Some(secret) = access.ssh_key.as_deref() {
            if access.ssh_passphrase.as_deref().is_some_and(|p| !p.is_empty()) {
                return Err(SyncError::Auth {
                    message: "passphrase-protected SSH keys need the libgit2 backend".to_string(),
                    failure: None,
                });
            }
            let mut key = remote.credentials.decrypt(secret)?;
            if !key.ends_with('\n') {
                key.push('\n');
            }
            // NamedTempFile is created with owner-only permissions.
            let mut file = NamedTempFile::new()?;
            file.write_all(key.as_bytes())?;
            file.flush()?;
            cmd.env(
                "GIT_SSH_COMMAND",
                format!(
                    "ssh -i '{}' -o IdentitiesOnly=yes -o BatchMode=yes -o StrictHostKeyChecking=accept-new",
                    file.path().display()
                ),
            );
            auth._key_file = Some(file);
        }

        if let Some(secret) = access.password.as_deref() {
            let password = remote.credentials.decrypt(secret)?;
            cmd.env(USERNAME_VAR, access.username.as_deref().unwrap_or(""));
            cmd.env(PASSWORD_VAR, password);
            // Reset inherited helpers, then answer from the child-only variables.
            cmd.args(["-c", "credential.helper=", "-c", CREDENTIAL_HELPER]);
        }

        Ok(auth)
    }

    /// Run a prepared command, streaming stderr lines and enforcing deadline and cancellation.
    ///
    /// Returns stdout on success.
    fn run(
        &self,
        invocation: Invocation,
        deadline: Option<&Deadline>,
        cancel: &CancelToken,
        sink: &dyn ProgressSink,
        verbose: bool,
    ) -> Result<String, SyncError> {
        let Invocation {
            mut command,
            display,
        } = invocation;
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        log::debug!("Running {}", display);
        let mut child = command.spawn()?;

        let (tx, rx) = unbounded();
        let mut readers = Vec::new();
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                while reader.read_until(b'\n', &mut buf).unwrap_or(0) > 0 {
                    let chunk = String::from_utf8_lossy(&buf);
                    for line in chunk.split(['\r', '\n']).filter(|l| !l.trim().is_empty()) {
                        if tx.send(Output::Line(line.to_string())).is_err() {
                            return;
                        }
                    }
                    buf.clear();
                }
            }));
        }
        if let Some(mut stdout) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stdout.read_to_end(&mut buf);
                let _ = tx.send(Output::Stdout(buf));
            }));
        }
        drop(tx);

        let mut captured = Vec::new();
        let mut stdout = Vec::new();
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(Output::Line(line)) => {
                    let line = redact_text(&line);
                    if verbose {
                        sink.log(&line);
                    }
                    captured.push(line);
                }
                Ok(Output::Stdout(buf)) => stdout = buf,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if cancel.is_cancelled() {
                terminate(&mut child);
                return Err(SyncError::Interrupted {
                    operation: display,
                });
            }
            if let Some(deadline) = deadline {
                if deadline.expired() {
                    terminate(&mut child);
                    return Err(deadline.error(&display));
                }
            }
        }

        for reader in readers {
            let _ = reader.join();
        }
        let status = child.wait()?;
        if status.success() {
            return Ok(String::from_utf8_lossy(&stdout).into_owned());
        }

        Err(classify_failure(CommandFailure {
            command: display,
            exit_status: status.code(),
            captured_output: captured.join("\n"),
        }))
    }

    fn invocation(&self, dir: &Path, args: &[&str]) -> Invocation {
        let mut command = self.command(dir);
        command.args(args);
        Invocation {
            command,
            display: format!("git {}", args.join(" ")),
        }
    }
}

fn terminate(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Map git's stderr onto the error taxonomy.
fn classify_failure(failure: CommandFailure) -> SyncError {
    let output = failure.captured_output.as_str();
    let first_error = output
        .lines()
        .find(|l| l.starts_with("fatal:") || l.starts_with("error:"))
        .unwrap_or(output)
        .trim()
        .to_string();

    if output.contains("would be overwritten") || output.contains("not uptodate") {
        let path = quoted_path(&first_error).unwrap_or_default();
        return SyncError::Conflict {
            path: path.into(),
            reason: first_error,
        };
    }
    if output.contains("couldn't find remote ref") {
        let revision = output
            .lines()
            .find_map(|l| l.split("couldn't find remote ref").nth(1))
            .map(|r| r.trim().to_string())
            .unwrap_or_default();
        return SyncError::missing(revision, first_error);
    }
    if output.contains("Authentication failed")
        || output.contains("could not read Username")
        || output.contains("could not read Password")
        || output.contains("Permission denied (publickey")
    {
        return SyncError::Auth {
            message: first_error,
            failure: Some(failure),
        };
    }
    if output.contains("Could not resolve host")
        || output.contains("unable to access")
        || output.contains("Connection refused")
        || output.contains("Could not read from remote repository")
    {
        return SyncError::Network {
            message: first_error,
            failure: Some(failure),
        };
    }
    SyncError::Command(failure)
}

/// First `'quoted'` fragment of a git error line.
fn quoted_path(line: &str) -> Option<String> {
    let start = line.find('\'')? + 1;
    let end = line[start..].find('\'')? + start;
    Some(line[start..end].to_string())
}

impl GitBackend for CliGitBackend {
    fn name(&self) -> &'static str {
        "git-cli"
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
        let url = remote.url();
        let mut command = self.command(git_dir);
        let _auth = self.authenticate(&mut command, remote)?;
        command.args(["ls-remote", "--symref", "--", url, "HEAD"]);
        let invocation = Invocation {
            command,
            display: format!("git ls-remote --symref {} HEAD", redact_url(url)),
        };

        let stdout = self.run(invocation, Some(deadline), cancel, sink, remote.access.verbose_logs)?;
        stdout
            .lines()
            .find_map(|line| {
                let rest = line.strip_prefix("ref: ")?;
                let (target, name) = rest.split_once('\t')?;
                (name.trim() == "HEAD").then_some(target)
            })
            .and_then(|target| target.strip_prefix("refs/heads/"))
            .map(str::to_string)
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
        let url = remote.url();
        let refspec = plan.refspec();

        let mut command = self.command(plan.git_dir);
        let _auth = self.authenticate(&mut command, remote)?;
        let depth = match plan.depth {
            HistoryDepth::Full => None,
            HistoryDepth::Shallow(n) => Some(format!("--depth={}", n)),
            HistoryDepth::Unshallow => Some("--unshallow".to_string()),
        };
        let mut args = vec!["fetch", "--no-tags", "--update-head-ok", "--progress"];
        if let Some(depth) = depth.as_deref() {
            args.push(depth);
        }
        args.push("--");
        command.args(&args).arg(url).arg(&refspec);

        let invocation = Invocation {
            command,
            display: format!("git {} {} {}", args.join(" "), redact_url(url), refspec),
        };
        self.run(
            invocation,
            Some(&plan.deadline),
            cancel,
            sink,
            remote.access.verbose_logs,
        )?;
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
        let target = target.to_string();
        let baseline = baseline.map(|b| b.to_string());
        // Two trees: a merge from the recorded baseline that drops what it
        // tracked. One tree: populate from nothing.
        let mut args = vec!["read-tree", "-m", "-u"];
        if let Some(baseline) = baseline.as_deref() {
            args.push(baseline);
        }
        args.push(&target);

        if cancel.is_cancelled() {
            return Err(SyncError::Interrupted {
                operation: format!("checkout of {}", target),
            });
        }
        sink.report("Updating working tree", None);
        self.run(self.invocation(work_dir, &args), None, cancel, sink, false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::git_available;
    use crate::sink::DefaultCredentialStore;
    use crate::test_support::{CollectingSink, Fixture};
    use crate::types::RepositoryAccessData;
    use git2::Repository;

    fn failure(output: &str) -> CommandFailure {
        CommandFailure {
            command: "git fetch".to_string(),
            exit_status: Some(128),
            captured_output: output.to_string(),
        }
    }

    #[test]
    fn classifies_common_git_failures() {
        assert!(matches!(
            classify_failure(failure("fatal: Authentication failed for 'https://x/'")),
            SyncError::Auth { .. }
        ));
        assert!(matches!(
            classify_failure(failure(
                "fatal: unable to access 'https://x/': Could not resolve host: x"
            )),
            SyncError::Network { .. }
        ));
        assert!(matches!(
            classify_failure(failure("fatal: couldn't find remote ref refs/heads/nope")),
            SyncError::MissingRevision { ref revision, .. } if revision == "refs/heads/nope"
        ));
        assert!(matches!(
            classify_failure(failure("fatal: something odd")),
            SyncError::Command(_)
        ));
    }

    #[test]
    fn classifies_overwrite_as_conflict() {
        let err = classify_failure(failure(
            "error: Entry 'src/lib.rs' not uptodate. Cannot merge.",
        ));
        match err {
            SyncError::Conflict { path, .. } => assert_eq!(path, Path::new("src/lib.rs")),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn passphrase_keys_are_rejected() {
        let mut access = RepositoryAccessData::new("ssh://git@example.com/r.git");
        access.ssh_key = Some("key".to_string());
        access.ssh_passphrase = Some("pw".to_string());
        let remote = RemoteAccess {
            access: &access,
            credentials: &DefaultCredentialStore,
        };
        let mut cmd = Command::new("git");
        let err = CliGitBackend::new()
            .authenticate(&mut cmd, remote)
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::Auth { .. }));
    }

    #[test]
    fn shallow_fetch_over_file_transport() {
        if !git_available() {
            eprintln!("skipping test: git executable not found");
            return;
        }
        let upstream = Fixture::new();
        upstream.commit("first", &[("a.txt", Some("1"))]);
        let tip = upstream.commit("second", &[("a.txt", Some("2"))]);

        let dir = tempfile::tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        let access = RepositoryAccessData::new(upstream.url());
        let remote = RemoteAccess {
            access: &access,
            credentials: &DefaultCredentialStore,
        };
        let plan = FetchPlan {
            git_dir: dir.path(),
            branch: "main",
            depth: HistoryDepth::Shallow(1),
            deadline: Deadline::start(Duration::from_secs(60)),
        };
        CliGitBackend::new()
            .perform_fetch(&plan, remote, &CollectingSink::default(), &CancelToken::new())
            .unwrap();

        let repo = Repository::open(dir.path()).unwrap();
        assert!(repo.is_shallow());
        assert_eq!(repo.find_reference("refs/heads/main").unwrap().target(), Some(tip));
    }

    #[test]
    fn missing_remote_branch_is_a_missing_revision() {
        if !git_available() {
            eprintln!("skipping test: git executable not found");
            return;
        }
        let upstream = Fixture::new();
        upstream.commit("first", &[("a.txt", Some("1"))]);

        let dir = tempfile::tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        let access = RepositoryAccessData::new(upstream.url());
        let remote = RemoteAccess {
            access: &access,
            credentials: &DefaultCredentialStore,
        };
        let plan = FetchPlan {
            git_dir: dir.path(),
            branch: "does-not-exist",
            depth: HistoryDepth::Full,
            deadline: Deadline::start(Duration::from_secs(60)),
        };
        let err = CliGitBackend::new()
            .perform_fetch(&plan, remote, &CollectingSink::default(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingRevision { .. }), "{:?}", err);
    }

    #[test]
    fn ls_remote_reports_default_branch() {
        if !git_available() {
            eprintln!("skipping test: git executable not found");
            return;
        }
        let upstream = Fixture::new();
        upstream.commit("first", &[("a.txt", Some("1"))]);
        let dir = tempfile::tempdir().unwrap();
        Repository::init(dir.path()).unwrap();

        let access = RepositoryAccessData::new(upstream.url());
        let remote = RemoteAccess {
            access: &access,
            credentials: &DefaultCredentialStore,
        };
        let branch = CliGitBackend::new()
            .remote_default_branch(
                dir.path(),
                remote,
                &Deadline::start(Duration::from_secs(60)),
                &CollectingSink::default(),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(branch, "main");
    }

    #[test]
    fn cancelled_checkout_leaves_the_tree_alone() {
        let fixture = Fixture::new();
        let first = fixture.commit("first", &[("a.txt", Some("1"))]);
        let second = fixture.commit("second", &[("a.txt", Some("2"))]);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = CliGitBackend::new()
            .perform_checkout(
                fixture.path(),
                Some(second),
                first,
                &CollectingSink::default(),
                &cancel,
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::Interrupted { .. }), "{:?}", err);
        assert_eq!(
            std::fs::read_to_string(fixture.path().join("a.txt")).unwrap(),
            "2"
        );
    }

    #[test]
    fn cancelled_command_is_interrupted() {
        if !git_available() {
            eprintln!("skipping test: git executable not found");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let backend = CliGitBackend::new();
        let err = backend
            .run(
                backend.invocation(dir.path(), &["--version"]),
                None,
                &cancel,
                &CollectingSink::default(),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::Interrupted { .. }));
    }
}
