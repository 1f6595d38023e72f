//! Shared helpers for unit tests: a collecting sink and a git fixture builder.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use git2::{BranchType, Oid, Repository, RepositoryInitOptions, Signature, Time};
use tempfile::TempDir;

use crate::sink::ProgressSink;

/// Records every line it receives.
#[derive(Default)]
pub struct CollectingSink {
    lines: Mutex<Vec<String>>,
}

impl CollectingSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl ProgressSink for CollectingSink {
    fn report(&self, task: &str, units_total: Option<u64>) {
        let line = match units_total {
            Some(total) => format!("{} ({})", task, total),
            None => task.to_string(),
        };
        self.lines.lock().unwrap().push(line);
    }

    fn log(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

/// A throwaway non-bare repository whose initial branch is `main`.
pub struct Fixture {
    dir: TempDir,
    clock: Cell<i64>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        Repository::init_opts(dir.path(), &opts).unwrap();
        Self {
            dir,
            clock: Cell::new(1_700_000_000),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// `file://` URL for transports that need one.
    pub fn url(&self) -> String {
        format!("file://{}", self.dir.path().display())
    }

    pub fn repo(&self) -> Repository {
        Repository::open(self.dir.path()).unwrap()
    }

    fn signature(&self) -> Signature<'static> {
        let now = self.clock.get() + 60;
        self.clock.set(now);
        Signature::new("Fixture Author", "author@example.com", &Time::new(now, 0)).unwrap()
    }

    /// Commit on the current branch. `None` content deletes the path.
    pub fn commit(&self, message: &str, files: &[(&str, Option<&str>)]) -> Oid {
        let repo = self.repo();
        let parents: Vec<_> = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .into_iter()
            .collect();
        self.commit_with_parents(&repo, message, files, &parents.iter().collect::<Vec<_>>())
    }

    /// Merge commit of the current branch and `other`, keeping the current tree plus `files`.
    pub fn merge(&self, message: &str, other: Oid, files: &[(&str, Option<&str>)]) -> Oid {
        let repo = self.repo();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        let other = repo.find_commit(other).unwrap();
        self.commit_with_parents(&repo, message, files, &[&head, &other])
    }

    fn commit_with_parents(
        &self,
        repo: &Repository,
        message: &str,
        files: &[(&str, Option<&str>)],
        parents: &[&git2::Commit<'_>],
    ) -> Oid {
        let mut index = repo.index().unwrap();
        for (path, content) in files {
            let full = self.dir.path().join(path);
            match content {
                Some(content) => {
                    if let Some(parent) = full.parent() {
                        fs::create_dir_all(parent).unwrap();
                    }
                    if full.is_dir() {
                        fs::remove_dir_all(&full).unwrap();
                    }
                    fs::write(&full, content).unwrap();
                    index.add_path(Path::new(path)).unwrap();
                }
                None => {
                    let _ = fs::remove_file(&full);
                    index.remove_path(Path::new(path)).unwrap();
                }
            }
        }
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = self.signature();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, parents)
            .unwrap()
    }

    pub fn tag(&self, name: &str, target: Oid) {
        let repo = self.repo();
        let object = repo.find_object(target, None).unwrap();
        repo.tag_lightweight(name, &object, true).unwrap();
    }

    pub fn branch_at(&self, name: &str, target: Oid) {
        let repo = self.repo();
        let commit = repo.find_commit(target).unwrap();
        repo.branch(name, &commit, true).unwrap();
    }

    /// Create `name` at the current `HEAD` (if missing) and switch to it.
    pub fn switch(&self, name: &str) {
        let repo = self.repo();
        if repo.find_branch(name, BranchType::Local).is_err() {
            let head = repo.head().unwrap().peel_to_commit().unwrap();
            repo.branch(name, &head, false).unwrap();
        }
        repo.set_head(&format!("refs/heads/{}", name)).unwrap();
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.force();
        repo.checkout_head(Some(&mut checkout)).unwrap();
    }

    pub fn head(&self) -> Oid {
        self.repo().head().unwrap().target().unwrap()
    }
}

/// Every regular file under `root`, skipping `.git`, with its contents.
pub fn read_tree(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) {
        for entry in fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            if path.file_name().is_some_and(|n| n == ".git") {
                continue;
            }
            let file_type = entry.file_type().unwrap();
            if file_type.is_dir() {
                walk(root, &path, out);
            } else if file_type.is_symlink() {
                let target = fs::read_link(&path).unwrap();
                out.push((
                    path.strip_prefix(root).unwrap().to_path_buf(),
                    target.to_string_lossy().into_owned().into_bytes(),
                ));
            } else {
                out.push((
                    path.strip_prefix(root).unwrap().to_path_buf(),
                    fs::read(&path).unwrap(),
                ));
            }
        }
    }

    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}
