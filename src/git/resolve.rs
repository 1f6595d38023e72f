//! Revision pointer resolution.

use git2::{Commit, Oid, Repository};

use crate::error::SyncError;

/// Resolve a revision pointer to a commit id.
///
/// Order: local branch, tag, other ref forms (`refs/...`, `HEAD`, remote
/// refs), then a full or abbreviated object id. Returns `None` when nothing
/// matches or the match does not peel to a commit.
pub fn resolve_revision(repo: &Repository, revision: &str) -> Option<Oid> {
    let revision = revision.trim();
    if revision.is_empty() {
        return None;
    }

    let by_ref = [
        format!("refs/heads/{}", revision),
        format!("refs/tags/{}", revision),
    ];
    for name in &by_ref {
        if let Ok(reference) = repo.find_reference(name) {
            if let Ok(commit) = reference.peel_to_commit() {
                return Some(commit.id());
            }
        }
    }

    if revision == "HEAD" || revision.starts_with("refs/") {
        if let Ok(commit) = repo
            .find_reference(revision)
            .and_then(|r| r.peel_to_commit())
        {
            return Some(commit.id());
        }
    }

    if let Ok(commit) = repo
        .resolve_reference_from_short_name(revision)
        .and_then(|r| r.peel_to_commit())
    {
        return Some(commit.id());
    }

    if (4..=40).contains(&revision.len()) && revision.bytes().all(|b| b.is_ascii_hexdigit()) {
        if let Ok(commit) = repo
            .revparse_single(revision)
            .and_then(|obj| obj.peel_to_commit())
        {
            return Some(commit.id());
        }
    }

    None
}

/// Resolve a revision pointer to a commit, failing with `MissingRevision`.
pub fn resolve_commit<'r>(repo: &'r Repository, revision: &str) -> Result<Commit<'r>, SyncError> {
    let oid = resolve_revision(repo, revision)
        .ok_or_else(|| SyncError::missing(revision, "no branch, tag, ref or commit matches"))?;
    repo.find_commit(oid)
        .map_err(|e| SyncError::missing_object(revision, e.message().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;

    #[test]
    fn resolves_branches_before_tags() {
        let fixture = Fixture::new();
        let first = fixture.commit("first", &[("a.txt", Some("1"))]);
        let second = fixture.commit("second", &[("a.txt", Some("2"))]);
        fixture.tag("release", first);
        // A branch and a tag with the same name: the branch wins.
        fixture.branch_at("release", second);
        fixture.tag("v1", first);

        let repo = fixture.repo();
        assert_eq!(resolve_revision(&repo, "release"), Some(second));
        assert_eq!(resolve_revision(&repo, "v1"), Some(first));
        assert_eq!(resolve_revision(&repo, "refs/tags/release"), Some(first));
    }

    #[test]
    fn resolves_head_and_object_ids() {
        let fixture = Fixture::new();
        let id = fixture.commit("only", &[("a.txt", Some("1"))]);
        let repo = fixture.repo();

        assert_eq!(resolve_revision(&repo, "HEAD"), Some(id));
        assert_eq!(resolve_revision(&repo, &id.to_string()), Some(id));
        assert_eq!(resolve_revision(&repo, &id.to_string()[..10]), Some(id));
    }

    #[test]
    fn unknown_revisions_are_missing() {
        let fixture = Fixture::new();
        fixture.commit("only", &[("a.txt", Some("1"))]);
        let repo = fixture.repo();

        assert_eq!(resolve_revision(&repo, "nope"), None);
        assert_eq!(resolve_revision(&repo, ""), None);
        assert_eq!(
            resolve_revision(&repo, "0123456789012345678901234567890123456789"),
            None
        );
        let err = resolve_commit(&repo, "nope").unwrap_err();
        assert!(matches!(err, SyncError::MissingRevision { .. }));
    }
}
