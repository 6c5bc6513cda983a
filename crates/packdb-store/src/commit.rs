//! Promotion of staged trees to commits under a named reference.
//!
//! Reference updates ride on the object database's compare-and-swap: a
//! commit created against a ref only lands if the ref still points at the
//! declared parent. When the swap is lost, the staged tree is merged with
//! the new tip and the attempt repeats.

use std::path::Path;

use git2::{Oid, Repository};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::tree::{lookup_tip, lookup_tree};

/// Fixed synthetic identity used for both author and committer.
const SIGNATURE_NAME: &str = "libpack";
const SIGNATURE_EMAIL: &str = "libpack";

/// Upper bound on lost compare-and-swap races before giving up.
pub(crate) const MAX_COMMIT_RETRIES: usize = 32;

/// Stage bits within `IndexEntry::flags`.
const INDEX_ENTRY_STAGE_MASK: u16 = 0x3000;

/// Attach `tree` as a new commit under `refname`, with `parent` as the
/// declared parent.
///
/// On a concurrent update of `refname`, the staged tree is three-way
/// merged with the current tip (conflicts resolve to the staged side) and
/// the merged commit, carrying both parents, is retried. Conflicts with no
/// staged side surface [`StoreError::MergeConflict`]; exhausting the
/// retries surfaces [`StoreError::Concurrency`].
pub(crate) fn commit_to_ref(
    repo: &Repository,
    tree: Oid,
    parent: Option<Oid>,
    refname: &str,
    msg: &str,
) -> StoreResult<Oid> {
    let mut need_merge = false;
    let mut tmp_commit: Option<Oid> = None;

    for attempt in 0..MAX_COMMIT_RETRIES {
        if !need_merge {
            let parents: Vec<Oid> = parent.into_iter().collect();
            match mk_commit(repo, Some(refname), msg, tree, &parents) {
                Ok(id) => return Ok(id),
                Err(err) if is_concurrency_error(&err) => {
                    debug!(refname, attempt, "reference moved, merging with tip");
                    need_merge = true;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        // An intermediary commit carrying the staged tree, created without
        // a ref update. It feeds the merge and never joins the history.
        let tmp_id = match tmp_commit {
            Some(id) => id,
            None => {
                let parents: Vec<Oid> = parent.into_iter().collect();
                let id = mk_commit(repo, None, msg, tree, &parents)?;
                tmp_commit = Some(id);
                id
            }
        };

        let Some(tip_id) = lookup_tip(repo, refname) else {
            // The ref vanished between attempts; try the plain commit again.
            need_merge = false;
            continue;
        };

        let tmp = repo.find_commit(tmp_id)?;
        let tip = repo.find_commit(tip_id)?;
        let opts = git2::MergeOptions::new();
        let mut index = repo.merge_commits(&tmp, &tip, Some(&opts))?;
        resolve_conflicts_with_ours(&mut index)?;
        let merged_tree = index.write_tree_to(repo)?;
        lookup_tree(repo, merged_tree)?;

        // The merged commit keeps the declared parent first and the
        // observed tip second, so it cannot ride the create-commit ref
        // update (that path insists the tip be the first parent). Create
        // it dangling and swap the ref against the tip we merged with.
        let mut parents: Vec<Oid> = parent.into_iter().collect();
        parents.push(tip_id);
        let merged = mk_commit(repo, None, msg, merged_tree, &parents)?;
        match repo.reference_matching(refname, merged, true, tip_id, msg) {
            Ok(_) => return Ok(merged),
            Err(err) if is_concurrency_error(&err) => {
                debug!(refname, attempt, "reference moved again during merge");
                continue;
            }
            Err(err) if err.code() == git2::ErrorCode::NotFound => {
                // The ref was deleted while we merged.
                need_merge = false;
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(StoreError::Concurrency(format!(
        "too many failed merge attempts on {refname}, giving up"
    )))
}

/// Create a commit object; `refname` of `None` leaves the commit dangling.
fn mk_commit(
    repo: &Repository,
    refname: Option<&str>,
    msg: &str,
    tree: Oid,
    parents: &[Oid],
) -> Result<Oid, git2::Error> {
    let signature = git2::Signature::now(SIGNATURE_NAME, SIGNATURE_EMAIL)?;
    let tree = repo.find_tree(tree)?;
    let parent_commits: Vec<git2::Commit<'_>> = parents
        .iter()
        .map(|id| repo.find_commit(*id))
        .collect::<Result<_, _>>()?;
    let parent_refs: Vec<&git2::Commit<'_>> = parent_commits.iter().collect();
    repo.commit(refname, &signature, &signature, msg, &tree, &parent_refs)
}

/// Resolve every conflict in `index` to its "ours" entry.
///
/// A conflict without an "ours" side cannot be resolved and fails the
/// merge.
fn resolve_conflicts_with_ours(index: &mut git2::Index) -> StoreResult<()> {
    if !index.has_conflicts() {
        return Ok(());
    }
    let conflicts: Vec<git2::IndexConflict> =
        index.conflicts()?.collect::<Result<_, _>>()?;
    for conflict in conflicts {
        let Some(ours) = conflict.our else {
            let path = conflict
                .their
                .or(conflict.ancestor)
                .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
                .unwrap_or_default();
            return Err(StoreError::MergeConflict { path });
        };
        let path = String::from_utf8_lossy(&ours.path).into_owned();
        for stage in 1..=3 {
            // Absent stages are fine; only real failures matter below.
            let _ = index.remove(Path::new(&path), stage);
        }
        let resolved = git2::IndexEntry {
            ctime: ours.ctime,
            mtime: ours.mtime,
            dev: ours.dev,
            ino: ours.ino,
            mode: ours.mode,
            uid: ours.uid,
            gid: ours.gid,
            file_size: ours.file_size,
            id: ours.id,
            flags: ours.flags & !INDEX_ENTRY_STAGE_MASK,
            flags_extended: ours.flags_extended,
            path: ours.path,
        };
        index.add(&resolved)?;
    }
    Ok(())
}

/// Whether `err` means the reference changed under us or is locked.
///
/// The error class varies by path (commit creation reports the stale-tip
/// case as an object error, reference swaps report it as a reference
/// error), so classification keys on the code alone.
fn is_concurrency_error(err: &git2::Error) -> bool {
    matches!(
        err.code(),
        git2::ErrorCode::Modified | git2::ErrorCode::Locked
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{empty_tree, tree_add, tree_get, tree_remove};

    const REF: &str = "refs/heads/data";

    fn test_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init_bare(dir.path()).unwrap();
        (dir, repo)
    }

    fn tree_with(repo: &Repository, base: Option<Oid>, key: &str, value: &[u8]) -> Oid {
        let blob = repo.blob(value).unwrap();
        tree_add(repo, base, key, Some(blob)).unwrap().unwrap()
    }

    /// Point REF at a commit made outside the engine, simulating another
    /// writer winning the race.
    fn advance_ref_externally(repo: &Repository, tree: Oid, parents: &[Oid]) -> Oid {
        let id = mk_commit(repo, None, "competing", tree, parents).unwrap();
        repo.reference(REF, id, true, "external update").unwrap();
        id
    }

    #[test]
    fn first_commit_creates_the_ref() {
        let (_dir, repo) = test_repo();
        let tree = tree_with(&repo, None, "a", b"1");
        let id = commit_to_ref(&repo, tree, None, REF, "first").unwrap();

        let tip = lookup_tip(&repo, REF).unwrap();
        assert_eq!(tip, id);
        let commit = repo.find_commit(id).unwrap();
        assert_eq!(commit.parent_count(), 0);
        assert_eq!(commit.message().unwrap(), "first");
    }

    #[test]
    fn commits_chain_through_the_parent() {
        let (_dir, repo) = test_repo();
        let t1 = tree_with(&repo, None, "a", b"1");
        let c1 = commit_to_ref(&repo, t1, None, REF, "first").unwrap();
        let t2 = tree_with(&repo, Some(t1), "b", b"2");
        let c2 = commit_to_ref(&repo, t2, Some(c1), REF, "second").unwrap();

        let commit = repo.find_commit(c2).unwrap();
        assert_eq!(commit.parent_count(), 1);
        assert_eq!(commit.parent_id(0).unwrap(), c1);
        assert_eq!(lookup_tip(&repo, REF).unwrap(), c2);
    }

    #[test]
    fn signature_uses_the_fixed_identity() {
        let (_dir, repo) = test_repo();
        let tree = tree_with(&repo, None, "a", b"1");
        let id = commit_to_ref(&repo, tree, None, REF, "signed").unwrap();
        let commit = repo.find_commit(id).unwrap();
        assert_eq!(commit.author().name().unwrap(), "libpack");
        assert_eq!(commit.author().email().unwrap(), "libpack");
        assert_eq!(commit.committer().name().unwrap(), "libpack");
    }

    #[test]
    fn lost_race_merges_with_the_new_tip() {
        let (_dir, repo) = test_repo();
        let base_tree = tree_with(&repo, None, "a", b"1");
        let base = commit_to_ref(&repo, base_tree, None, REF, "base").unwrap();

        // A competing writer lands "c" on the ref first.
        let their_tree = tree_with(&repo, Some(base_tree), "c", b"3");
        let theirs = advance_ref_externally(&repo, their_tree, &[base]);

        // Our staged tree adds "b" on top of the stale parent.
        let our_tree = tree_with(&repo, Some(base_tree), "b", b"2");
        let merged = commit_to_ref(&repo, our_tree, Some(base), REF, "ours").unwrap();

        let commit = repo.find_commit(merged).unwrap();
        assert_eq!(commit.parent_count(), 2);
        assert_eq!(commit.parent_id(0).unwrap(), base);
        assert_eq!(commit.parent_id(1).unwrap(), theirs);

        let merged_tree = Some(commit.tree_id());
        assert_eq!(tree_get(&repo, merged_tree, "a").unwrap(), b"1");
        assert_eq!(tree_get(&repo, merged_tree, "b").unwrap(), b"2");
        assert_eq!(tree_get(&repo, merged_tree, "c").unwrap(), b"3");
        assert_eq!(lookup_tip(&repo, REF).unwrap(), merged);
    }

    #[test]
    fn conflicting_edits_resolve_to_the_staged_side() {
        let (_dir, repo) = test_repo();
        let base_tree = tree_with(&repo, None, "k", b"base");
        let base = commit_to_ref(&repo, base_tree, None, REF, "base").unwrap();

        let their_tree = tree_with(&repo, Some(base_tree), "k", b"theirs");
        advance_ref_externally(&repo, their_tree, &[base]);

        let our_tree = tree_with(&repo, Some(base_tree), "k", b"ours");
        let merged = commit_to_ref(&repo, our_tree, Some(base), REF, "ours").unwrap();

        let commit = repo.find_commit(merged).unwrap();
        assert_eq!(
            tree_get(&repo, Some(commit.tree_id()), "k").unwrap(),
            b"ours"
        );
    }

    #[test]
    fn delete_versus_edit_is_an_unresolved_conflict() {
        let (_dir, repo) = test_repo();
        let base_tree = tree_with(&repo, None, "k", b"base");
        let base = commit_to_ref(&repo, base_tree, None, REF, "base").unwrap();

        // They edit "k"; we delete it, so the merge has no staged side.
        let their_tree = tree_with(&repo, Some(base_tree), "k", b"theirs");
        advance_ref_externally(&repo, their_tree, &[base]);

        let our_tree = tree_remove(&repo, base_tree, &["k".to_string()]).unwrap();
        let err = commit_to_ref(&repo, our_tree, Some(base), REF, "ours").unwrap_err();
        assert!(matches!(err, StoreError::MergeConflict { .. }));
    }

    #[test]
    fn empty_tree_commits_cleanly() {
        let (_dir, repo) = test_repo();
        let tree = empty_tree(&repo).unwrap();
        let id = commit_to_ref(&repo, tree, None, REF, "empty").unwrap();
        assert_eq!(repo.find_commit(id).unwrap().tree_id(), tree);
    }
}
