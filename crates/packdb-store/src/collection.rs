//! Branch-scoped key-value views.

use std::sync::{Arc, RwLock, Weak};

use git2::{Oid, Repository};
use tracing::debug;

use crate::commit::commit_to_ref;
use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::transaction::Transaction;
use crate::tree;

/// Tree and commit ids a collection currently points at.
///
/// The tree is either the tree of the commit (clean) or a descendant
/// staged by pending tree mutations.
#[derive(Debug, Default)]
pub(crate) struct CollectionState {
    pub(crate) tree: Option<Oid>,
    pub(crate) commit: Option<Oid>,
}

/// A key-value view over one branch of the database.
///
/// Each collection owns its current tree and commit ids behind a
/// readers-writer lock and back-references its [`Database`] weakly; the
/// database owns the collection map and the repository handle.
pub struct Collection {
    name: String,
    db: Weak<Database>,
    self_ref: Weak<Collection>,
    pub(crate) state: RwLock<CollectionState>,
}

impl Collection {
    /// Create a collection and synchronise it with its branch tip.
    ///
    /// When the branch does not exist yet the collection settles into the
    /// empty state.
    pub(crate) fn create(name: &str, db: Weak<Database>) -> Arc<Self> {
        let coll = Arc::new_cyclic(|self_ref| Self {
            name: name.to_string(),
            db,
            self_ref: self_ref.clone(),
            state: RwLock::new(CollectionState::default()),
        });
        if let Err(err) = coll.reset() {
            debug!(collection = name, %err, "new collection settled empty");
        }
        coll
    }

    /// The collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The branch reference backing this collection.
    pub fn ref_name(&self) -> String {
        format!("refs/heads/{}", self.name)
    }

    /// The current (possibly staged) tree id.
    pub fn tree_id(&self) -> Option<Oid> {
        self.state.read().expect("collection lock poisoned").tree
    }

    /// The last committed tip this collection has observed.
    pub fn commit_id(&self) -> Option<Oid> {
        self.state.read().expect("collection lock poisoned").commit
    }

    pub(crate) fn database(&self) -> StoreResult<Arc<Database>> {
        self.db.upgrade().ok_or_else(|| {
            StoreError::NotFound(format!(
                "database backing collection {:?} was removed",
                self.name
            ))
        })
    }

    pub(crate) fn weak_self(&self) -> Weak<Collection> {
        self.self_ref.clone()
    }

    /// Fetch the value stored at `key`, by copy.
    pub fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let db = self.database()?;
        let state = self.state.read().expect("collection lock poisoned");
        let Some(tree_id) = state.tree else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        let repo = db.repo();
        tree::tree_get(&repo, Some(tree_id), key)
    }

    /// Start an empty transaction against this collection.
    pub fn new_transaction(&self) -> Transaction {
        Transaction::new(self.weak_self())
    }

    /// Discard staged mutations and move back to the branch tip.
    pub fn reset(&self) -> StoreResult<()> {
        let db = self.database()?;
        let mut state = self.state.write().expect("collection lock poisoned");
        let repo = db.repo();
        self.reset_locked(&repo, &mut state)
    }

    /// `reset` for callers that already hold the collection lock.
    pub(crate) fn reset_locked(
        &self,
        repo: &Repository,
        state: &mut CollectionState,
    ) -> StoreResult<()> {
        let refname = self.ref_name();
        let reference = match repo.find_reference(&refname) {
            Ok(reference) => reference,
            Err(err) => {
                // The branch is gone; nothing to point at.
                state.tree = None;
                state.commit = None;
                if err.code() == git2::ErrorCode::NotFound {
                    return Err(StoreError::NotFound(refname));
                }
                return Err(err.into());
            }
        };
        let target = reference
            .target()
            .ok_or_else(|| StoreError::NotFound(refname.clone()))?;

        if state.commit == Some(target) {
            // Already at the tip with nothing staged.
            return Ok(());
        }

        let tip = repo.find_commit(target)?;
        state.tree = Some(tip.tree_id());
        state.commit = Some(target);
        Ok(())
    }

    /// Re-read the branch tip into the commit pointer.
    ///
    /// The tree is deliberately left untouched; `reset` is the operation
    /// that synchronises both.
    pub(crate) fn refresh_commit(&self) -> StoreResult<()> {
        let db = self.database()?;
        let mut state = self.state.write().expect("collection lock poisoned");
        let repo = db.repo();
        let refname = self.ref_name();
        let reference = repo
            .find_reference(&refname)
            .map_err(|err| match err.code() {
                git2::ErrorCode::NotFound => StoreError::NotFound(refname.clone()),
                _ => err.into(),
            })?;
        let target = reference
            .target()
            .ok_or_else(|| StoreError::NotFound(refname))?;
        repo.find_commit(target)?;
        state.commit = Some(target);
        Ok(())
    }

    /// Commit the current tree to the branch.
    pub fn commit(&self, msg: &str) -> StoreResult<()> {
        let db = self.database()?;
        let mut state = self.state.write().expect("collection lock poisoned");
        let repo = db.repo();
        self.commit_locked(&repo, &mut state, msg)
    }

    /// `commit` for callers that already hold the collection lock.
    pub(crate) fn commit_locked(
        &self,
        repo: &Repository,
        state: &mut CollectionState,
        msg: &str,
    ) -> StoreResult<()> {
        let Some(tree_id) = state.tree else {
            // Nothing to commit.
            return Ok(());
        };
        let commit = commit_to_ref(repo, tree_id, state.commit, &self.ref_name(), msg)?;
        state.commit = Some(commit);
        Ok(())
    }

    /// Fetch this branch from `url` and reset to the fetched tip.
    pub fn pull(&self, url: &str) -> StoreResult<()> {
        let db = self.database()?;
        let mut state = self.state.write().expect("collection lock poisoned");
        let repo = db.repo();
        let refname = self.ref_name();
        let refspec = format!("{refname}:{refname}");
        let mut remote = repo.remote_anonymous(url)?;
        let reflog_msg = format!("packdb.pull {url} {refspec}");
        remote.fetch(
            &[refspec.as_str()],
            Some(&mut git2::FetchOptions::new()),
            Some(&reflog_msg),
        )?;
        drop(remote);
        self.reset_locked(&repo, &mut state)
    }

    /// Push this branch to `url`, creating or updating the remote ref.
    pub fn push(&self, url: &str) -> StoreResult<()> {
        let db = self.database()?;
        let repo = db.repo();
        let refname = self.ref_name();
        // The leading '+' forces creation of the remote ref.
        let refspec = format!("+{refname}:{refname}");
        let mut remote = repo.remote_anonymous(url)?;
        remote.push(&[refspec.as_str()], Some(&mut git2::PushOptions::new()))?;
        Ok(())
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().expect("collection lock poisoned");
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("tree", &state.tree)
            .field("commit", &state.commit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::DatabaseCache;

    fn test_db() -> (tempfile::TempDir, Arc<Database>) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DatabaseCache::new();
        let db = cache.open(dir.path()).unwrap();
        (dir, db)
    }

    fn insert(coll: &Arc<Collection>, key: &str, value: &str) {
        let txn = coll.new_transaction();
        txn.add(key, value);
        txn.run().unwrap();
    }

    /// Land a commit on the collection's branch without going through the
    /// collection, as another writer would.
    fn external_commit(db: &Database, coll: &Collection, key: &str, value: &str) -> Oid {
        let base = coll.commit_id();
        let base_tree = coll.tree_id();
        let repo = db.repo();
        let blob = repo.blob(value.as_bytes()).unwrap();
        let tree = tree::tree_add(&repo, base_tree, key, Some(blob))
            .unwrap()
            .unwrap();
        commit_to_ref(&repo, tree, base, &coll.ref_name(), "external").unwrap()
    }

    #[test]
    fn new_collection_settles_empty() {
        let (_dir, db) = test_db();
        let coll = db.collection("fresh");
        assert!(coll.tree_id().is_none());
        assert!(coll.commit_id().is_none());
        let err = coll.get("anything").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn get_normalises_keys() {
        let (_dir, db) = test_db();
        let coll = db.collection("norm");
        insert(&coll, "a/b", "value");
        assert_eq!(coll.get("a/b").unwrap(), b"value");
        assert_eq!(coll.get("/a/b").unwrap(), b"value");
        assert_eq!(coll.get("a///b").unwrap(), b"value");
        assert_eq!(coll.get("a/./b").unwrap(), b"value");
    }

    #[test]
    fn concurrent_reads_observe_the_value() {
        let (_dir, db) = test_db();
        let coll = db.collection("reads");
        insert(&coll, "read-test", "02/02/02");

        std::thread::scope(|scope| {
            for _ in 0..128 {
                let coll = Arc::clone(&coll);
                scope.spawn(move || {
                    let value = coll.get("read-test").unwrap();
                    assert_eq!(value, b"02/02/02");
                });
            }
        });
    }

    #[test]
    fn reset_is_a_no_op_at_the_tip() {
        let (_dir, db) = test_db();
        let coll = db.collection("stable");
        insert(&coll, "k", "v");
        let before = coll.commit_id();
        coll.reset().unwrap();
        assert_eq!(coll.commit_id(), before);
        assert_eq!(coll.get("k").unwrap(), b"v");
    }

    #[test]
    fn reset_picks_up_an_external_tip() {
        let (_dir, db) = test_db();
        let coll = db.collection("moving");
        insert(&coll, "a", "1");
        let tip = external_commit(&db, &coll, "b", "2");

        coll.reset().unwrap();
        assert_eq!(coll.commit_id(), Some(tip));
        assert_eq!(coll.get("a").unwrap(), b"1");
        assert_eq!(coll.get("b").unwrap(), b"2");
    }

    #[test]
    fn reset_without_a_branch_clears_state() {
        let (_dir, db) = test_db();
        let coll = db.collection("gone");
        insert(&coll, "k", "v");

        {
            let repo = db.repo();
            let mut reference = repo.find_reference(&coll.ref_name()).unwrap();
            reference.delete().unwrap();
        }

        let err = coll.reset().unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(coll.tree_id().is_none());
        assert!(coll.commit_id().is_none());
    }

    #[test]
    fn refresh_commit_leaves_the_tree_alone() {
        let (_dir, db) = test_db();
        let coll = db.collection("pointer");
        insert(&coll, "a", "1");
        let old_tree = coll.tree_id();
        let tip = external_commit(&db, &coll, "b", "2");

        coll.refresh_commit().unwrap();
        assert_eq!(coll.commit_id(), Some(tip));
        assert_eq!(coll.tree_id(), old_tree);
    }

    #[test]
    fn commit_with_nothing_staged_is_a_no_op() {
        let (_dir, db) = test_db();
        let coll = db.collection("idle");
        coll.commit("noop").unwrap();
        assert!(coll.commit_id().is_none());
    }

    #[test]
    fn pull_and_push_roundtrip_through_a_local_remote() {
        let (_dir, db) = test_db();
        let coll = db.collection("synced");
        insert(&coll, "k", "v");

        let remote_dir = tempfile::tempdir().unwrap();
        git2::Repository::init_bare(remote_dir.path()).unwrap();
        let url = remote_dir.path().to_str().unwrap().to_string();

        coll.push(&url).unwrap();

        let other_dir = tempfile::tempdir().unwrap();
        let cache = DatabaseCache::new();
        let other_db = cache.open(other_dir.path()).unwrap();
        let other = other_db.collection("synced");
        other.pull(&url).unwrap();
        assert_eq!(other.get("k").unwrap(), b"v");
    }
}
