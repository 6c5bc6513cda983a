//! Batched, atomically committed mutations against one collection.

use std::sync::{Mutex, Weak};

use git2::Repository;

use crate::collection::{Collection, CollectionState};
use crate::error::{ErrorAccumulator, StoreError, StoreResult};
use crate::tree;
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OpKind {
    Add,
    Delete,
}

#[derive(Clone, Debug, PartialEq)]
struct Operation {
    key: String,
    value: Value,
    kind: OpKind,
}

#[derive(Debug, Default)]
struct TransactionState {
    ops: Vec<Operation>,
    delete_group: Vec<String>,
}

/// An ordered batch of add/delete operations against one [`Collection`].
///
/// Operations may be queued from multiple threads; the transaction's own
/// lock linearises them. `run` applies the batch in insertion order under
/// the collection's write lock and installs a single commit. Deletes are
/// coalesced into groups so consecutive removals share one tree rewrite.
pub struct Transaction {
    coll: Weak<Collection>,
    state: Mutex<TransactionState>,
    continue_on_error: bool,
}

impl Transaction {
    pub(crate) fn new(coll: Weak<Collection>) -> Self {
        Self {
            coll,
            state: Mutex::new(TransactionState::default()),
            continue_on_error: false,
        }
    }

    /// Keep applying operations after a failure instead of rolling back.
    ///
    /// Partial failures are still recorded and surfaced from `run` as an
    /// aggregate, but tree mutations that succeeded persist.
    pub fn set_continue_on_error(&mut self, continue_on_error: bool) {
        self.continue_on_error = continue_on_error;
    }

    /// Queue a write of `value` at `key`.
    pub fn add(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut state = self.state.lock().expect("transaction lock poisoned");
        state.ops.push(Operation {
            key: key.into(),
            value: value.into(),
            kind: OpKind::Add,
        });
    }

    /// Queue a removal of `key`.
    pub fn delete(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut state = self.state.lock().expect("transaction lock poisoned");
        state.ops.push(Operation {
            key: key.into(),
            value: value.into(),
            kind: OpKind::Delete,
        });
    }

    /// Drop the first queued operation matching `key` and `value`.
    pub fn remove_operation(&self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        let mut state = self.state.lock().expect("transaction lock poisoned");
        if let Some(idx) = state
            .ops
            .iter()
            .position(|op| op.key == key && op.value == value)
        {
            state.ops.remove(idx);
        }
    }

    /// Number of queued operations.
    pub fn op_count(&self) -> usize {
        self.state.lock().expect("transaction lock poisoned").ops.len()
    }

    /// Returns `true` if no operations are queued.
    pub fn is_empty(&self) -> bool {
        self.op_count() == 0
    }

    /// Apply the queued operations and commit the result.
    ///
    /// Holds the transaction lock, then the collection's write lock, for
    /// the whole run. On the first failure the collection is reset to its
    /// tip and the error returned, unless `continue_on_error` is set, in
    /// which case every failure is recorded and the survivors commit.
    /// A successful run leaves the transaction empty.
    pub fn run(&self) -> StoreResult<()> {
        let mut txn = self.state.lock().expect("transaction lock poisoned");
        let coll = self.coll.upgrade().ok_or_else(|| {
            StoreError::NotFound("collection backing this transaction was removed".to_string())
        })?;
        let db = coll.database()?;
        let mut coll_state = coll.state.write().expect("collection lock poisoned");
        let repo = db.repo();

        let mut acc = ErrorAccumulator::new();
        let TransactionState { ops, delete_group } = &mut *txn;

        for op in ops.iter() {
            match op.kind {
                OpKind::Add => {
                    // Pending deletes must land before the add so ordering
                    // within the batch is preserved.
                    if let Err(err) = flush_delete_group(
                        &repo,
                        &mut coll_state,
                        delete_group,
                        self.continue_on_error,
                    ) {
                        acc.push(err);
                        if !self.continue_on_error {
                            acc.record(coll.reset_locked(&repo, &mut coll_state));
                            return acc.resolve();
                        }
                    }

                    let bytes = match op.value.to_bytes() {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            acc.push(err);
                            if !self.continue_on_error {
                                acc.record(coll.reset_locked(&repo, &mut coll_state));
                                return acc.resolve();
                            }
                            continue;
                        }
                    };

                    let blob = match repo.blob(&bytes) {
                        Ok(id) => id,
                        Err(err) => {
                            acc.push(err.into());
                            if !self.continue_on_error {
                                acc.record(coll.reset_locked(&repo, &mut coll_state));
                                return acc.resolve();
                            }
                            continue;
                        }
                    };

                    match tree::tree_add(&repo, coll_state.tree, &op.key, Some(blob)) {
                        Ok(new_tree) => coll_state.tree = new_tree,
                        Err(err) => {
                            acc.push(err);
                            if !self.continue_on_error {
                                acc.record(coll.reset_locked(&repo, &mut coll_state));
                                return acc.resolve();
                            }
                        }
                    }
                }
                OpKind::Delete => delete_group.push(op.key.clone()),
            }
        }

        // A trailing run of deletes is still pending once the loop ends.
        if let Err(err) =
            flush_delete_group(&repo, &mut coll_state, delete_group, self.continue_on_error)
        {
            acc.push(err);
            if !self.continue_on_error {
                acc.record(coll.reset_locked(&repo, &mut coll_state));
            }
        }

        if acc.has_errors() {
            delete_group.clear();
            return acc.resolve();
        }

        if !ops.is_empty() && coll_state.tree.is_some() {
            let msg = format!("added {} ops in 1 commit", ops.len());
            acc.record(coll.commit_locked(&repo, &mut coll_state, &msg));
        }

        ops.clear();
        delete_group.clear();
        acc.resolve()
    }
}

/// Apply the pending delete group to the collection's staged tree.
///
/// On success the group is cleared and the new tree installed. On failure
/// the staged tree is untouched; with `continue_on_error` the group is
/// still cleared so later adds are not wedged behind it.
fn flush_delete_group(
    repo: &Repository,
    state: &mut CollectionState,
    group: &mut Vec<String>,
    continue_on_error: bool,
) -> StoreResult<()> {
    if group.is_empty() {
        return Ok(());
    }
    let Some(tree_id) = state.tree else {
        let err = StoreError::NotFound(group.join(", "));
        if continue_on_error {
            group.clear();
        }
        return Err(err);
    };
    match tree::tree_remove(repo, tree_id, group) {
        Ok(new_tree) => {
            group.clear();
            state.tree = Some(new_tree);
            Ok(())
        }
        Err(err) => {
            if continue_on_error {
                group.clear();
            }
            Err(err)
        }
    }
}
