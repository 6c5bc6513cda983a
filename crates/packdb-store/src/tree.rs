//! Pure helpers over the immutable git tree model.
//!
//! Trees are never mutated in place: every mutation builds a new tree from
//! a builder seeded with the old one and returns the new id. Long-lived
//! state holds plain [`Oid`] values; object handles only live inside these
//! functions, so they are released on every exit path.

use std::io::Write;
use std::path::Path;

use git2::{ObjectType, Oid, Repository, TreeBuilder, TreeWalkMode, TreeWalkResult};

use crate::error::{ErrorAccumulator, StoreError, StoreResult};

const MODE_BLOB: i32 = 0o100644;
const MODE_TREE: i32 = 0o040000;

/// Normalise a key into the canonical tree path form.
///
/// Collapses `.` segments and redundant separators, resolves `..`
/// lexically, and strips the leading `/`. The root normalises to `"/"`;
/// every other result is a slash-separated path with no leading slash.
pub fn tree_path(key: &str) -> String {
    let rooted = key.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in key.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        parts.join("/")
    }
}

/// Split a normalised key into its parent (with trailing slash) and leaf.
fn split_key(key: &str) -> (&str, &str) {
    match key.rfind('/') {
        Some(idx) => (&key[..idx + 1], &key[idx + 1..]),
        None => ("", key),
    }
}

fn builder_from<'r>(repo: &'r Repository, base: Option<Oid>) -> StoreResult<TreeBuilder<'r>> {
    match base {
        Some(id) => {
            let tree = repo.find_tree(id)?;
            Ok(repo.treebuilder(Some(&tree))?)
        }
        None => Ok(repo.treebuilder(None)?),
    }
}

/// Translate a lookup failure for `key` into the store taxonomy.
fn map_lookup_err(err: git2::Error, key: &str) -> StoreError {
    if err.code() == git2::ErrorCode::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        err.into()
    }
}

/// Build a tree identical to `base` except that `key` resolves to the
/// object at `value_id`.
///
/// Intermediary subtrees are created as needed. An existing object at the
/// key or any intermediary path is overwritten, except that tree-valued
/// inserts merge into an existing subtree at file granularity (similar to
/// `cp -R`). A `None` value leaves `base` untouched.
///
/// Neither `base` nor any intermediate tree is modified; on error,
/// intermediary objects may be left behind in the object database for a
/// later garbage collection.
pub fn tree_add(
    repo: &Repository,
    base: Option<Oid>,
    key: &str,
    value_id: Option<Oid>,
) -> StoreResult<Option<Oid>> {
    let Some(value_id) = value_id else {
        return Ok(base);
    };
    let key = tree_path(key);
    let (parent, leaf) = split_key(&key);
    let value = repo.find_object(value_id, None)?;

    if !parent.is_empty() && parent != "/" {
        // Multi-component key: build a subtree for the leaf first, then
        // insert it under the parent path.
        let subtree = tree_add(repo, None, leaf, Some(value_id))?;
        return tree_add(repo, base, parent, subtree);
    }

    match value.kind() {
        Some(ObjectType::Blob) => {
            let mut builder = builder_from(repo, base)?;
            builder.insert(leaf, value_id, MODE_BLOB)?;
            Ok(Some(builder.write()?))
        }
        Some(ObjectType::Tree) => {
            // Merge into an existing subtree at the leaf, entry by entry.
            let mut subtree = value_id;
            if let Some(base_id) = base {
                if let Ok(old_subtree) = tree_scope(repo, base_id, leaf) {
                    let incoming = repo.find_tree(value_id)?;
                    let mut merged = Some(old_subtree);
                    for entry in incoming.iter() {
                        let name = entry
                            .name()
                            .ok_or_else(|| {
                                StoreError::InvalidPath(entry.id().to_string())
                            })?
                            .to_string();
                        merged = tree_add(repo, merged, &name, Some(entry.id()))?;
                    }
                    if let Some(id) = merged {
                        subtree = id;
                    }
                }
            }
            if key == "/" {
                return Ok(Some(subtree));
            }
            let mut builder = builder_from(repo, base)?;
            builder.insert(leaf, subtree, MODE_TREE)?;
            Ok(Some(builder.write()?))
        }
        _ => Err(StoreError::WrongKind {
            id: value_id,
            expected: "blob or tree",
        }),
    }
}

/// Build a tree identical to `base` with each name in `keys` removed.
///
/// Every key must name a top-level entry of `base`; nested keys are
/// rejected with [`StoreError::InvalidPath`]. Failures accumulate across
/// all keys and nothing is written when any removal fails, so the caller's
/// `base` id remains the current tree.
pub fn tree_remove(repo: &Repository, base: Oid, keys: &[String]) -> StoreResult<Oid> {
    let tree = repo.find_tree(base)?;
    let mut builder = repo.treebuilder(Some(&tree))?;
    let mut acc = ErrorAccumulator::new();
    for key in keys {
        let name = tree_path(key);
        if name == "/" {
            acc.push(StoreError::InvalidPath(key.clone()));
            continue;
        }
        if name.contains('/') {
            acc.push(StoreError::InvalidPath(key.clone()));
            continue;
        }
        if let Err(err) = builder.remove(&name) {
            acc.push(map_lookup_err(err, &name));
        }
    }
    acc.resolve()?;
    Ok(builder.write()?)
}

/// Fetch the blob contents stored at `key`, by copy.
pub fn tree_get(repo: &Repository, tree: Option<Oid>, key: &str) -> StoreResult<Vec<u8>> {
    let Some(tree_id) = tree else {
        return Err(StoreError::NotFound(key.to_string()));
    };
    let path = tree_path(key);
    if path == "/" {
        return Err(StoreError::InvalidPath(key.to_string()));
    }
    let tree = repo.find_tree(tree_id)?;
    let entry = tree
        .get_path(Path::new(&path))
        .map_err(|err| map_lookup_err(err, key))?;
    let blob = lookup_blob(repo, entry.id())?;
    Ok(blob.content().to_vec())
}

/// List the entry names of the subtree at `key` (`"/"` for the root).
pub fn tree_list(repo: &Repository, tree: Option<Oid>, key: &str) -> StoreResult<Vec<String>> {
    let Some(tree_id) = tree else {
        return Ok(Vec::new());
    };
    let scope = tree_scope(repo, tree_id, key)?;
    let subtree = repo.find_tree(scope)?;
    let mut names = Vec::with_capacity(subtree.len());
    for entry in subtree.iter() {
        let name = entry
            .name()
            .ok_or_else(|| StoreError::InvalidPath(entry.id().to_string()))?;
        names.push(name.to_string());
    }
    Ok(names)
}

/// Walk every descendant entry of the subtree at `key`, invoking `visitor`
/// with the entry's full path and the resolved object.
///
/// An error returned by the visitor aborts the walk and is surfaced to the
/// caller.
pub fn tree_walk<F>(
    repo: &Repository,
    tree: Option<Oid>,
    key: &str,
    mut visitor: F,
) -> StoreResult<()>
where
    F: FnMut(&str, &git2::Object<'_>) -> StoreResult<()>,
{
    let Some(tree_id) = tree else {
        return Err(StoreError::NotFound("no tree to walk".to_string()));
    };
    let scope = tree_scope(repo, tree_id, key)?;
    let subtree = repo.find_tree(scope)?;

    let mut visitor_err: Option<StoreError> = None;
    let walked = subtree.walk(TreeWalkMode::PreOrder, |root, entry| {
        let Some(name) = entry.name() else {
            visitor_err = Some(StoreError::InvalidPath(entry.id().to_string()));
            return TreeWalkResult::Abort;
        };
        let path = format!("{root}{name}");
        match repo.find_object(entry.id(), None) {
            Ok(object) => match visitor(&path, &object) {
                Ok(()) => TreeWalkResult::Ok,
                Err(err) => {
                    visitor_err = Some(err);
                    TreeWalkResult::Abort
                }
            },
            Err(err) => {
                visitor_err = Some(err.into());
                TreeWalkResult::Abort
            }
        }
    });
    if let Some(err) = visitor_err {
        return Err(err);
    }
    walked?;
    Ok(())
}

/// Write a human-readable listing of the subtree at `key` to `dst`.
///
/// Subtrees print as `path/`, blobs as `path = contents`.
pub fn tree_dump<W: Write>(
    repo: &Repository,
    tree: Option<Oid>,
    key: &str,
    dst: &mut W,
) -> StoreResult<()> {
    tree_walk(repo, tree, key, |path, object| {
        match object.kind() {
            Some(ObjectType::Tree) => writeln!(dst, "{path}/")?,
            Some(ObjectType::Blob) => {
                let blob = object.as_blob().ok_or(StoreError::WrongKind {
                    id: object.id(),
                    expected: "blob",
                })?;
                write!(dst, "{path} = ")?;
                dst.write_all(blob.content())?;
                writeln!(dst)?;
            }
            _ => {}
        }
        Ok(())
    })
}

/// Resolve the subtree of `tree` at `name`, verifying it is a tree.
///
/// `"/"` resolves to `tree` itself.
pub fn tree_scope(repo: &Repository, tree: Oid, name: &str) -> StoreResult<Oid> {
    let name = tree_path(name);
    if name == "/" {
        repo.find_tree(tree)?;
        return Ok(tree);
    }
    let base = repo.find_tree(tree)?;
    let entry = base
        .get_path(Path::new(&name))
        .map_err(|err| map_lookup_err(err, &name))?;
    let subtree = lookup_tree(repo, entry.id())?;
    Ok(subtree.id())
}

/// The id of the canonical empty tree.
pub fn empty_tree(repo: &Repository) -> StoreResult<Oid> {
    let mut builder = repo.treebuilder(None)?;
    Ok(builder.write()?)
}

/// Look up `id` as a tree, failing with [`StoreError::WrongKind`] when the
/// object is something else.
pub(crate) fn lookup_tree(repo: &Repository, id: Oid) -> StoreResult<git2::Tree<'_>> {
    repo.find_object(id, None)?
        .into_tree()
        .map_err(|_| StoreError::WrongKind { id, expected: "tree" })
}

/// Look up `id` as a blob, failing with [`StoreError::WrongKind`] when the
/// object is something else.
pub(crate) fn lookup_blob(repo: &Repository, id: Oid) -> StoreResult<git2::Blob<'_>> {
    repo.find_object(id, None)?
        .into_blob()
        .map_err(|_| StoreError::WrongKind { id, expected: "blob" })
}

/// Look up `id` as a commit, failing with [`StoreError::WrongKind`] when
/// the object is something else.
pub(crate) fn lookup_commit(repo: &Repository, id: Oid) -> StoreResult<git2::Commit<'_>> {
    repo.find_object(id, None)?
        .into_commit()
        .map_err(|_| StoreError::WrongKind { id, expected: "commit" })
}

/// The commit currently referenced by `refname`, or `None` when the
/// reference is missing, symbolic, or does not point at a commit.
pub(crate) fn lookup_tip(repo: &Repository, refname: &str) -> Option<Oid> {
    let reference = repo.find_reference(refname).ok()?;
    let target = reference.target()?;
    lookup_commit(repo, target).ok()?;
    Some(target)
}
