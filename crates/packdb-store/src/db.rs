//! Database handles and the process-wide handle registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use git2::Repository;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::collection::Collection;
use crate::error::{ErrorAccumulator, StoreResult};

/// The registry backing [`Database::open`] and [`Database::remove`].
static GLOBAL_CACHE: Lazy<DatabaseCache> = Lazy::new(DatabaseCache::new);

/// The process-wide database registry.
pub fn global_cache() -> &'static DatabaseCache {
    &GLOBAL_CACHE
}

/// A handle to one object database on disk and the collections over it.
///
/// The repository handle is shared by every collection under this
/// database and serialised by its mutex. Handles are unique per path
/// within a registry: opening the same path twice yields the same
/// instance.
pub struct Database {
    path: PathBuf,
    repo: Mutex<Repository>,
    self_ref: Weak<Database>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

impl Database {
    /// Open (or initialise) the database at `path` through the
    /// process-wide registry.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Arc<Database>> {
        global_cache().open(path)
    }

    /// Drop this database from the process-wide registry.
    ///
    /// A hard remove also deletes the on-disk store. The repository handle
    /// itself is released when the last `Arc` drops.
    pub fn remove(&self, hard: bool) -> StoreResult<()> {
        global_cache().remove(&self.path, hard)
    }

    fn new(path: PathBuf, repo: Repository) -> Arc<Database> {
        Arc::new_cyclic(|self_ref| Database {
            path,
            repo: Mutex::new(repo),
            self_ref: self_ref.clone(),
            collections: RwLock::new(HashMap::new()),
        })
    }

    /// The on-disk location of this database.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock and borrow the underlying repository handle.
    pub(crate) fn repo(&self) -> MutexGuard<'_, Repository> {
        self.repo.lock().expect("repository lock poisoned")
    }

    /// The collection named `name`, created empty if it does not exist.
    ///
    /// A cached collection has its commit pointer refreshed from the
    /// branch tip before it is returned. Concurrent calls for the same
    /// name converge on a single instance.
    pub fn collection(&self, name: &str) -> Arc<Collection> {
        let existing = self
            .collections
            .read()
            .expect("database lock poisoned")
            .get(name)
            .cloned();
        if let Some(coll) = existing {
            if let Err(err) = coll.refresh_commit() {
                debug!(collection = name, %err, "commit refresh skipped");
            }
            return coll;
        }

        // Create outside the map lock; the entry API resolves the race
        // between two creators in favour of whichever inserted first.
        let coll = Collection::create(name, self.self_ref.clone());
        let mut map = self.collections.write().expect("database lock poisoned");
        Arc::clone(map.entry(name.to_string()).or_insert(coll))
    }

    /// Names of the currently known collections.
    ///
    /// The returned iterator is single-use and walks a snapshot taken at
    /// the time of the call; collections created afterwards are not
    /// emitted.
    pub fn list_collections(&self) -> impl Iterator<Item = String> {
        let names: Vec<String> = self
            .collections
            .read()
            .expect("database lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.into_iter()
    }

    /// Number of currently known collections.
    pub fn collection_count(&self) -> usize {
        self.collections
            .read()
            .expect("database lock poisoned")
            .len()
    }

    /// Materialise a collection for every branch not already present.
    pub fn load_collections(&self) -> StoreResult<()> {
        let names: Vec<String> = {
            let repo = self.repo();
            let mut references = repo.references()?;
            references
                .names()
                .filter_map(|name| {
                    name.ok()
                        .and_then(|n| n.strip_prefix("refs/heads/"))
                        .map(str::to_string)
                })
                .collect()
        };

        let mut map = self.collections.write().expect("database lock poisoned");
        for name in names {
            if !map.contains_key(&name) {
                let coll = Collection::create(&name, self.self_ref.clone());
                map.insert(name, coll);
            }
        }
        Ok(())
    }

    fn snapshot_collections(&self) -> Vec<Arc<Collection>> {
        self.collections
            .read()
            .expect("database lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Reset every collection to its branch tip, aggregating failures.
    pub fn update(&self) -> StoreResult<()> {
        let mut acc = ErrorAccumulator::new();
        for coll in self.snapshot_collections() {
            acc.record(coll.reset());
        }
        acc.resolve()
    }

    /// Pull every collection from `url`, aggregating failures.
    pub fn pull(&self, url: &str) -> StoreResult<()> {
        let mut acc = ErrorAccumulator::new();
        for coll in self.snapshot_collections() {
            acc.record(coll.pull(url));
        }
        acc.resolve()
    }

    /// Push every collection to `url`, aggregating failures.
    pub fn push(&self, url: &str) -> StoreResult<()> {
        let mut acc = ErrorAccumulator::new();
        for coll in self.snapshot_collections() {
            acc.record(coll.push(url));
        }
        acc.resolve()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("collections", &self.collection_count())
            .finish()
    }
}

/// A registry mapping store paths to live [`Database`] handles.
///
/// One global instance backs [`Database::open`]; test suites construct
/// their own so registries stay isolated. Paths are compared as given, so
/// callers wanting canonical keys canonicalise before opening.
#[derive(Default)]
pub struct DatabaseCache {
    dbs: Mutex<HashMap<PathBuf, Arc<Database>>>,
}

impl DatabaseCache {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or initialise) the database at `path`.
    ///
    /// A cached handle is returned as-is after re-loading its collections.
    /// Otherwise the repository is opened, or initialised bare (creating
    /// the directory tree first when absent), registered, and loaded.
    pub fn open(&self, path: impl AsRef<Path>) -> StoreResult<Arc<Database>> {
        let path = path.as_ref();
        let mut dbs = self.dbs.lock().expect("cache lock poisoned");
        if let Some(db) = dbs.get(path) {
            let db = Arc::clone(db);
            drop(dbs);
            db.load_collections()?;
            return Ok(db);
        }

        let repo = match Repository::open(path) {
            Ok(repo) => repo,
            Err(open_err) => {
                if !path.exists() {
                    std::fs::create_dir_all(path)?;
                }
                debug!(path = %path.display(), %open_err, "initialising bare store");
                Repository::init_bare(path)?
            }
        };

        let db = Database::new(path.to_path_buf(), repo);
        dbs.insert(path.to_path_buf(), Arc::clone(&db));
        drop(dbs);
        db.load_collections()?;
        Ok(db)
    }

    /// Drop the entry for `path`; a hard remove also deletes the store on
    /// disk.
    pub fn remove(&self, path: impl AsRef<Path>, hard: bool) -> StoreResult<()> {
        let path = path.as_ref();
        let removed = self
            .dbs
            .lock()
            .expect("cache lock poisoned")
            .remove(path);
        if removed.is_none() {
            return Ok(());
        }
        if hard {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    /// Number of registered databases.
    pub fn len(&self) -> usize {
        self.dbs.lock().expect("cache lock poisoned").len()
    }

    /// Returns `true` if no database is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
