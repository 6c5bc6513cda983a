//! Embedded key-value store backed by a git object database.
//!
//! Keys are paths in an immutable tree, values are blobs, and every batch
//! of writes becomes a commit on a branch. One branch is one
//! [`Collection`]; one repository on disk is one [`Database`]; a
//! process-wide registry guarantees a single handle per path.
//!
//! # Model
//!
//! - [`Database`] — one bare repository plus its collection map. Obtain
//!   handles through [`Database::open`] (or an isolated
//!   [`DatabaseCache`]); equal paths share one instance.
//! - [`Collection`] — a key-value view over `refs/heads/<name>`. Reads
//!   (`get`, [`Collection::snapshot_table_scan`]) run against the current
//!   tree; `reset` re-synchronises with the branch tip.
//! - [`Transaction`] — an ordered batch of add/delete operations applied
//!   atomically: the mutated tree is installed as a single commit via a
//!   compare-and-swap on the branch ref, merging with concurrent writers
//!   when the swap is lost.
//! - [`Value`] — the polymorphic values transactions accept; each variant
//!   has a fixed byte encoding.
//!
//! # Example
//!
//! ```no_run
//! use packdb_store::Database;
//!
//! # fn main() -> Result<(), packdb_store::StoreError> {
//! let db = Database::open("/var/lib/my-store")?;
//! let users = db.collection("users");
//!
//! let txn = users.new_transaction();
//! txn.add("alice/email", "alice@example.com");
//! txn.run()?;
//!
//! assert_eq!(users.get("alice/email")?, b"alice@example.com");
//! # Ok(())
//! # }
//! ```
//!
//! # Design rules
//!
//! 1. Trees are copy-on-write; no mutation touches an existing object.
//! 2. Long-lived state holds object ids, never object handles; handles
//!    are scoped to single calls under the repository lock.
//! 3. Lock order: registry, then database, then collection, then the
//!    repository mutex. Transactions take their own lock first.
//! 4. Bulk operations aggregate failures instead of short-circuiting.

pub mod collection;
pub mod db;
pub mod error;
pub mod scan;
pub mod transaction;
pub mod tree;
pub mod value;

mod commit;

pub use collection::Collection;
pub use db::{global_cache, Database, DatabaseCache};
pub use error::{AggregateError, ErrorAccumulator, StoreError, StoreResult};
pub use scan::{Record, SnapshotScan};
pub use transaction::Transaction;
pub use value::Value;
