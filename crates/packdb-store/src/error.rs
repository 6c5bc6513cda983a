//! Error types for store operations.

use std::fmt;

use git2::Oid;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested key, reference, or database was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// An object exists at the id but is not of the expected kind.
    #[error("object {id} exists but is not a {expected}")]
    WrongKind { id: Oid, expected: &'static str },

    /// The key is empty after normalisation or otherwise unusable.
    #[error("invalid key path: {0:?}")]
    InvalidPath(String),

    /// A reference update lost a race and retries were exhausted.
    #[error("concurrent reference update: {0}")]
    Concurrency(String),

    /// A merge conflict with no "ours" side could not be resolved.
    #[error("unresolved merge conflict at {path:?}")]
    MergeConflict { path: String },

    /// A value could not be encoded to bytes.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error surfaced by the underlying object database.
    #[error("object database error: {0}")]
    Git(#[from] git2::Error),

    /// Multiple errors from a bulk operation or transaction.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Two or more errors collected by an [`ErrorAccumulator`], in the order
/// they occurred.
#[derive(Debug)]
pub struct AggregateError(Vec<StoreError>);

impl AggregateError {
    /// The collected errors, oldest first.
    pub fn errors(&self) -> &[StoreError] {
        &self.0
    }

    /// Number of collected errors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no errors were collected.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred: ", self.0.len())?;
        for (idx, err) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Collects errors from a multi-step operation without aborting it.
///
/// Errors are kept in insertion order. [`resolve`](Self::resolve) collapses
/// the accumulator: no errors yields `Ok(())`, a single error is returned
/// as-is, and two or more become a [`StoreError::Aggregate`].
#[derive(Debug, Default)]
pub struct ErrorAccumulator {
    errors: Vec<StoreError>,
}

impl ErrorAccumulator {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error.
    pub fn push(&mut self, err: StoreError) {
        self.errors.push(err);
    }

    /// Record the error of `result`, if any, and hand back the value.
    pub fn record<T>(&mut self, result: StoreResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.errors.push(err);
                None
            }
        }
    }

    /// Returns `true` if any error has been recorded.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Number of recorded errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns `true` if no error has been recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Iterate over the recorded errors, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &StoreError> {
        self.errors.iter()
    }

    /// Collapse the accumulator into a single result.
    pub fn resolve(mut self) -> StoreResult<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(StoreError::Aggregate(AggregateError(self.errors))),
        }
    }
}
