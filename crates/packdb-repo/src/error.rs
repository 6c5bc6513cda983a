//! Error types for repository management operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while managing a repository.
#[derive(Debug, Error)]
pub enum RepoError {
    /// A repository already exists where one would be created.
    #[error("repository already exists at {0}")]
    AlreadyExists(PathBuf),

    /// No repository exists at the path.
    #[error("no repository at {0}")]
    Missing(PathBuf),

    /// The named branch does not exist.
    #[error("branch not found: {0}")]
    BranchNotFound(String),

    /// A branch with this name already exists.
    #[error("branch already exists: {0}")]
    BranchExists(String),

    /// The operation needs a working tree and the repository is bare.
    #[error("cannot modify the working tree of a bare repository")]
    BareWorkingTree,

    /// The backend does not support this operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// The `git` binary exited unsuccessfully.
    #[error("git command failed: {0}")]
    Command(String),

    /// Error surfaced by libgit2.
    #[error(transparent)]
    Git(#[from] git2::Error),

    /// I/O error spawning the `git` binary or touching the filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for repository operations.
pub type RepoResult<T> = Result<T, RepoError>;
