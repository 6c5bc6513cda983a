//! Repository health states.

/// Coarse health of a repository handle, updated as operations run.
///
/// States record how the last operation left the repository rather than
/// gating further calls; callers that care inspect the state after a
/// failure to decide whether manual intervention is needed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RepositoryState {
    /// No repository exists yet; the path is usable for one.
    #[default]
    New,
    /// The repository could not be opened or probed.
    Degraded,
    /// An operation stopped midway and left work to resolve (e.g. a merge
    /// with conflicts).
    UnresolvedOperation,
    /// An operation failed before touching the repository.
    IncompleteOperation,
    /// An operation failed after touching the repository.
    FailedOperation,
    /// A multi-step operation applied some steps and then stopped.
    PartialOperation,
    /// HEAD does not point at a branch.
    Detached,
    /// The last operation completed normally.
    Healthy,
}

impl std::fmt::Display for RepositoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Degraded => "degraded",
            Self::UnresolvedOperation => "unresolved-operation",
            Self::IncompleteOperation => "incomplete-operation",
            Self::FailedOperation => "failed-operation",
            Self::PartialOperation => "partial-operation",
            Self::Detached => "detached",
            Self::Healthy => "healthy",
        };
        f.write_str(name)
    }
}
