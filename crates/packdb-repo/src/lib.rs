//! High-level repository management.
//!
//! Two interchangeable backends implement the [`Repository`] trait: one
//! shells out to the `git` binary ([`WrappedRepository`]), one drives
//! libgit2 directly ([`DirectRepository`]). The direct backend is usually
//! preferable for speed; the wrapped one behaves exactly like the command
//! line and works where libgit2 is unavailable.
//!
//! Most callers want a [`RepositoryManager`], which wraps either backend
//! with the common multi-step compositions.

use std::path::Path;

pub mod direct;
pub mod error;
pub mod state;
pub mod wrapped;

pub use direct::DirectRepository;
pub use error::{RepoError, RepoResult};
pub use state::RepositoryState;
pub use wrapped::WrappedRepository;

/// Abstract operations on a single repository.
///
/// These are deliberately analogous to the command-line operations a user
/// performs during normal development, so client code never needs to know
/// which backend it is holding.
pub trait Repository {
    /// Location of the repository.
    fn path(&self) -> &Path;

    /// Health left behind by the most recent operation.
    fn state(&self) -> RepositoryState;

    /// Returns `true` if the repository has no working tree.
    fn is_bare(&self) -> bool;

    /// Returns `true` if a repository exists at the path.
    fn exists(&self) -> bool;

    /// The currently checked-out branch.
    fn branch(&mut self) -> RepoResult<String>;

    /// Returns `true` if a local branch named `name` exists.
    fn branch_exists(&mut self, name: &str) -> bool;

    /// Clone `branch` of `remote` into the path.
    fn clone_from(&mut self, remote: &str, branch: &str) -> RepoResult<()>;

    /// Check out the tree at `refname`.
    fn checkout(&mut self, refname: &str) -> RepoResult<()>;

    /// Create a branch at `starting` (empty means `HEAD`).
    fn create_branch(&mut self, name: &str, starting: &str) -> RepoResult<()>;

    /// Delete a local branch.
    fn remove_branch(&mut self, name: &str) -> RepoResult<()>;

    /// Merge `base_ref` into the current branch.
    fn merge(&mut self, base_ref: &str) -> RepoResult<()>;

    /// Reset to `refname`; a hard reset also rewrites the working tree.
    fn reset(&mut self, refname: &str, hard: bool) -> RepoResult<()>;

    /// Apply the named commits onto the current branch.
    fn cherry_pick(&mut self, commits: &[&str]) -> RepoResult<()>;

    /// Fetch from `remote` (`"all"` fetches every remote).
    fn fetch(&mut self, remote: &str) -> RepoResult<()>;

    /// Fetch `remote` and merge `remote/branch`.
    fn pull(&mut self, remote: &str, branch: &str) -> RepoResult<()>;

    /// Stage the given pathspecs.
    fn stage(&mut self, paths: &[&str]) -> RepoResult<()>;

    /// Re-stage everything already tracked.
    fn stage_all(&mut self) -> RepoResult<()>;

    /// Commit the staged index.
    fn commit(&mut self, message: &str) -> RepoResult<()>;

    /// Rewrite the tip commit with the staged index and `message`.
    fn amend(&mut self, message: &str) -> RepoResult<()>;

    /// Push `branch` to `remote`.
    fn push(&mut self, remote: &str, branch: &str) -> RepoResult<()>;
}

/// A [`Repository`] plus the common multi-step compositions.
pub struct RepositoryManager<R> {
    repo: R,
}

impl RepositoryManager<WrappedRepository> {
    /// A manager backed by subprocess calls to the `git` binary.
    pub fn wrapped(path: impl AsRef<Path>) -> Self {
        Self::new(WrappedRepository::new(path))
    }
}

impl RepositoryManager<DirectRepository> {
    /// A manager backed by libgit2.
    pub fn direct(path: impl AsRef<Path>) -> Self {
        Self::new(DirectRepository::new(path))
    }
}

impl<R: Repository> RepositoryManager<R> {
    /// Wrap an existing backend.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Clone the `master` branch of `remote`.
    pub fn clone_default(&mut self, remote: &str) -> RepoResult<()> {
        self.repo.clone_from(remote, "master")
    }

    /// Hard-reset to `HEAD`.
    pub fn reset_head_hard(&mut self) -> RepoResult<()> {
        self.repo.reset("HEAD", true)
    }

    /// Reset the index to `HEAD`, leaving the working tree alone.
    pub fn reset_head(&mut self) -> RepoResult<()> {
        self.repo.reset("HEAD", false)
    }

    /// Check out `branch`, creating it at `starting` when missing.
    pub fn checkout_branch(&mut self, branch: &str, starting: &str) -> RepoResult<()> {
        if self.repo.is_bare() {
            return Err(RepoError::BareWorkingTree);
        }
        if !self.repo.exists() {
            return Err(RepoError::Missing(self.repo.path().to_path_buf()));
        }
        if !self.repo.branch_exists(branch) {
            self.repo.create_branch(branch, starting)?;
        }
        self.repo.checkout(branch)
    }

    /// Create `branch` tracking `remote/tracking` and check it out.
    pub fn create_tracking_branch(
        &mut self,
        branch: &str,
        remote: &str,
        tracking: &str,
    ) -> RepoResult<()> {
        if self.repo.branch_exists(branch) {
            return Err(RepoError::BranchExists(branch.to_string()));
        }
        let starting = format!("{remote}/{tracking}");
        self.checkout_branch(branch, &starting)
    }
}

impl<R> std::ops::Deref for RepositoryManager<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.repo
    }
}

impl<R> std::ops::DerefMut for RepositoryManager<R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.repo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_repo() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        let sig = git2::Signature::now("t", "t@example.com").unwrap();
        let tree_id = {
            let mut index = repo.index().unwrap();
            std::fs::write(dir.path().join("file"), "contents").unwrap();
            index.add_path(Path::new("file")).unwrap();
            index.write().unwrap();
            index.write_tree().unwrap()
        };
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "seed", &tree, &[])
            .unwrap();
        let path = dir.path().to_path_buf();
        (dir, path)
    }

    #[test]
    fn checkout_branch_creates_missing_branches() {
        let (_dir, path) = seeded_repo();
        let mut manager = RepositoryManager::direct(&path);
        manager.checkout_branch("feature", "").unwrap();
        assert_eq!(manager.branch().unwrap(), "feature");

        // A second checkout finds the branch already present.
        manager.checkout_branch("feature", "").unwrap();
        assert_eq!(manager.branch().unwrap(), "feature");
    }

    #[test]
    fn checkout_branch_refuses_missing_repositories() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = RepositoryManager::direct(dir.path());
        let err = manager.checkout_branch("any", "").unwrap_err();
        assert!(matches!(err, RepoError::Missing(_)));
    }

    #[test]
    fn tracking_branch_refuses_existing_names() {
        let (_dir, path) = seeded_repo();
        let mut manager = RepositoryManager::direct(&path);
        manager.checkout_branch("taken", "").unwrap();
        let err = manager
            .create_tracking_branch("taken", "origin", "main")
            .unwrap_err();
        assert!(matches!(err, RepoError::BranchExists(_)));
    }

    #[test]
    fn manager_exposes_the_backend() {
        let (_dir, path) = seeded_repo();
        let manager = RepositoryManager::direct(&path);
        assert!(manager.exists());
        assert!(!manager.is_bare());
    }
}
