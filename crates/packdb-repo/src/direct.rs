//! Repository management through libgit2.

use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{BranchType, ResetType};
use tracing::debug;

use crate::error::{RepoError, RepoResult};
use crate::state::RepositoryState;
use crate::Repository;

/// A repository driven directly through libgit2.
///
/// Equivalent to the wrapped backend but without subprocess overhead;
/// preferable wherever libgit2 is available.
pub struct DirectRepository {
    path: PathBuf,
    exists: bool,
    state: RepositoryState,
    repo: Option<git2::Repository>,
}

/// A failure plus the health state it leaves the repository in.
struct OpError {
    state: RepositoryState,
    err: RepoError,
}

impl OpError {
    /// The operation failed before touching the repository.
    fn incomplete(err: impl Into<RepoError>) -> Self {
        Self {
            state: RepositoryState::IncompleteOperation,
            err: err.into(),
        }
    }

    /// The operation failed after touching the repository.
    fn failed(err: impl Into<RepoError>) -> Self {
        Self {
            state: RepositoryState::FailedOperation,
            err: err.into(),
        }
    }

    /// The operation stopped midway and left work behind.
    fn unresolved(err: impl Into<RepoError>) -> Self {
        Self {
            state: RepositoryState::UnresolvedOperation,
            err: err.into(),
        }
    }
}

impl DirectRepository {
    /// Discover and open the repository containing `path`.
    ///
    /// When no repository is found the handle stays constructible: an
    /// empty path probes as [`New`], a non-empty one as [`Degraded`].
    ///
    /// [`New`]: RepositoryState::New
    /// [`Degraded`]: RepositoryState::Degraded
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match git2::Repository::discover(path) {
            Ok(repo) => {
                let resolved = repo.path().to_path_buf();
                Self {
                    path: resolved,
                    exists: true,
                    state: RepositoryState::Healthy,
                    repo: Some(repo),
                }
            }
            Err(_) => {
                let occupied = std::fs::read_dir(path)
                    .map(|mut entries| entries.next().is_some())
                    .unwrap_or(false);
                Self {
                    path: path.to_path_buf(),
                    exists: false,
                    state: if occupied {
                        RepositoryState::Degraded
                    } else {
                        RepositoryState::New
                    },
                    repo: None,
                }
            }
        }
    }

    fn repo(&self) -> RepoResult<&git2::Repository> {
        self.repo
            .as_ref()
            .ok_or_else(|| RepoError::Missing(self.path.clone()))
    }

    /// Record the outcome of an operation in the health state.
    fn settle<T>(&mut self, result: Result<T, OpError>) -> RepoResult<T> {
        match result {
            Ok(value) => {
                self.state = RepositoryState::Healthy;
                Ok(value)
            }
            Err(op) => {
                self.state = op.state;
                Err(op.err)
            }
        }
    }
}

impl Repository for DirectRepository {
    fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> RepositoryState {
        self.state
    }

    fn is_bare(&self) -> bool {
        self.repo.as_ref().map(git2::Repository::is_bare).unwrap_or(false)
    }

    fn exists(&self) -> bool {
        self.exists
    }

    fn branch(&mut self) -> RepoResult<String> {
        let name = current_branch(self.repo()?);
        match name {
            Ok(Some(name)) => Ok(name),
            Ok(None) => {
                self.state = RepositoryState::Detached;
                Err(RepoError::Unsupported("HEAD is not on a branch"))
            }
            Err(err) => {
                self.state = RepositoryState::Degraded;
                Err(err.into())
            }
        }
    }

    fn branch_exists(&mut self, name: &str) -> bool {
        self.repo
            .as_ref()
            .is_some_and(|repo| repo.find_branch(name, BranchType::Local).is_ok())
    }

    fn clone_from(&mut self, remote: &str, branch: &str) -> RepoResult<()> {
        if self.exists {
            return Err(RepoError::AlreadyExists(self.path.clone()));
        }
        let mut builder = git2::build::RepoBuilder::new();
        builder.branch(branch);
        match builder.clone(remote, &self.path) {
            Ok(repo) => {
                self.repo = Some(repo);
                self.exists = true;
                self.state = RepositoryState::Healthy;
                Ok(())
            }
            Err(err) => {
                self.state = RepositoryState::FailedOperation;
                Err(err.into())
            }
        }
    }

    fn checkout(&mut self, refname: &str) -> RepoResult<()> {
        if self.is_bare() || !self.exists {
            return Err(RepoError::BareWorkingTree);
        }
        let result = do_checkout(self.repo()?, refname);
        self.settle(result)
    }

    fn create_branch(&mut self, name: &str, starting: &str) -> RepoResult<()> {
        let result = do_create_branch(self.repo()?, name, starting);
        self.settle(result)
    }

    fn remove_branch(&mut self, name: &str) -> RepoResult<()> {
        if !self.branch_exists(name) {
            return Err(RepoError::BranchNotFound(name.to_string()));
        }
        let result = do_remove_branch(self.repo()?, name);
        self.settle(result)
    }

    fn merge(&mut self, base_ref: &str) -> RepoResult<()> {
        let result = do_merge(self.repo()?, base_ref);
        self.settle(result)
    }

    fn reset(&mut self, refname: &str, hard: bool) -> RepoResult<()> {
        let result = do_reset(self.repo()?, refname, hard);
        self.settle(result)
    }

    fn cherry_pick(&mut self, commits: &[&str]) -> RepoResult<()> {
        let result = do_cherry_pick(self.repo()?, commits);
        self.settle(result)
    }

    fn fetch(&mut self, remote: &str) -> RepoResult<()> {
        let result = do_fetch(self.repo()?, remote);
        self.settle(result)
    }

    fn pull(&mut self, remote: &str, branch: &str) -> RepoResult<()> {
        self.fetch(remote)?;
        let tracking = format!("{remote}/{branch}");
        self.merge(&tracking)
    }

    fn stage(&mut self, paths: &[&str]) -> RepoResult<()> {
        let result = do_stage(self.repo()?, paths);
        self.settle(result)
    }

    fn stage_all(&mut self) -> RepoResult<()> {
        let result = do_stage_all(self.repo()?);
        self.settle(result)
    }

    fn commit(&mut self, message: &str) -> RepoResult<()> {
        let result = do_commit(self.repo()?, message);
        self.settle(result)
    }

    fn amend(&mut self, message: &str) -> RepoResult<()> {
        let result = do_amend(self.repo()?, message);
        self.settle(result)
    }

    fn push(&mut self, remote: &str, branch: &str) -> RepoResult<()> {
        let result = do_push(self.repo()?, remote, branch);
        self.settle(result)
    }
}

/// The short name of the branch HEAD points at, `None` when detached.
fn current_branch(repo: &git2::Repository) -> Result<Option<String>, git2::Error> {
    let head = repo.head()?;
    Ok(head.shorthand().map(str::to_string))
}

/// Resolve `name` the way the command line would and return its commit.
fn resolve_commit(repo: &git2::Repository, name: &str) -> Result<git2::Oid, git2::Error> {
    let reference = repo.resolve_reference_from_short_name(name)?;
    Ok(reference.peel_to_commit()?.id())
}

fn commit_signature(repo: &git2::Repository) -> Result<git2::Signature<'static>, git2::Error> {
    match repo.signature() {
        Ok(sig) => Ok(sig),
        // No user.name/user.email configured; fall back to a fixed
        // identity rather than refusing to commit.
        Err(_) => git2::Signature::now("packdb", "packdb"),
    }
}

fn do_checkout(repo: &git2::Repository, refname: &str) -> Result<(), OpError> {
    let commit_id = resolve_commit(repo, refname).map_err(OpError::incomplete)?;
    let commit = repo.find_commit(commit_id).map_err(OpError::incomplete)?;
    let tree = commit.tree().map_err(OpError::incomplete)?;

    let mut opts = CheckoutBuilder::new();
    opts.recreate_missing(true);
    repo.checkout_tree(tree.as_object(), Some(&mut opts))
        .map_err(OpError::unresolved)?;

    // Move HEAD along when the name resolves to a branch.
    if let Ok(reference) = repo.resolve_reference_from_short_name(refname) {
        if reference.is_branch() {
            if let Some(name) = reference.name() {
                let name = name.to_string();
                repo.set_head(&name).map_err(OpError::unresolved)?;
            }
        }
    }
    Ok(())
}

fn do_create_branch(
    repo: &git2::Repository,
    name: &str,
    starting: &str,
) -> Result<(), OpError> {
    let starting = if starting.is_empty() { "HEAD" } else { starting };
    let commit_id = resolve_commit(repo, starting).map_err(OpError::incomplete)?;
    let commit = repo.find_commit(commit_id).map_err(OpError::incomplete)?;
    repo.branch(name, &commit, false).map_err(OpError::failed)?;
    Ok(())
}

fn do_remove_branch(repo: &git2::Repository, name: &str) -> Result<(), OpError> {
    let mut branch = repo
        .find_branch(name, BranchType::Local)
        .map_err(OpError::incomplete)?;
    branch.delete().map_err(OpError::failed)
}

fn do_merge(repo: &git2::Repository, base_ref: &str) -> Result<(), OpError> {
    let their_id = resolve_commit(repo, base_ref).map_err(OpError::incomplete)?;
    let head_id = resolve_commit(repo, "HEAD").map_err(OpError::incomplete)?;
    let ancestor_id = repo
        .merge_base(head_id, their_id)
        .map_err(OpError::incomplete)?;

    let ancestor = tree_of(repo, ancestor_id).map_err(OpError::incomplete)?;
    let ours = tree_of(repo, head_id).map_err(OpError::incomplete)?;
    let theirs = tree_of(repo, their_id).map_err(OpError::incomplete)?;

    let mut index = repo
        .merge_trees(&ancestor, &ours, &theirs, Some(&git2::MergeOptions::new()))
        .map_err(OpError::unresolved)?;
    let mut opts = CheckoutBuilder::new();
    opts.recreate_missing(true);
    repo.checkout_index(Some(&mut index), Some(&mut opts))
        .map_err(OpError::unresolved)?;
    Ok(())
}

fn tree_of(repo: &git2::Repository, commit: git2::Oid) -> Result<git2::Tree<'_>, git2::Error> {
    repo.find_commit(commit)?.tree()
}

fn do_reset(repo: &git2::Repository, refname: &str, hard: bool) -> Result<(), OpError> {
    let commit_id = resolve_commit(repo, refname).map_err(OpError::incomplete)?;
    let target = repo
        .find_object(commit_id, None)
        .map_err(OpError::incomplete)?;
    let kind = if hard { ResetType::Hard } else { ResetType::Mixed };
    repo.reset(&target, kind, None).map_err(OpError::failed)
}

fn do_cherry_pick(repo: &git2::Repository, commits: &[&str]) -> Result<(), OpError> {
    let mut resolved = Vec::with_capacity(commits.len());
    for name in commits {
        resolved.push(resolve_commit(repo, name).map_err(OpError::incomplete)?);
    }

    for (idx, id) in resolved.iter().enumerate() {
        let commit = repo.find_commit(*id).map_err(OpError::incomplete)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.recreate_missing(true);
        let mut opts = git2::CherrypickOptions::new();
        opts.checkout_builder(checkout);
        if let Err(err) = repo.cherrypick(&commit, Some(&mut opts)) {
            return Err(if idx == 0 {
                OpError::failed(err)
            } else {
                OpError {
                    state: RepositoryState::PartialOperation,
                    err: err.into(),
                }
            });
        }
    }
    Ok(())
}

fn do_fetch(repo: &git2::Repository, remote: &str) -> Result<(), OpError> {
    let names: Vec<String> = repo
        .remotes()
        .map_err(OpError::incomplete)?
        .iter()
        .flatten()
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        return Err(OpError::incomplete(RepoError::Unsupported(
            "no remotes defined",
        )));
    }

    let mut failed = false;
    for name in &names {
        if remote != "all" && name != remote {
            continue;
        }
        let mut handle = repo.find_remote(name).map_err(OpError::incomplete)?;
        if let Err(err) = handle.fetch(&[] as &[&str], None, None) {
            debug!(remote = %name, %err, "fetch failed");
            failed = true;
        }
    }
    if failed {
        return Err(OpError {
            state: RepositoryState::PartialOperation,
            err: RepoError::Unsupported("fetch failed for some remotes"),
        });
    }
    Ok(())
}

fn do_stage(repo: &git2::Repository, paths: &[&str]) -> Result<(), OpError> {
    let mut index = repo.index().map_err(OpError::incomplete)?;
    let mut matched = |path: &Path, _spec: &[u8]| {
        debug!(path = %path.display(), "staging");
        0
    };
    index
        .add_all(
            paths.iter().copied(),
            git2::IndexAddOption::DEFAULT,
            Some(&mut matched),
        )
        .map_err(OpError::failed)?;
    index.write().map_err(OpError::failed)
}

fn do_stage_all(repo: &git2::Repository) -> Result<(), OpError> {
    let mut index = repo.index().map_err(OpError::incomplete)?;
    let mut matched = |path: &Path, _spec: &[u8]| {
        debug!(path = %path.display(), "restaging");
        0
    };
    index
        .update_all(["*"], Some(&mut matched))
        .map_err(OpError::failed)?;
    index.write().map_err(OpError::failed)
}

fn do_commit(repo: &git2::Repository, message: &str) -> Result<(), OpError> {
    let signature = commit_signature(repo).map_err(OpError::incomplete)?;
    let mut index = repo.index().map_err(OpError::incomplete)?;
    let tree_id = index.write_tree().map_err(OpError::incomplete)?;
    let tree = repo.find_tree(tree_id).map_err(OpError::incomplete)?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit().map_err(OpError::incomplete)?),
        Err(_) => None,
    };
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

    let id = repo
        .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
        .map_err(OpError::failed)?;
    debug!(commit = %id, "created commit");
    Ok(())
}

fn do_amend(repo: &git2::Repository, message: &str) -> Result<(), OpError> {
    let signature = commit_signature(repo).map_err(OpError::incomplete)?;
    let mut index = repo.index().map_err(OpError::incomplete)?;
    let tree_id = index.write_tree().map_err(OpError::incomplete)?;
    let tree = repo.find_tree(tree_id).map_err(OpError::incomplete)?;

    let head = repo.head().map_err(OpError::incomplete)?;
    let commit = head.peel_to_commit().map_err(OpError::incomplete)?;
    let id = commit
        .amend(
            Some("HEAD"),
            None,
            Some(&signature),
            None,
            Some(message),
            Some(&tree),
        )
        .map_err(OpError::failed)?;
    debug!(commit = %id, "amended commit");
    Ok(())
}

fn do_push(repo: &git2::Repository, remote: &str, branch: &str) -> Result<(), OpError> {
    let refspec = format!("refs/heads/{branch}");
    if repo.find_reference(&refspec).is_err() {
        return Err(OpError::incomplete(RepoError::BranchNotFound(
            branch.to_string(),
        )));
    }
    let mut handle = repo.find_remote(remote).map_err(OpError::incomplete)?;
    handle
        .push(&[refspec.as_str()], None)
        .map_err(OpError::failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A non-bare repository with one commit on its default branch.
    fn seeded_repo() -> (tempfile::TempDir, PathBuf) {
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
    fn empty_directory_probes_as_new() {
        let dir = tempfile::tempdir().unwrap();
        let repo = DirectRepository::new(dir.path());
        assert!(!repo.exists());
        assert_eq!(repo.state(), RepositoryState::New);
    }

    #[test]
    fn occupied_directory_probes_as_degraded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("junk"), "not a repo").unwrap();
        let repo = DirectRepository::new(dir.path());
        assert!(!repo.exists());
        assert_eq!(repo.state(), RepositoryState::Degraded);
    }

    #[test]
    fn discovers_an_existing_repository() {
        let (_dir, path) = seeded_repo();
        let mut repo = DirectRepository::new(&path);
        assert!(repo.exists());
        assert!(!repo.is_bare());
        let branch = repo.branch().unwrap();
        assert!(branch == "main" || branch == "master");
    }

    #[test]
    fn creates_and_removes_branches() {
        let (_dir, path) = seeded_repo();
        let mut repo = DirectRepository::new(&path);

        assert!(!repo.branch_exists("feature"));
        repo.create_branch("feature", "").unwrap();
        assert!(repo.branch_exists("feature"));

        repo.remove_branch("feature").unwrap();
        assert!(!repo.branch_exists("feature"));
    }

    #[test]
    fn removing_a_missing_branch_fails() {
        let (_dir, path) = seeded_repo();
        let mut repo = DirectRepository::new(&path);
        let err = repo.remove_branch("ghost").unwrap_err();
        assert!(matches!(err, RepoError::BranchNotFound(_)));
    }

    #[test]
    fn checkout_switches_branches() {
        let (_dir, path) = seeded_repo();
        let mut repo = DirectRepository::new(&path);
        repo.create_branch("side", "").unwrap();
        repo.checkout("side").unwrap();
        assert_eq!(repo.branch().unwrap(), "side");
    }

    #[test]
    fn checkout_on_a_bare_repository_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        git2::Repository::init_bare(dir.path()).unwrap();
        let mut repo = DirectRepository::new(dir.path());
        assert!(repo.is_bare());
        let err = repo.checkout("main").unwrap_err();
        assert!(matches!(err, RepoError::BareWorkingTree));
    }

    #[test]
    fn stage_and_commit_record_changes() {
        let (dir, path) = seeded_repo();
        let mut repo = DirectRepository::new(&path);

        std::fs::write(dir.path().join("second"), "more").unwrap();
        repo.stage(&["second"]).unwrap();
        repo.commit("add second file").unwrap();

        let git = git2::Repository::open(&path).unwrap();
        let head = git.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.message().unwrap(), "add second file");
        assert_eq!(head.parent_count(), 1);
        assert!(head.tree().unwrap().get_name("second").is_some());
    }

    #[test]
    fn amend_rewrites_the_tip_message() {
        let (_dir, path) = seeded_repo();
        let mut repo = DirectRepository::new(&path);
        repo.amend("rewritten").unwrap();

        let git = git2::Repository::open(&path).unwrap();
        let head = git.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.message().unwrap(), "rewritten");
        assert_eq!(head.parent_count(), 0);
    }

    #[test]
    fn reset_hard_restores_the_tree() {
        let (dir, path) = seeded_repo();
        let mut repo = DirectRepository::new(&path);

        std::fs::write(dir.path().join("file"), "scribbled").unwrap();
        repo.reset("HEAD", true).unwrap();
        let contents = std::fs::read_to_string(dir.path().join("file")).unwrap();
        assert_eq!(contents, "contents");
    }

    #[test]
    fn fetch_without_remotes_is_an_error() {
        let (_dir, path) = seeded_repo();
        let mut repo = DirectRepository::new(&path);
        let err = repo.fetch("origin").unwrap_err();
        assert!(matches!(err, RepoError::Unsupported(_)));
        assert_eq!(repo.state(), RepositoryState::IncompleteOperation);
    }
}
