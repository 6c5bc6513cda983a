//! Repository management by shelling out to the `git` binary.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::{RepoError, RepoResult};
use crate::state::RepositoryState;
use crate::Repository;

/// A repository driven through subprocess invocations of `git`.
///
/// Slower than the direct backend, but behaves exactly the way the
/// command line does, which matters for repositories users also touch by
/// hand and for platforms without libgit2.
pub struct WrappedRepository {
    path: PathBuf,
    branch: String,
    bare: bool,
    exists: bool,
    state: RepositoryState,
    branches: HashSet<String>,
}

impl WrappedRepository {
    /// Probe the repository at `path`.
    ///
    /// A failed probe leaves the handle in the [`Degraded`] or [`New`]
    /// state rather than failing construction, so a subsequent
    /// [`clone_from`](Repository::clone_from) can still populate the path.
    ///
    /// [`Degraded`]: RepositoryState::Degraded
    /// [`New`]: RepositoryState::New
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = expand_home(path.as_ref());
        let mut repo = Self {
            path,
            branch: String::new(),
            bare: false,
            exists: false,
            state: RepositoryState::New,
            branches: HashSet::new(),
        };

        match repo.run_git(["rev-parse", "--is-bare-repository"]) {
            Ok(output) => {
                repo.exists = true;
                repo.bare = output.first().map(String::as_str) == Some("true");
                repo.state = RepositoryState::Healthy;
                repo.update_branch_tracking();
            }
            Err(_) if repo.path.exists() => repo.state = RepositoryState::Degraded,
            Err(_) => repo.state = RepositoryState::New,
        }

        repo
    }

    /// Run `git` with `args` inside the repository, capturing combined
    /// output as trimmed lines.
    fn run_git<I, S>(&self, args: I) -> RepoResult<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let lines: Vec<String> = combined
            .trim_matches(&[' ', '\t', '\n', '\r'][..])
            .lines()
            .map(str::to_string)
            .collect();

        if !output.status.success() {
            return Err(RepoError::Command(lines.join("\n")));
        }
        Ok(lines)
    }

    /// Refresh the cached branch name and branch list.
    fn update_branch_tracking(&mut self) {
        if let Ok(lines) = self.run_git(["symbolic-ref", "--short", "HEAD"]) {
            self.branch = lines.join("\n");
        }
        if let Ok(lines) = self.run_git(["branch", "--list", "--no-color"]) {
            self.branches = lines
                .iter()
                .map(|line| line.trim_start_matches(&[' ', '*', '+'][..]).to_string())
                .filter(|name| !name.is_empty())
                .collect();
        }
        debug!(path = %self.path.display(), "updated branch tracking");
    }

    fn run_tracked<I, S>(&mut self, args: I) -> RepoResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        match self.run_git(args) {
            Ok(_) => {
                self.state = RepositoryState::Healthy;
                Ok(())
            }
            Err(err) => {
                self.state = RepositoryState::FailedOperation;
                Err(err)
            }
        }
    }
}

impl Repository for WrappedRepository {
    fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> RepositoryState {
        self.state
    }

    fn is_bare(&self) -> bool {
        self.bare
    }

    fn exists(&self) -> bool {
        self.exists
    }

    fn branch(&mut self) -> RepoResult<String> {
        self.update_branch_tracking();
        Ok(self.branch.clone())
    }

    fn branch_exists(&mut self, name: &str) -> bool {
        self.update_branch_tracking();
        self.branches.contains(name)
    }

    fn clone_from(&mut self, remote: &str, branch: &str) -> RepoResult<()> {
        if self.exists {
            return Err(RepoError::AlreadyExists(self.path.clone()));
        }
        let parent = self
            .path
            .parent()
            .ok_or_else(|| RepoError::Missing(self.path.clone()))?;
        std::fs::create_dir_all(parent)?;

        let output = Command::new("git")
            .arg("clone")
            .arg(remote)
            .arg("--branch")
            .arg(branch)
            .arg(&self.path)
            .current_dir(parent)
            .output()?;
        if !output.status.success() {
            self.state = RepositoryState::FailedOperation;
            return Err(RepoError::Command(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        self.exists = true;
        self.state = RepositoryState::Healthy;
        self.update_branch_tracking();
        Ok(())
    }

    fn checkout(&mut self, refname: &str) -> RepoResult<()> {
        self.run_tracked(["checkout", refname])?;
        self.update_branch_tracking();
        Ok(())
    }

    fn create_branch(&mut self, name: &str, starting: &str) -> RepoResult<()> {
        if self.branch_exists(name) {
            return Err(RepoError::BranchExists(name.to_string()));
        }
        let result = if starting.is_empty() {
            self.run_tracked(["branch", name])
        } else {
            self.run_tracked(["branch", name, starting])
        };
        self.update_branch_tracking();
        result
    }

    fn remove_branch(&mut self, name: &str) -> RepoResult<()> {
        if !self.branch_exists(name) {
            return Err(RepoError::BranchNotFound(name.to_string()));
        }
        let result = self.run_tracked(["branch", "-D", name]);
        self.update_branch_tracking();
        result
    }

    fn merge(&mut self, base_ref: &str) -> RepoResult<()> {
        self.run_tracked(["merge", base_ref])
    }

    fn reset(&mut self, refname: &str, hard: bool) -> RepoResult<()> {
        if hard {
            self.run_tracked(["reset", "--hard", refname])
        } else {
            self.run_tracked(["reset", refname])
        }
    }

    fn cherry_pick(&mut self, commits: &[&str]) -> RepoResult<()> {
        let mut args = vec!["cherry-pick"];
        args.extend_from_slice(commits);
        self.run_tracked(args)
    }

    fn fetch(&mut self, remote: &str) -> RepoResult<()> {
        if remote == "all" {
            self.run_tracked(["fetch", "--all"])
        } else {
            self.run_tracked(["fetch", remote])
        }
    }

    fn pull(&mut self, remote: &str, branch: &str) -> RepoResult<()> {
        self.run_tracked(["pull", remote, branch])
    }

    fn stage(&mut self, paths: &[&str]) -> RepoResult<()> {
        let mut args = vec!["add", "--"];
        args.extend_from_slice(paths);
        self.run_tracked(args)
    }

    fn stage_all(&mut self) -> RepoResult<()> {
        self.run_tracked(["add", "--all"])
    }

    fn commit(&mut self, message: &str) -> RepoResult<()> {
        self.run_tracked(["commit", "-m", message])
    }

    fn amend(&mut self, message: &str) -> RepoResult<()> {
        self.run_tracked(["commit", "--amend", "-m", message])
    }

    fn push(&mut self, remote: &str, branch: &str) -> RepoResult<()> {
        self.run_tracked(["push", remote, branch])
    }
}

/// Expand a leading `~` to the caller's home directory.
fn expand_home(path: &Path) -> PathBuf {
    let Ok(stripped) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(stripped),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    fn init_repo(dir: &Path) {
        let status = Command::new("git")
            .args(["init", "--initial-branch=main"])
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(status.status.success());
    }

    #[test]
    fn missing_path_probes_as_new() {
        let dir = tempfile::tempdir().unwrap();
        let repo = WrappedRepository::new(dir.path().join("absent"));
        assert!(!repo.exists());
        assert_eq!(repo.state(), RepositoryState::New);
    }

    #[test]
    fn non_repository_directory_probes_as_degraded() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), "contents").unwrap();
        let repo = WrappedRepository::new(dir.path());
        assert!(!repo.exists());
        assert_eq!(repo.state(), RepositoryState::Degraded);
    }

    #[test]
    fn probes_an_existing_repository() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let mut repo = WrappedRepository::new(dir.path());
        assert!(repo.exists());
        assert!(!repo.is_bare());
        assert_eq!(repo.branch().unwrap(), "main");
    }

    #[test]
    fn detects_bare_repositories() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let status = Command::new("git")
            .args(["init", "--bare"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        assert!(status.status.success());

        let repo = WrappedRepository::new(dir.path());
        assert!(repo.exists());
        assert!(repo.is_bare());
    }

    #[test]
    fn clone_into_an_existing_repository_is_refused() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let mut repo = WrappedRepository::new(dir.path());
        let err = repo.clone_from("ignored", "main").unwrap_err();
        assert!(matches!(err, RepoError::AlreadyExists(_)));
    }

    #[test]
    fn home_expansion_only_touches_the_tilde_prefix() {
        assert_eq!(expand_home(Path::new("/a/b")), PathBuf::from("/a/b"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                expand_home(Path::new("~/x")),
                PathBuf::from(home).join("x")
            );
        }
    }
}
