//! Thin async wrapper over the `git` CLI, scoped to one working directory.
//!
//! Composed git operations (worktree lifecycle, merges, conflict policy)
//! live in the manager; this runner only executes single commands and maps
//! failures into `GitOperationError`.

use std::path::{Path, PathBuf};
use std::process::Output;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::GitOperationError;

pub struct GitRunner {
    working_dir: PathBuf,
}

/// Outcome of a merge attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Clean,
    Conflicts(Vec<PathBuf>),
}

impl GitRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub async fn run(&self, args: &[&str]) -> Result<Output, GitOperationError> {
        debug!(args = ?args, dir = %self.working_dir.display(), "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = ?args, stderr = %stderr.trim(), "Git command failed");
        }

        Ok(output)
    }

    pub async fn run_checked(&self, args: &[&str]) -> Result<Output, GitOperationError> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(GitOperationError::CommandFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn stdout_checked(&self, args: &[&str]) -> Result<String, GitOperationError> {
        let output = self.run_checked(args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn current_branch(&self) -> Result<String, GitOperationError> {
        self.stdout_checked(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool, GitOperationError> {
        let output = self
            .run(&["rev-parse", "--verify", &format!("refs/heads/{}", branch)])
            .await?;
        Ok(output.status.success())
    }

    pub async fn has_remote(&self, remote: &str) -> Result<bool, GitOperationError> {
        let output = self.run(&["remote", "get-url", remote]).await?;
        Ok(output.status.success())
    }

    pub async fn fetch(&self, remote: &str) -> Result<(), GitOperationError> {
        self.run_checked(&["fetch", remote]).await?;
        Ok(())
    }

    /// Fast-forward-only merge of `upstream` into the current branch.
    pub async fn merge_ff_only(&self, upstream: &str) -> Result<(), GitOperationError> {
        let output = self.run(&["merge", "--ff-only", upstream]).await?;
        if !output.status.success() {
            let current = self.current_branch().await.unwrap_or_default();
            return Err(GitOperationError::SyncError {
                branch: current,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    pub async fn create_branch(&self, branch: &str, start: &str) -> Result<(), GitOperationError> {
        self.run_checked(&["branch", branch, start]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<bool, GitOperationError> {
        let output = self.run(&["branch", "-D", branch]).await?;
        Ok(output.status.success())
    }

    pub async fn checkout(&self, branch: &str) -> Result<(), GitOperationError> {
        self.run_checked(&["checkout", branch]).await?;
        Ok(())
    }

    pub async fn add_all(&self) -> Result<(), GitOperationError> {
        self.run_checked(&["add", "-A"]).await?;
        Ok(())
    }

    /// Commit staged changes. Returns `false` (not an error) when there is
    /// nothing to commit.
    pub async fn commit(&self, message: &str) -> Result<bool, GitOperationError> {
        let output = self.run(&["commit", "-m", message]).await?;
        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
                return Ok(false);
            }
            return Err(GitOperationError::CommandFailed {
                command: format!("commit -m {:?}", message),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(true)
    }

    pub async fn push(&self, remote: &str, branch: &str) -> Result<(), GitOperationError> {
        self.run_checked(&["push", "-u", remote, branch]).await?;
        Ok(())
    }

    /// Merge `branch` into the current branch, fast-forwarding when possible.
    pub async fn merge(
        &self,
        branch: &str,
        message: &str,
    ) -> Result<MergeOutcome, GitOperationError> {
        let output = self.run(&["merge", "-m", message, branch]).await?;
        if output.status.success() {
            return Ok(MergeOutcome::Clean);
        }

        let conflicts = self.conflict_files().await?;
        if conflicts.is_empty() {
            return Err(GitOperationError::CommandFailed {
                command: format!("merge {}", branch),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(MergeOutcome::Conflicts(conflicts))
    }

    /// Paths still in a conflicted (unmerged) state.
    pub async fn conflict_files(&self) -> Result<Vec<PathBuf>, GitOperationError> {
        let stdout = self
            .stdout_checked(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Resolve one conflicted file by taking the named side, then stage it.
    pub async fn take_conflict_side(
        &self,
        path: &Path,
        side: &str,
    ) -> Result<(), GitOperationError> {
        let path_str = path.to_str().ok_or_else(|| GitOperationError::CommandFailed {
            command: "checkout --ours/--theirs".into(),
            stderr: format!("path is not valid UTF-8: {}", path.display()),
        })?;
        self.run_checked(&["checkout", side, "--", path_str]).await?;
        self.run_checked(&["add", "--", path_str]).await?;
        Ok(())
    }

    /// Conclude a conflicted merge after all files were resolved.
    pub async fn commit_merge(&self, message: &str) -> Result<(), GitOperationError> {
        self.run_checked(&["commit", "-m", message]).await?;
        Ok(())
    }

    pub async fn merge_abort(&self) -> Result<(), GitOperationError> {
        self.run_checked(&["merge", "--abort"]).await?;
        Ok(())
    }

    pub async fn worktree_add(
        &self,
        path: &Path,
        branch: &str,
        base: Option<&str>,
    ) -> Result<(), GitOperationError> {
        let path_str = path.to_str().ok_or_else(|| GitOperationError::CommandFailed {
            command: "worktree add".into(),
            stderr: format!("path is not valid UTF-8: {}", path.display()),
        })?;

        let output = match base {
            Some(base) => {
                self.run(&["worktree", "add", "-b", branch, path_str, base])
                    .await?
            }
            None => self.run(&["worktree", "add", path_str, branch]).await?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("already checked out") || stderr.contains("already used by worktree")
            {
                return Err(GitOperationError::WorktreeConflict {
                    branch: branch.to_string(),
                });
            }
            return Err(GitOperationError::CommandFailed {
                command: format!("worktree add {}", branch),
                stderr,
            });
        }
        Ok(())
    }

    pub async fn worktree_remove(&self, path: &Path) -> Result<(), GitOperationError> {
        let path_str = path.to_str().ok_or_else(|| GitOperationError::CommandFailed {
            command: "worktree remove".into(),
            stderr: format!("path is not valid UTF-8: {}", path.display()),
        })?;
        self.run_checked(&["worktree", "remove", "--force", path_str])
            .await?;
        Ok(())
    }

    /// Branches currently checked out in any worktree of this repository.
    pub async fn checked_out_branches(&self) -> Result<Vec<String>, GitOperationError> {
        let stdout = self
            .stdout_checked(&["worktree", "list", "--porcelain"])
            .await?;
        Ok(stdout
            .lines()
            .filter_map(|l| l.strip_prefix("branch refs/heads/"))
            .map(str::to_string)
            .collect())
    }

    /// Number of commits reachable from `branch`.
    pub async fn commit_count(&self, branch: &str) -> Result<u32, GitOperationError> {
        let stdout = self
            .stdout_checked(&["rev-list", "--count", branch])
            .await?;
        stdout
            .parse()
            .map_err(|_| GitOperationError::CommandFailed {
                command: format!("rev-list --count {}", branch),
                stderr: format!("unexpected output: {}", stdout),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    async fn init_repo() -> (GitRunner, TempDir) {
        let dir = tempdir().unwrap();
        let git = GitRunner::new(dir.path());
        git.run_checked(&["init", "-b", "main"]).await.unwrap();
        git.run_checked(&["config", "user.name", "test"]).await.unwrap();
        git.run_checked(&["config", "user.email", "test@test.com"])
            .await
            .unwrap();
        fs::write(dir.path().join("README.md"), "# repo\n").unwrap();
        git.add_all().await.unwrap();
        git.commit("init").await.unwrap();
        (git, dir)
    }

    #[tokio::test]
    async fn commit_returns_false_when_nothing_to_commit() {
        let (git, _dir) = init_repo().await;
        git.add_all().await.unwrap();
        assert!(!git.commit("empty").await.unwrap());
    }

    #[tokio::test]
    async fn branch_create_and_exists() {
        let (git, _dir) = init_repo().await;
        assert!(!git.branch_exists("feature/x").await.unwrap());
        git.create_branch("feature/x", "main").await.unwrap();
        assert!(git.branch_exists("feature/x").await.unwrap());
    }

    #[tokio::test]
    async fn merge_reports_conflicts() {
        let (git, dir) = init_repo().await;
        fs::write(dir.path().join("data.txt"), "base\n").unwrap();
        git.add_all().await.unwrap();
        git.commit("base data").await.unwrap();

        git.run_checked(&["checkout", "-b", "side"]).await.unwrap();
        fs::write(dir.path().join("data.txt"), "side\n").unwrap();
        git.add_all().await.unwrap();
        git.commit("side change").await.unwrap();

        git.checkout("main").await.unwrap();
        fs::write(dir.path().join("data.txt"), "main\n").unwrap();
        git.add_all().await.unwrap();
        git.commit("main change").await.unwrap();

        match git.merge("side", "merge side").await.unwrap() {
            MergeOutcome::Conflicts(files) => {
                assert_eq!(files, vec![PathBuf::from("data.txt")]);
            }
            MergeOutcome::Clean => panic!("expected conflicts"),
        }
        git.merge_abort().await.unwrap();
        assert!(git.conflict_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn merge_fast_forwards_when_possible() {
        let (git, dir) = init_repo().await;
        git.run_checked(&["checkout", "-b", "side"]).await.unwrap();
        fs::write(dir.path().join("new.txt"), "x\n").unwrap();
        git.add_all().await.unwrap();
        git.commit("side add").await.unwrap();

        git.checkout("main").await.unwrap();
        let before = git.commit_count("main").await.unwrap();
        assert_eq!(git.merge("side", "merge side").await.unwrap(), MergeOutcome::Clean);
        // Fast-forward adds no merge commit.
        assert_eq!(git.commit_count("main").await.unwrap(), before + 1);
    }

    #[tokio::test]
    async fn worktree_add_rejects_double_checkout() {
        let (git, dir) = init_repo().await;
        git.create_branch("feature/x", "main").await.unwrap();

        let wt = dir.path().join("wt-x");
        git.worktree_add(&wt, "feature/x", None).await.unwrap();

        let wt2 = dir.path().join("wt-x2");
        let err = git.worktree_add(&wt2, "feature/x", None).await.unwrap_err();
        assert!(matches!(err, GitOperationError::WorktreeConflict { .. }));
    }

    #[tokio::test]
    async fn checked_out_branches_lists_worktrees() {
        let (git, dir) = init_repo().await;
        git.create_branch("feature/y", "main").await.unwrap();
        git.worktree_add(&dir.path().join("wt-y"), "feature/y", None)
            .await
            .unwrap();

        let branches = git.checked_out_branches().await.unwrap();
        assert!(branches.contains(&"main".to_string()));
        assert!(branches.contains(&"feature/y".to_string()));
    }

    #[tokio::test]
    async fn worktree_remove_cleans_up() {
        let (git, dir) = init_repo().await;
        git.create_branch("feature/z", "main").await.unwrap();
        let wt = dir.path().join("wt-z");
        git.worktree_add(&wt, "feature/z", None).await.unwrap();
        assert!(wt.exists());

        git.worktree_remove(&wt).await.unwrap();
        assert!(!wt.exists());
    }
}
