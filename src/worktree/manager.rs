//! Worktree and branch lifecycle for a feature and its issues.
//!
//! The manager owns every composed git operation the engine performs:
//! syncing the base branch, creating the feature branch and its worktree,
//! provisioning one isolated worktree per issue, committing issue work, and
//! merging with a configurable conflict policy. Each issue gets a distinct
//! working tree so concurrent solver agents never share mutable files; git's
//! single-checkout-per-branch invariant is surfaced as `WorktreeConflict`.

use std::path::PathBuf;

use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::{MergePolicy, WorktreeConfig};
use crate::errors::GitOperationError;
use crate::models::{Worktree, feature_branch, issue_branch};
use crate::worktree::git::{GitRunner, MergeOutcome};
use crate::worktree::status;

pub struct WorktreeManager {
    config: WorktreeConfig,
}

impl WorktreeManager {
    pub fn new(config: WorktreeConfig) -> Self {
        Self { config }
    }

    fn main_git(&self) -> GitRunner {
        GitRunner::new(&self.config.main_repo)
    }

    /// Deterministic worktree location for a branch, distinct per issue.
    pub fn worktree_path(&self, branch: &str) -> PathBuf {
        self.config
            .worktrees_dir
            .join(&self.config.project)
            .join(branch.replace('/', "-"))
    }

    pub fn feature_worktree_path(&self, feature: &str) -> PathBuf {
        self.worktree_path(&feature_branch(feature))
    }

    pub fn issue_worktree_path(&self, feature: &str, issue_number: u32) -> PathBuf {
        self.worktree_path(&issue_branch(feature, issue_number))
    }

    /// Fetch and fast-forward the base branch. Local divergence is a
    /// `SyncError`; the base branch is never force-reset. Repositories
    /// without an `origin` remote skip the fetch.
    pub async fn sync_base_branch(&self, base: &str) -> Result<(), GitOperationError> {
        let git = self.main_git();

        if !git.has_remote("origin").await? {
            debug!(base, "No origin remote, skipping base sync");
            if !git.branch_exists(base).await? {
                return Err(GitOperationError::SyncError {
                    branch: base.to_string(),
                    reason: "base branch does not exist locally".to_string(),
                });
            }
            return Ok(());
        }

        git.fetch("origin").await?;

        if git.current_branch().await? == base {
            git.merge_ff_only(&format!("origin/{}", base)).await?;
        } else {
            // Fast-forward the ref without touching the checkout.
            let refspec = format!("{base}:{base}");
            git.run_checked(&["fetch", "origin", &refspec])
                .await
                .map_err(|e| GitOperationError::SyncError {
                    branch: base.to_string(),
                    reason: e.to_string(),
                })?;
        }
        info!(base, "Base branch synced");
        Ok(())
    }

    /// Create `feature/<name>` from `base` if absent. Idempotent: an
    /// existing branch is returned unchanged.
    pub async fn ensure_feature_branch(
        &self,
        feature: &str,
        base: &str,
    ) -> Result<String, GitOperationError> {
        let branch = feature_branch(feature);
        let git = self.main_git();
        if !git.branch_exists(&branch).await? {
            git.create_branch(&branch, base).await?;
            info!(branch = %branch, base, "Created feature branch");
        }
        Ok(branch)
    }

    /// Create a worktree for `branch` at its deterministic path, or return
    /// the existing one. Fails with `WorktreeConflict` if the branch is
    /// checked out elsewhere.
    pub async fn ensure_worktree(
        &self,
        feature: &str,
        branch: &str,
    ) -> Result<Worktree, GitOperationError> {
        let path = self.worktree_path(branch);
        if path.exists() {
            debug!(path = %path.display(), "Worktree already exists");
            return status::snapshot(&path, branch, feature, false);
        }

        let git = self.main_git();
        if git.checked_out_branches().await?.contains(&branch.to_string()) {
            return Err(GitOperationError::WorktreeConflict {
                branch: branch.to_string(),
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        git.worktree_add(&path, branch, None).await?;
        info!(branch = %branch, path = %path.display(), "Created worktree");

        status::snapshot(&path, branch, feature, false)
    }

    /// Create `feature/<name>/issue-<n>` off the feature branch tip inside a
    /// fresh worktree. Returns the branch name and worktree path.
    pub async fn setup_issue_branch(
        &self,
        feature: &str,
        issue_number: u32,
    ) -> Result<(String, PathBuf), GitOperationError> {
        let branch = issue_branch(feature, issue_number);
        let path = self.worktree_path(&branch);

        if path.exists() {
            debug!(branch = %branch, "Issue worktree already exists, reusing");
            return Ok((branch, path));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let git = self.main_git();
        if git.branch_exists(&branch).await? {
            git.worktree_add(&path, &branch, None).await?;
        } else {
            git.worktree_add(&path, &branch, Some(&feature_branch(feature)))
                .await?;
        }
        info!(branch = %branch, path = %path.display(), "Provisioned issue worktree");
        Ok((branch, path))
    }

    /// Stage and commit everything in the issue worktree with a
    /// deterministic message, then push if a remote exists. Returns `false`
    /// without error when there is nothing to commit.
    pub async fn commit_issue_changes(
        &self,
        issue_number: u32,
        title: &str,
        branch: &str,
    ) -> Result<bool, GitOperationError> {
        let git = GitRunner::new(self.worktree_path(branch));
        git.add_all().await?;
        let committed = git.commit(&format!("issue-{}: {}", issue_number, title)).await?;

        if committed && git.has_remote("origin").await? {
            git.push("origin", branch).await?;
        }
        if !committed {
            debug!(branch = %branch, "No changes to commit");
        }
        Ok(committed)
    }

    /// Merge an issue branch into the feature branch inside the feature
    /// worktree: fast-forward when possible, merge commit otherwise.
    /// Conflicts are resolved per file by `policy`; with `Manual` the merge
    /// is aborted and the conflict surfaces as an error.
    pub async fn merge_issue_branch(
        &self,
        branch: &str,
        feature: &str,
        policy: MergePolicy,
    ) -> Result<(), GitOperationError> {
        let git = GitRunner::new(self.feature_worktree_path(feature));
        self.merge_with_policy(&git, branch, policy).await
    }

    /// Merge the feature branch into `base` in the main repository, with the
    /// same conflict policy as issue merges.
    pub async fn merge_feature_branch(
        &self,
        feature: &str,
        base: &str,
        policy: MergePolicy,
    ) -> Result<(), GitOperationError> {
        let git = self.main_git();
        if git.current_branch().await? != base {
            git.checkout(base).await?;
        }
        self.merge_with_policy(&git, &feature_branch(feature), policy)
            .await
    }

    async fn merge_with_policy(
        &self,
        git: &GitRunner,
        branch: &str,
        policy: MergePolicy,
    ) -> Result<(), GitOperationError> {
        let message = format!("Merge {}", branch);
        match git.merge(branch, &message).await? {
            MergeOutcome::Clean => {
                info!(branch = %branch, "Merged cleanly");
                Ok(())
            }
            MergeOutcome::Conflicts(files) => match policy {
                MergePolicy::Manual => {
                    warn!(branch = %branch, files = files.len(), "Merge conflict, aborting (manual policy)");
                    git.merge_abort().await?;
                    Err(GitOperationError::MergeConflict {
                        branch: branch.to_string(),
                        files,
                    })
                }
                MergePolicy::Ours | MergePolicy::Theirs => {
                    let side = if policy == MergePolicy::Ours {
                        "--ours"
                    } else {
                        "--theirs"
                    };
                    info!(branch = %branch, files = files.len(), side, "Resolving merge conflicts by policy");
                    for file in &files {
                        git.take_conflict_side(file, side).await?;
                    }
                    git.commit_merge(&message).await?;
                    Ok(())
                }
            },
        }
    }

    /// Remove an issue worktree (and optionally its branch) after merge or
    /// permanent failure. Aborted issues keep their worktrees for inspection.
    pub async fn remove_issue_worktree(
        &self,
        feature: &str,
        issue_number: u32,
        delete_branch: bool,
    ) -> Result<(), GitOperationError> {
        let branch = issue_branch(feature, issue_number);
        let path = self.worktree_path(&branch);
        if path.exists() {
            self.main_git().worktree_remove(&path).await?;
            info!(branch = %branch, "Removed issue worktree");
        }
        if delete_branch {
            self.main_git().delete_branch(&branch).await?;
        }
        Ok(())
    }

    /// Remove the feature worktree once the feature reaches a terminal
    /// status. The feature branch itself is kept.
    pub async fn cleanup_feature(&self, feature: &str) -> Result<(), GitOperationError> {
        let path = self.feature_worktree_path(feature);
        if path.exists() {
            self.main_git().worktree_remove(&path).await?;
            info!(feature, "Removed feature worktree");
        }
        Ok(())
    }
}
