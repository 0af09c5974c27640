//! Read-only worktree state snapshots via libgit2.

use std::path::Path;

use git2::{Repository, StatusOptions};

use crate::errors::GitOperationError;
use crate::models::Worktree;

/// Snapshot the current state of a worktree: HEAD SHA plus dirty files.
pub fn snapshot(
    path: &Path,
    branch: &str,
    feature: &str,
    is_main: bool,
) -> Result<Worktree, GitOperationError> {
    let repo = Repository::open(path)?;

    // Unborn branches have no HEAD commit yet.
    let commit = repo
        .head()
        .ok()
        .and_then(|head| head.peel_to_commit().ok())
        .map(|c| c.id().to_string());

    let mut opts = StatusOptions::new();
    opts.include_untracked(true);

    let statuses = repo.statuses(Some(&mut opts))?;
    let files_changed = statuses
        .iter()
        .filter_map(|entry| entry.path().map(|p| p.into()))
        .collect::<Vec<_>>();

    Ok(Worktree {
        path: path.to_path_buf(),
        branch: branch.to_string(),
        feature: feature.to_string(),
        is_main,
        commit,
        has_changes: !files_changed.is_empty(),
        files_changed,
    })
}
