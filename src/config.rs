//! Runtime configuration for a feature run.
//!
//! A `RunConfig` is read once per feature run from whatever provider the
//! caller uses (CLI flags, a config file, a service). The engine never
//! hot-reloads settings mid-run.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigurationError;

/// Default agent timeout (15 minutes).
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 900;

/// Default agent command.
const DEFAULT_AGENT_CMD: &str = "claude";

/// How textual merge conflicts are resolved when merging an issue branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Keep the feature-branch side of each conflicted file.
    Ours,
    /// Keep the issue-branch side of each conflicted file.
    Theirs,
    /// Abort the merge and fail the issue; a human resolves.
    #[default]
    Manual,
}

impl std::fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ours => "ours",
            Self::Theirs => "theirs",
            Self::Manual => "manual",
        };
        write!(f, "{}", s)
    }
}

/// Settings for one feature run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Agent CLI command.
    pub agent_cmd: String,
    /// Extra flags passed to every agent invocation.
    pub agent_args: Vec<String>,
    /// Upper bound on concurrently executing issue state machines.
    pub max_concurrent_tasks: usize,
    /// Approvals needed for an attempt to be accepted.
    pub required_approvals: usize,
    /// One reviewer invocation runs per profile per attempt.
    pub reviewer_profiles: Vec<String>,
    /// Solve attempts per issue before it fails.
    pub max_attempts: u32,
    /// Conflict handling when merging issue branches.
    pub conflict_policy: MergePolicy,
    /// Per agent invocation, not per issue or feature.
    pub agent_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            agent_cmd: std::env::var("CONDUCTOR_AGENT_CMD")
                .unwrap_or_else(|_| DEFAULT_AGENT_CMD.to_string()),
            agent_args: vec![
                "--print".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            max_concurrent_tasks: 2,
            required_approvals: 1,
            reviewer_profiles: vec!["general".to_string()],
            max_attempts: 3,
            conflict_policy: MergePolicy::default(),
            agent_timeout: Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS),
        }
    }
}

impl RunConfig {
    /// Set the agent command.
    pub fn with_agent_cmd(mut self, cmd: &str) -> Self {
        self.agent_cmd = cmd.to_string();
        self
    }

    /// Replace the extra agent flags.
    pub fn with_agent_args(mut self, args: Vec<String>) -> Self {
        self.agent_args = args;
        self
    }

    /// Set the concurrency bound.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Set the approval threshold.
    pub fn with_required_approvals(mut self, required: usize) -> Self {
        self.required_approvals = required;
        self
    }

    /// Replace the reviewer profiles.
    pub fn with_reviewer_profiles(mut self, profiles: Vec<String>) -> Self {
        self.reviewer_profiles = profiles;
        self
    }

    /// Set the per-issue attempt budget.
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set the merge conflict policy.
    pub fn with_conflict_policy(mut self, policy: MergePolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Set the agent timeout.
    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    /// Check cross-field invariants once, at run start.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigurationError::InvalidSetting {
                setting: "max_concurrent_tasks".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigurationError::InvalidSetting {
                setting: "max_attempts".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.reviewer_profiles.is_empty() {
            return Err(ConfigurationError::InvalidSetting {
                setting: "reviewer_profiles".into(),
                message: "at least one reviewer profile is required".into(),
            });
        }
        if self.required_approvals == 0 || self.required_approvals > self.reviewer_profiles.len() {
            return Err(ConfigurationError::InvalidSetting {
                setting: "required_approvals".into(),
                message: format!(
                    "must be between 1 and the number of reviewer profiles ({})",
                    self.reviewer_profiles.len()
                ),
            });
        }
        Ok(())
    }
}

/// Filesystem scope for the worktree manager: one main repository plus a
/// directory that holds all worktrees for a project.
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    pub main_repo: PathBuf,
    pub worktrees_dir: PathBuf,
    pub project: String,
}

impl WorktreeConfig {
    pub fn new(main_repo: PathBuf, project: &str) -> Self {
        let worktrees_dir = main_repo.join(".conductor").join("worktrees");
        Self {
            main_repo,
            worktrees_dir,
            project: project.to_string(),
        }
    }

    pub fn with_worktrees_dir(mut self, dir: PathBuf) -> Self {
        self.worktrees_dir = dir;
        self
    }
}
