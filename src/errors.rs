//! Typed error hierarchy for the conductor engine.
//!
//! Three top-level enums cover the three failure classes:
//! - `ConfigurationError`: fatal, surfaced immediately, never retried
//! - `AgentError`: per-invocation failures; retried within the attempt
//!   budget except `Unavailable`, which aborts the whole feature run
//! - `GitOperationError`: never retried automatically; routes the affected
//!   issue or feature to a failed state

use std::path::PathBuf;
use thiserror::Error;

/// Fatal configuration problems detected before or at feature start.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid feature name '{name}': {reason}")]
    InvalidFeatureName { name: String, reason: String },

    #[error("Agent command '{command}' is not available: {reason}")]
    AgentUnavailable { command: String, reason: String },

    #[error("Cycle detected in issue dependencies. Involved issues: {issues:?}")]
    DependencyCycle { issues: Vec<u32> },

    #[error("Unknown dependency #{dependency} in issue #{issue}: no issue with that number exists")]
    UnknownDependency { issue: u32, dependency: u32 },

    #[error("Duplicate issue number: #{number}")]
    DuplicateIssue { number: u32 },

    #[error("Invalid setting '{setting}': {message}")]
    InvalidSetting { setting: String, message: String },
}

/// Failures of a single external agent invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent did not finish within {seconds}s and was killed")]
    TimedOut { seconds: u64 },

    #[error("Agent invocation was cancelled")]
    Cancelled,

    #[error("Agent process exited with code {code}: {stderr}")]
    ProcessFailed { code: i32, stderr: String },

    #[error("Agent exited successfully but produced no output")]
    NoOutput,

    #[error("Failed to spawn agent command '{command}': {source}")]
    Unavailable {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent working directory does not exist: {path}")]
    InvalidWorkingDir { path: PathBuf },
}

impl AgentError {
    /// Whether this failure aborts the whole feature run instead of
    /// consuming a solve attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Failures of a composed git operation (sync, worktree, merge).
#[derive(Debug, Error)]
pub enum GitOperationError {
    #[error("Cannot fast-forward '{branch}': {reason}")]
    SyncError { branch: String, reason: String },

    #[error("Branch '{branch}' is already checked out in another worktree")]
    WorktreeConflict { branch: String },

    #[error("Merge of '{branch}' left {} conflicted file(s): {files:?}", files.len())]
    MergeConflict { branch: String, files: Vec<PathBuf> },

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Repository(#[from] git2::Error),
}

/// Top-level error surfaced by `execute_feature`.
///
/// Issue-level failures are reported inside `FeatureResult`, never through
/// this type; only run-fatal conditions propagate as errors.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Config(#[from] ConfigurationError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Git(#[from] GitOperationError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
