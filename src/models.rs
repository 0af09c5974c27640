//! Core domain records: features, issues, worktrees, agent runs and
//! review verdicts.
//!
//! These are plain data types owned by the orchestration engine. Anything
//! with an external audience (audit sink, terminal reports, issue tracker)
//! derives serde so collaborators can consume it as JSON.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::errors::ConfigurationError;

/// Lifecycle status of a feature run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    /// Spec submitted, issues not yet executing.
    #[default]
    Planning,
    /// At least one issue has started.
    InProgress,
    /// All issues closed and the feature branch merged cleanly.
    Completed,
    /// Terminal manual state.
    Archived,
    /// Unrecoverable merge or blocking issue failure.
    Failed,
}

impl FeatureStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Archived | Self::Failed)
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Archived => "archived",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A feature under orchestration. Owned exclusively by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub description: String,
    pub status: FeatureStatus,
    /// Derived: `feature/<name>`.
    pub branch: String,
    pub worktree_path: Option<PathBuf>,
    /// Sub-features reference their parent by name.
    pub parent_feature: Option<String>,
    /// Whether an architecture-planning pass precedes solving.
    pub architecture_mode: bool,
}

impl Feature {
    /// Create a feature in `Planning`. Fails if the name is not kebab-case
    /// within 2..=50 characters.
    pub fn new(name: &str, description: &str) -> Result<Self, ConfigurationError> {
        validate_feature_name(name)?;
        Ok(Self {
            name: name.to_string(),
            description: description.to_string(),
            status: FeatureStatus::Planning,
            branch: feature_branch(name),
            worktree_path: None,
            parent_feature: None,
            architecture_mode: false,
        })
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent_feature = Some(parent.to_string());
        self
    }

    pub fn with_architecture_mode(mut self, enabled: bool) -> Self {
        self.architecture_mode = enabled;
        self
    }
}

/// Branch name for a feature: `feature/<name>`.
pub fn feature_branch(name: &str) -> String {
    format!("feature/{}", name)
}

/// Branch name for one issue of a feature: `feature/<name>-issue-<n>`.
///
/// A nested `feature/<name>/issue-<n>` ref cannot coexist with the
/// `feature/<name>` branch itself (refs are hierarchical), so issue branches
/// extend the feature branch name with a suffix.
pub fn issue_branch(feature: &str, number: u32) -> String {
    format!("feature/{}-issue-{}", feature, number)
}

fn kebab_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("valid regex"))
}

/// Validate the feature-name invariant: kebab-case, 2-50 characters.
pub fn validate_feature_name(name: &str) -> Result<(), ConfigurationError> {
    if name.len() < 2 || name.len() > 50 {
        return Err(ConfigurationError::InvalidFeatureName {
            name: name.to_string(),
            reason: format!("length must be 2-50 characters, got {}", name.len()),
        });
    }
    if !kebab_re().is_match(name) {
        return Err(ConfigurationError::InvalidFeatureName {
            name: name.to_string(),
            reason: "must be kebab-case (lowercase letters, digits, single dashes)".to_string(),
        });
    }
    Ok(())
}

/// Lifecycle status of one issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    #[default]
    Open,
    InProgress,
    Closed,
    Failed,
}

impl IssueStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// A planned issue as produced by the architecture agent (or supplied by the
/// caller). Identity is assigned when the tracker persists it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueSpec {
    pub number: u32,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Ordering key among ready issues.
    #[serde(default)]
    pub step_number: u32,
    /// Issue numbers that must be closed before this one is ready.
    #[serde(default)]
    pub dependencies: Vec<u32>,
}

/// One unit of work inside a feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub number: u32,
    pub title: String,
    pub description: String,
    pub status: IssueStatus,
    pub step_number: u32,
    pub dependencies: Vec<u32>,
    /// Solve attempts consumed so far; capped at `max_attempts`.
    pub attempt_count: u32,
    pub assigned_agent: Option<Uuid>,
    /// Set once a merge artifact exists.
    pub pr_number: Option<u64>,
}

impl Issue {
    pub fn from_spec(spec: IssueSpec) -> Self {
        Self {
            number: spec.number,
            title: spec.title,
            description: spec.description,
            status: IssueStatus::Open,
            step_number: spec.step_number,
            dependencies: spec.dependencies,
            attempt_count: 0,
            assigned_agent: None,
            pr_number: None,
        }
    }
}

/// Dirty-state snapshot of a git worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub path: PathBuf,
    pub branch: String,
    pub feature: String,
    pub is_main: bool,
    /// HEAD SHA; `None` for an unborn branch.
    pub commit: Option<String>,
    pub has_changes: bool,
    pub files_changed: Vec<PathBuf>,
}

/// The kind of agent being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Architecture,
    Solver,
    Reviewer,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Architecture => "architecture",
            Self::Solver => "solver",
            Self::Reviewer => "reviewer",
        };
        write!(f, "{}", s)
    }
}

/// Status of one agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    TimedOut,
}

/// Ephemeral record of one agent invocation. Not persisted beyond the run;
/// surfaced to observers through the audit sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub agent_id: Uuid,
    pub kind: AgentKind,
    pub status: AgentRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl AgentRun {
    pub fn start(kind: AgentKind) -> Self {
        Self {
            agent_id: Uuid::new_v4(),
            kind,
            status: AgentRunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn completed(mut self) -> Self {
        self.status = AgentRunStatus::Completed;
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn failed(mut self, error: &str) -> Self {
        self.status = AgentRunStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.to_string());
        self
    }

    pub fn timed_out(mut self) -> Self {
        self.status = AgentRunStatus::TimedOut;
        self.finished_at = Some(Utc::now());
        self
    }
}

/// A reviewer's decision for one solve attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Approved,
    Rejected,
    NeedsChanges,
}

/// One verdict from one reviewer profile for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub reviewer_profile: String,
    pub attempt_number: u32,
    pub approval: ApprovalStatus,
    /// Free text fed back into the next solve prompt.
    pub feedback: String,
}

/// Terminal outcome of one issue, reported in `FeatureResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueOutcome {
    pub number: u32,
    pub title: String,
    pub status: IssueStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Structured terminal report of a feature run. Every run ends with one of
/// these, never a bare error trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureResult {
    pub feature: String,
    pub status: FeatureStatus,
    pub closed_issues: Vec<u32>,
    pub failed_issues: Vec<u32>,
    pub issues: Vec<IssueOutcome>,
}

impl FeatureResult {
    pub fn is_success(&self) -> bool {
        self.status == FeatureStatus::Completed
    }
}
