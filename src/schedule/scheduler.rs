//! Ready-set computation over a feature's issue table.
//!
//! The scheduler owns the issue table while no state machine is running an
//! issue. Readiness is a pure function of the table: an issue is ready iff
//! it is `Open` and every dependency is `Closed`. Ties are ordered by
//! ascending step number (issue number as tiebreak); the orchestrator admits
//! up to its concurrency bound from the front of that ordering.

use std::collections::{BTreeMap, HashSet};

use uuid::Uuid;

use crate::errors::ConfigurationError;
use crate::models::{Issue, IssueStatus};
use crate::schedule::graph::{GraphBuilder, IssueGraph};

#[derive(Debug)]
pub struct IssueScheduler {
    issues: BTreeMap<u32, Issue>,
    graph: IssueGraph,
    closed: HashSet<u32>,
}

impl IssueScheduler {
    /// Build a scheduler over the issue table, validating dependency
    /// feasibility up front.
    pub fn new(issues: Vec<Issue>) -> Result<Self, ConfigurationError> {
        let graph = GraphBuilder::new(&issues).build()?;
        Ok(Self {
            issues: issues.into_iter().map(|i| (i.number, i)).collect(),
            graph,
            closed: HashSet::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn issue(&self, number: u32) -> Option<&Issue> {
        self.issues.get(&number)
    }

    pub fn issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.values()
    }

    /// Issue numbers that are ready to run, ordered by ascending step
    /// number with issue number as tiebreak.
    pub fn ready_set(&self) -> Vec<u32> {
        let mut ready: Vec<&Issue> = self
            .issues
            .values()
            .filter(|i| i.status == IssueStatus::Open)
            .filter(|i| self.graph.dependencies_satisfied(i.number, &self.closed))
            .collect();
        ready.sort_by_key(|i| (i.step_number, i.number));
        ready.iter().map(|i| i.number).collect()
    }

    /// Admit an issue for execution, recording the agent assigned to it.
    pub fn mark_in_progress(&mut self, number: u32, agent: Uuid) {
        if let Some(issue) = self.issues.get_mut(&number) {
            issue.status = IssueStatus::InProgress;
            issue.assigned_agent = Some(agent);
        }
    }

    /// Closing an issue is the only transition that can unblock dependents.
    pub fn mark_closed(&mut self, number: u32, attempts: u32) {
        if let Some(issue) = self.issues.get_mut(&number) {
            issue.status = IssueStatus::Closed;
            issue.attempt_count = attempts;
            self.closed.insert(number);
        }
    }

    pub fn mark_failed(&mut self, number: u32, attempts: u32) {
        if let Some(issue) = self.issues.get_mut(&number) {
            issue.status = IssueStatus::Failed;
            issue.attempt_count = attempts;
        }
    }

    /// Whether every issue reached `Closed` or `Failed`, counting issues
    /// that can never become ready because a dependency failed.
    pub fn all_settled(&self) -> bool {
        self.issues
            .values()
            .all(|i| i.status.is_terminal() || self.is_blocked_by_failure(i.number))
    }

    pub fn all_closed(&self) -> bool {
        self.issues
            .values()
            .all(|i| i.status == IssueStatus::Closed)
    }

    /// Open issues that can never run because a transitive dependency failed.
    pub fn blocked_by_failure(&self) -> Vec<u32> {
        self.issues
            .values()
            .filter(|i| i.status == IssueStatus::Open && self.is_blocked_by_failure(i.number))
            .map(|i| i.number)
            .collect()
    }

    fn is_blocked_by_failure(&self, number: u32) -> bool {
        let failed: Vec<u32> = self
            .issues
            .values()
            .filter(|i| i.status == IssueStatus::Failed)
            .map(|i| i.number)
            .collect();
        failed
            .iter()
            .any(|&f| self.graph.transitive_dependents(f).contains(&number))
    }

    pub fn closed_issues(&self) -> Vec<u32> {
        let mut closed: Vec<u32> = self.closed.iter().copied().collect();
        closed.sort_unstable();
        closed
    }

    pub fn failed_issues(&self) -> Vec<u32> {
        self.issues
            .values()
            .filter(|i| i.status == IssueStatus::Failed)
            .map(|i| i.number)
            .collect()
    }
}
