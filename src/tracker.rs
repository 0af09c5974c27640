//! Issue tracker collaborator interface.
//!
//! Orchestration persists planned issues through a tracker and treats its
//! responses as the source of truth for issue identity. The real system
//! plugs a GitHub-backed implementation in here; the in-memory tracker
//! serves tests and offline runs.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::models::{Issue, IssueSpec};

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// All issues recorded for a feature, in creation order.
    async fn list_issues_for_feature(&self, feature: &str) -> Result<Vec<Issue>>;

    /// Persist a planned issue and return its canonical record.
    async fn create_issue(&self, feature: &str, spec: IssueSpec) -> Result<Issue>;
}

/// Tracker backed by process memory.
#[derive(Default)]
pub struct InMemoryTracker {
    issues: Mutex<HashMap<String, Vec<Issue>>>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IssueTracker for InMemoryTracker {
    async fn list_issues_for_feature(&self, feature: &str) -> Result<Vec<Issue>> {
        let issues = self.issues.lock().await;
        Ok(issues.get(feature).cloned().unwrap_or_default())
    }

    async fn create_issue(&self, feature: &str, spec: IssueSpec) -> Result<Issue> {
        let issue = Issue::from_spec(spec);
        let mut issues = self.issues.lock().await;
        issues
            .entry(feature.to_string())
            .or_default()
            .push(issue.clone());
        Ok(issue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(number: u32) -> IssueSpec {
        IssueSpec {
            number,
            title: format!("Issue {}", number),
            description: String::new(),
            step_number: number,
            dependencies: vec![],
        }
    }

    #[tokio::test]
    async fn created_issues_are_listed_in_order() {
        let tracker = InMemoryTracker::new();
        tracker.create_issue("demo", spec(2)).await.unwrap();
        tracker.create_issue("demo", spec(1)).await.unwrap();

        let issues = tracker.list_issues_for_feature("demo").await.unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].number, 2);
        assert_eq!(issues[1].number, 1);
    }

    #[tokio::test]
    async fn features_are_isolated() {
        let tracker = InMemoryTracker::new();
        tracker.create_issue("one", spec(1)).await.unwrap();

        assert!(tracker.list_issues_for_feature("two").await.unwrap().is_empty());
    }
}
