//! Dependency graph over a feature's issues.
//!
//! The builder validates the issue table once at feature start: every
//! dependency must reference an existing issue, numbers must be unique, and
//! the graph must be acyclic (checked with Kahn's algorithm). A feature with
//! an infeasible graph is rejected before any agent runs.

use std::collections::{HashMap, HashSet};

use crate::errors::ConfigurationError;
use crate::models::Issue;

/// A validated, acyclic dependency graph keyed by issue number.
#[derive(Debug)]
pub struct IssueGraph {
    numbers: Vec<u32>,
    /// number -> issues that depend on it
    dependents: HashMap<u32, Vec<u32>>,
    /// number -> issues it depends on
    dependencies: HashMap<u32, Vec<u32>>,
}

impl IssueGraph {
    pub fn len(&self) -> usize {
        self.numbers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.numbers.is_empty()
    }

    pub fn contains(&self, number: u32) -> bool {
        self.dependencies.contains_key(&number)
    }

    /// Issues that `number` depends on.
    pub fn dependencies(&self, number: u32) -> &[u32] {
        self.dependencies.get(&number).map_or(&[], |v| v.as_slice())
    }

    /// Issues that depend on `number`.
    pub fn dependents(&self, number: u32) -> &[u32] {
        self.dependents.get(&number).map_or(&[], |v| v.as_slice())
    }

    /// Whether every dependency of `number` is in `closed`.
    pub fn dependencies_satisfied(&self, number: u32, closed: &HashSet<u32>) -> bool {
        self.dependencies(number).iter().all(|d| closed.contains(d))
    }

    /// All issues reachable downstream of `number` (transitive dependents).
    pub fn transitive_dependents(&self, number: u32) -> HashSet<u32> {
        let mut seen = HashSet::new();
        let mut stack = vec![number];
        while let Some(n) = stack.pop() {
            for &dep in self.dependents(n) {
                if seen.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        seen
    }
}

/// Builds and validates an [`IssueGraph`].
pub struct GraphBuilder<'a> {
    issues: &'a [Issue],
}

impl<'a> GraphBuilder<'a> {
    pub fn new(issues: &'a [Issue]) -> Self {
        Self { issues }
    }

    pub fn build(self) -> Result<IssueGraph, ConfigurationError> {
        let mut numbers = Vec::with_capacity(self.issues.len());
        let mut dependencies: HashMap<u32, Vec<u32>> = HashMap::new();

        for issue in self.issues {
            if dependencies.contains_key(&issue.number) {
                return Err(ConfigurationError::DuplicateIssue {
                    number: issue.number,
                });
            }
            numbers.push(issue.number);
            dependencies.insert(issue.number, issue.dependencies.clone());
        }

        let mut dependents: HashMap<u32, Vec<u32>> = HashMap::new();
        for issue in self.issues {
            for &dep in &issue.dependencies {
                if !dependencies.contains_key(&dep) {
                    return Err(ConfigurationError::UnknownDependency {
                        issue: issue.number,
                        dependency: dep,
                    });
                }
                dependents.entry(dep).or_default().push(issue.number);
            }
        }

        let graph = IssueGraph {
            numbers,
            dependents,
            dependencies,
        };
        Self::check_acyclic(&graph)?;
        Ok(graph)
    }

    /// Kahn's algorithm; leftover in-degrees mark the cycle members.
    fn check_acyclic(graph: &IssueGraph) -> Result<(), ConfigurationError> {
        let mut in_degree: HashMap<u32, usize> = graph
            .numbers
            .iter()
            .map(|&n| (n, graph.dependencies(n).len()))
            .collect();

        let mut queue: Vec<u32> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&n, _)| n)
            .collect();

        let mut processed = 0;
        while let Some(n) = queue.pop() {
            processed += 1;
            for &dependent in graph.dependents(n) {
                let deg = in_degree.entry(dependent).or_insert(0);
                *deg -= 1;
                if *deg == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let mut cycle: Vec<u32> = in_degree
                .into_iter()
                .filter(|&(_, deg)| deg > 0)
                .map(|(n, _)| n)
                .collect();
            cycle.sort_unstable();
            return Err(ConfigurationError::DependencyCycle { issues: cycle });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Issue, IssueSpec};

    fn issue(number: u32, deps: Vec<u32>) -> Issue {
        Issue::from_spec(IssueSpec {
            number,
            title: format!("Issue {}", number),
            description: String::new(),
            step_number: number,
            dependencies: deps,
        })
    }

    #[test]
    fn builds_simple_graph() {
        let issues = vec![
            issue(1, vec![]),
            issue(2, vec![1]),
            issue(3, vec![1]),
            issue(4, vec![2, 3]),
        ];
        let graph = GraphBuilder::new(&issues).build().unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.dependencies(4), &[2, 3]);
        assert!(graph.dependents(1).contains(&2));
        assert!(graph.dependents(1).contains(&3));
    }

    #[test]
    fn detects_cycle() {
        let issues = vec![issue(1, vec![3]), issue(2, vec![1]), issue(3, vec![2])];
        let err = GraphBuilder::new(&issues).build().unwrap_err();
        match err {
            ConfigurationError::DependencyCycle { issues } => {
                assert_eq!(issues, vec![1, 2, 3]);
            }
            other => panic!("Expected DependencyCycle, got {:?}", other),
        }
    }

    #[test]
    fn detects_self_dependency() {
        let issues = vec![issue(1, vec![1])];
        assert!(matches!(
            GraphBuilder::new(&issues).build(),
            Err(ConfigurationError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn detects_unknown_dependency() {
        let issues = vec![issue(1, vec![9])];
        assert!(matches!(
            GraphBuilder::new(&issues).build(),
            Err(ConfigurationError::UnknownDependency {
                issue: 1,
                dependency: 9
            })
        ));
    }

    #[test]
    fn detects_duplicate_numbers() {
        let issues = vec![issue(1, vec![]), issue(1, vec![])];
        assert!(matches!(
            GraphBuilder::new(&issues).build(),
            Err(ConfigurationError::DuplicateIssue { number: 1 })
        ));
    }

    #[test]
    fn empty_graph_is_valid() {
        let graph = GraphBuilder::new(&[]).build().unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn dependencies_satisfied_tracks_closures() {
        let issues = vec![issue(1, vec![]), issue(2, vec![1]), issue(3, vec![1, 2])];
        let graph = GraphBuilder::new(&issues).build().unwrap();
        let mut closed = HashSet::new();

        assert!(graph.dependencies_satisfied(1, &closed));
        assert!(!graph.dependencies_satisfied(2, &closed));

        closed.insert(1);
        assert!(graph.dependencies_satisfied(2, &closed));
        assert!(!graph.dependencies_satisfied(3, &closed));

        closed.insert(2);
        assert!(graph.dependencies_satisfied(3, &closed));
    }

    #[test]
    fn transitive_dependents_cover_the_chain() {
        let issues = vec![issue(1, vec![]), issue(2, vec![1]), issue(3, vec![2])];
        let graph = GraphBuilder::new(&issues).build().unwrap();
        let downstream = graph.transitive_dependents(1);
        assert!(downstream.contains(&2));
        assert!(downstream.contains(&3));
        assert!(!downstream.contains(&1));
    }
}
