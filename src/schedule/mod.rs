//! Dependency-ordered issue scheduling.

mod graph;
mod scheduler;

pub use graph::{GraphBuilder, IssueGraph};
pub use scheduler::IssueScheduler;
