//! Feature orchestration: the top-level driver over scheduler, state
//! machines and the worktree manager.

mod runner;

pub use runner::{FeatureSpec, Orchestrator};
