//! Per-issue solve/review state machine.
//!
//! Each admitted issue runs one of these to a terminal state:
//!
//! ```text
//! Pending -> Solving -> Reviewing -> Approved -> Merging -> Closed
//!                 ^          |
//!                 +- ChangesRequested (attempt budget permitting)
//!                            |
//!                            +-> Failed
//! ```
//!
//! Agent-level failures (process failure, timeout, empty output) consume an
//! attempt exactly like a changes-requested round. `Unavailable` aborts the
//! whole feature run. Merge failures go straight to `Failed`; re-prompting
//! the same agent cannot address a conflict, so a human must intervene.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agent::AgentInvoker;
use crate::agent::prompts::{self, SolverVars};
use crate::audit::{AuditEvent, AuditHandle};
use crate::config::RunConfig;
use crate::errors::{AgentError, OrchestrationError};
use crate::models::{AgentKind, AgentRun, Issue};
use crate::review::{AttemptDecision, combine_feedback, decide_attempt};
use crate::worktree::WorktreeManager;

/// Shared collaborators handed to every issue state machine of one feature
/// run. Merges into the feature branch and worktree create/remove are the
/// only cross-issue critical sections, guarded by the two locks.
#[derive(Clone)]
pub struct IssueContext {
    pub feature: String,
    pub base_branch: String,
    pub config: Arc<RunConfig>,
    pub invoker: Arc<AgentInvoker>,
    pub worktrees: Arc<WorktreeManager>,
    pub audit: AuditHandle,
    pub merge_lock: Arc<Mutex<()>>,
    pub worktree_lock: Arc<Mutex<()>>,
}

/// Terminal state of one issue state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueTerminal {
    Closed {
        attempts: u32,
    },
    Failed {
        attempts: u32,
        reason: String,
        /// Worktrees of conflicted or cancelled issues are retained as
        /// failure evidence.
        retained_worktree: bool,
    },
}

impl IssueTerminal {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Closed { attempts } | Self::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Drive one issue from `Pending` to a terminal state.
///
/// Issue-level failures are a normal `Ok` outcome; only run-fatal
/// conditions (agent unavailable) surface as errors.
pub async fn run_issue(
    ctx: &IssueContext,
    issue: &Issue,
) -> Result<IssueTerminal, OrchestrationError> {
    let (branch, worktree_path) = match provision_worktree(ctx, issue).await {
        Ok(provisioned) => provisioned,
        Err(e) => {
            warn!(issue = issue.number, error = %e, "Worktree provisioning failed");
            return Ok(IssueTerminal::Failed {
                attempts: 0,
                reason: e.to_string(),
                retained_worktree: false,
            });
        }
    };

    let mut attempts = 0u32;
    let mut feedback = String::new();

    loop {
        let attempt_number = attempts + 1;
        info!(
            issue = issue.number,
            attempt = attempt_number,
            max = ctx.config.max_attempts,
            "Solving"
        );

        match solve_once(ctx, issue, &worktree_path, attempt_number, &feedback).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(AgentError::Cancelled) => {
                return Ok(IssueTerminal::Failed {
                    attempts: attempt_number,
                    reason: "cancelled".to_string(),
                    retained_worktree: true,
                });
            }
            Err(e) => {
                // Consumes an attempt exactly like a rejected review.
                warn!(issue = issue.number, attempt = attempt_number, error = %e, "Solver failed");
                attempts = attempt_number;
                if attempts >= ctx.config.max_attempts {
                    retire_worktree(ctx, issue).await;
                    return Ok(IssueTerminal::Failed {
                        attempts,
                        reason: format!("attempts exhausted; last solver error: {}", e),
                        retained_worktree: false,
                    });
                }
                continue;
            }
        }

        if let Err(e) = ctx
            .worktrees
            .commit_issue_changes(issue.number, &issue.title, &branch)
            .await
        {
            // Git failures are never retried.
            return Ok(IssueTerminal::Failed {
                attempts: attempt_number,
                reason: e.to_string(),
                retained_worktree: true,
            });
        }

        let verdicts = match review_round(ctx, issue, &worktree_path, attempt_number).await {
            Ok(verdicts) => verdicts,
            Err(ReviewRoundAbort::Fatal(e)) => return Err(e),
            Err(ReviewRoundAbort::Cancelled) => {
                return Ok(IssueTerminal::Failed {
                    attempts: attempt_number,
                    reason: "cancelled".to_string(),
                    retained_worktree: true,
                });
            }
        };

        match decide_attempt(&verdicts, ctx.config.required_approvals) {
            AttemptDecision::Accepted => {
                info!(issue = issue.number, attempt = attempt_number, "Approved, merging");
                let merge_result = {
                    let _exclusive = ctx.merge_lock.lock().await;
                    ctx.worktrees
                        .merge_issue_branch(&branch, &ctx.feature, ctx.config.conflict_policy)
                        .await
                };
                return match merge_result {
                    Ok(()) => {
                        retire_worktree(ctx, issue).await;
                        Ok(IssueTerminal::Closed {
                            attempts: attempt_number,
                        })
                    }
                    Err(e) => {
                        warn!(issue = issue.number, error = %e, "Merge failed, issue requires intervention");
                        Ok(IssueTerminal::Failed {
                            attempts: attempt_number,
                            reason: e.to_string(),
                            retained_worktree: true,
                        })
                    }
                };
            }
            AttemptDecision::ChangesRequested => {
                attempts = attempt_number;
                if attempts >= ctx.config.max_attempts {
                    info!(issue = issue.number, attempts, "Attempt budget exhausted");
                    retire_worktree(ctx, issue).await;
                    return Ok(IssueTerminal::Failed {
                        attempts,
                        reason: "changes requested and attempt budget exhausted".to_string(),
                        retained_worktree: false,
                    });
                }
                feedback = combine_feedback(&verdicts);
            }
        }
    }
}

async fn provision_worktree(
    ctx: &IssueContext,
    issue: &Issue,
) -> Result<(String, PathBuf), crate::errors::GitOperationError> {
    // Worktree creation is serialized per feature: path allocation must not race.
    let _exclusive = ctx.worktree_lock.lock().await;
    ctx.worktrees
        .setup_issue_branch(&ctx.feature, issue.number)
        .await
}

async fn retire_worktree(ctx: &IssueContext, issue: &Issue) {
    let _exclusive = ctx.worktree_lock.lock().await;
    if let Err(e) = ctx
        .worktrees
        .remove_issue_worktree(&ctx.feature, issue.number, true)
        .await
    {
        warn!(issue = issue.number, error = %e, "Worktree cleanup failed");
    }
}

async fn solve_once(
    ctx: &IssueContext,
    issue: &Issue,
    worktree_path: &PathBuf,
    attempt_number: u32,
    feedback: &str,
) -> Result<(), AgentError> {
    let run = AgentRun::start(AgentKind::Solver);
    let agent_id = run.agent_id.to_string();
    ctx.audit.record(AuditEvent::AgentRunStarted {
        feature: ctx.feature.clone(),
        issue: Some(issue.number),
        run: run.clone(),
    });

    let prompt = prompts::solver_prompt(&SolverVars {
        issue_number: issue.number,
        issue_title: &issue.title,
        issue_description: &issue.description,
        feature_name: &ctx.feature,
        attempt_number,
        max_attempts: ctx.config.max_attempts,
        agent_id: &agent_id,
        worktree_path: &worktree_path.display().to_string(),
        base_branch: &ctx.base_branch,
        review_feedback: feedback,
    })
    .map_err(|e| AgentError::ProcessFailed {
        code: -1,
        stderr: e.to_string(),
    })?;

    let result = ctx
        .invoker
        .run(AgentKind::Solver, &prompt, worktree_path)
        .await;

    let finished = match &result {
        Ok(_) => run.completed(),
        Err(AgentError::TimedOut { .. }) => run.timed_out(),
        Err(e) => run.failed(&e.to_string()),
    };
    ctx.audit.record(AuditEvent::AgentRunFinished {
        feature: ctx.feature.clone(),
        issue: Some(issue.number),
        run: finished,
    });

    result.map(|_| ())
}

enum ReviewRoundAbort {
    Fatal(OrchestrationError),
    Cancelled,
}

async fn review_round(
    ctx: &IssueContext,
    issue: &Issue,
    worktree_path: &PathBuf,
    attempt_number: u32,
) -> Result<Vec<crate::models::ReviewVerdict>, ReviewRoundAbort> {
    let mut verdicts = Vec::with_capacity(ctx.config.reviewer_profiles.len());

    for profile in &ctx.config.reviewer_profiles {
        let run = AgentRun::start(AgentKind::Reviewer);
        ctx.audit.record(AuditEvent::AgentRunStarted {
            feature: ctx.feature.clone(),
            issue: Some(issue.number),
            run: run.clone(),
        });

        let prompt = prompts::reviewer_prompt(
            profile,
            issue.number,
            &issue.title,
            &issue.description,
            &ctx.feature,
            attempt_number,
            &worktree_path.display().to_string(),
        )
        .map_err(|e| ReviewRoundAbort::Fatal(e.into()))?;

        let verdict = match ctx
            .invoker
            .run(AgentKind::Reviewer, &prompt, worktree_path)
            .await
        {
            Ok(output) => {
                ctx.audit.record(AuditEvent::AgentRunFinished {
                    feature: ctx.feature.clone(),
                    issue: Some(issue.number),
                    run: run.completed(),
                });
                prompts::parse_review_verdict(profile, attempt_number, &output)
            }
            Err(e) if e.is_fatal() => return Err(ReviewRoundAbort::Fatal(e.into())),
            Err(AgentError::Cancelled) => return Err(ReviewRoundAbort::Cancelled),
            Err(e) => {
                // A reviewer that failed has not approved anything; its
                // failure text becomes feedback for the next attempt.
                ctx.audit.record(AuditEvent::AgentRunFinished {
                    feature: ctx.feature.clone(),
                    issue: Some(issue.number),
                    run: run.failed(&e.to_string()),
                });
                crate::models::ReviewVerdict {
                    reviewer_profile: profile.clone(),
                    attempt_number,
                    approval: crate::models::ApprovalStatus::NeedsChanges,
                    feedback: format!("reviewer invocation failed: {}", e),
                }
            }
        };

        ctx.audit.record(AuditEvent::VerdictRecorded {
            feature: ctx.feature.clone(),
            issue: issue.number,
            verdict: verdict.clone(),
        });
        verdicts.push(verdict);
    }

    Ok(verdicts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorktreeConfig;
    use crate::models::IssueSpec;
    use crate::worktree::GitRunner;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tokio::sync::watch;

    struct Harness {
        ctx: IssueContext,
        _dir: TempDir,
        repo: PathBuf,
        log: PathBuf,
        _cancel: watch::Sender<bool>,
    }

    /// Stub agent: solvers append to the worktree and a shared log file,
    /// reviewers answer with the verdict baked into the script.
    fn agent_script(log: &Path, verdict_line: &str) -> String {
        format!(
            "#!/bin/sh\ninput=$(cat)\ncase \"$input\" in\n  \"# Review Issue\"*)\n    echo reviewer >> {log}\n    {verdict}\n    ;;\n  *)\n    echo solver >> {log}\n    echo work >> implementation.txt\n    echo \"implemented\"\n    ;;\nesac\n",
            log = log.display(),
            verdict = verdict_line,
        )
    }

    async fn harness(verdict_line: &str, config: RunConfig) -> Harness {
        let dir = tempdir().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        let git = GitRunner::new(&repo);
        git.run_checked(&["init", "-b", "main"]).await.unwrap();
        git.run_checked(&["config", "user.name", "test"]).await.unwrap();
        git.run_checked(&["config", "user.email", "test@test.com"])
            .await
            .unwrap();
        fs::write(repo.join("README.md"), "# repo\n").unwrap();
        git.add_all().await.unwrap();
        git.commit("init").await.unwrap();

        let log = dir.path().join("agent.log");
        let script = dir.path().join("agent.sh");
        fs::write(&script, agent_script(&log, verdict_line)).unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).unwrap();

        let config = Arc::new(
            config
                .with_agent_cmd(&script.to_string_lossy())
                .with_agent_args(vec![])
                .with_agent_timeout(Duration::from_secs(30)),
        );

        let worktrees = Arc::new(WorktreeManager::new(
            WorktreeConfig::new(repo.clone(), "demo")
                .with_worktrees_dir(dir.path().join("worktrees")),
        ));
        worktrees.ensure_feature_branch("demo", "main").await.unwrap();
        worktrees
            .ensure_worktree("demo", "feature/demo")
            .await
            .unwrap();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let invoker = Arc::new(AgentInvoker::new(&config, cancel_rx));

        let ctx = IssueContext {
            feature: "demo".to_string(),
            base_branch: "main".to_string(),
            config,
            invoker,
            worktrees,
            audit: AuditHandle::disabled(),
            merge_lock: Arc::new(Mutex::new(())),
            worktree_lock: Arc::new(Mutex::new(())),
        };
        Harness {
            ctx,
            _dir: dir,
            repo,
            log,
            _cancel: cancel_tx,
        }
    }

    fn test_issue(number: u32) -> Issue {
        Issue::from_spec(IssueSpec {
            number,
            title: format!("Do thing {}", number),
            description: "Make it so".to_string(),
            step_number: number,
            dependencies: vec![],
        })
    }

    fn count_lines(log: &Path, needle: &str) -> usize {
        fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .filter(|l| *l == needle)
            .count()
    }

    #[tokio::test]
    async fn approved_issue_closes_and_merges() {
        let h = harness("echo \"<verdict>approved</verdict> ship it\"", RunConfig::default()).await;

        let terminal = run_issue(&h.ctx, &test_issue(1)).await.unwrap();
        assert_eq!(terminal, IssueTerminal::Closed { attempts: 1 });

        // The solver's work landed on the feature branch.
        let feature_wt = h.ctx.worktrees.feature_worktree_path("demo");
        assert!(feature_wt.join("implementation.txt").exists());
        // Issue worktree was retired.
        assert!(!h.ctx.worktrees.issue_worktree_path("demo", 1).exists());
        assert_eq!(count_lines(&h.log, "solver"), 1);
        assert_eq!(count_lines(&h.log, "reviewer"), 1);
    }

    #[tokio::test]
    async fn changes_requested_exhausts_attempt_budget() {
        let h = harness(
            "echo \"<verdict>needs_changes</verdict> not there yet\"",
            RunConfig::default().with_max_attempts(3),
        )
        .await;

        let terminal = run_issue(&h.ctx, &test_issue(1)).await.unwrap();
        match terminal {
            IssueTerminal::Failed { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("Expected Failed, got {:?}", other),
        }
        // Exactly three solve attempts, never a fourth.
        assert_eq!(count_lines(&h.log, "solver"), 3);
        assert_eq!(count_lines(&h.log, "reviewer"), 3);
    }

    #[tokio::test]
    async fn rejection_dominates_even_with_enough_approvals() {
        // Two profiles approve, one rejects; required_approvals = 2.
        // The stub can only answer one way, so use per-profile scripting:
        // the reviewer checks its profile name from the prompt.
        let h = harness("true", RunConfig::default()).await; // placeholder, replaced below
        let script = format!(
            "#!/bin/sh\ninput=$(cat)\ncase \"$input\" in\n  *'`naysayer` reviewer'*)\n    echo \"<verdict>rejected</verdict> fundamentally wrong\"\n    ;;\n  \"# Review Issue\"*)\n    echo \"<verdict>approved</verdict> fine\"\n    ;;\n  *)\n    echo work >> implementation.txt\n    echo \"implemented\"\n    ;;\nesac\n",
        );
        let script_path = h.repo.parent().unwrap().join("agent2.sh");
        fs::write(&script_path, script).unwrap();
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();

        let config = Arc::new(
            RunConfig::default()
                .with_agent_cmd(&script_path.to_string_lossy())
                .with_agent_args(vec![])
                .with_reviewer_profiles(vec![
                    "general".into(),
                    "security".into(),
                    "naysayer".into(),
                ])
                .with_required_approvals(2)
                .with_max_attempts(1),
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = IssueContext {
            config: config.clone(),
            invoker: Arc::new(AgentInvoker::new(&config, cancel_rx)),
            ..h.ctx.clone()
        };
        drop(cancel_tx);

        let terminal = run_issue(&ctx, &test_issue(2)).await.unwrap();
        assert!(matches!(terminal, IssueTerminal::Failed { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn solver_process_failure_consumes_attempts() {
        let h = harness("true", RunConfig::default().with_max_attempts(2)).await;
        // Replace the agent with one that always fails.
        let script_path = h.repo.parent().unwrap().join("failing.sh");
        fs::write(&script_path, "#!/bin/sh\ncat > /dev/null\necho broken >&2\nexit 1\n").unwrap();
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();

        let config = Arc::new(
            RunConfig::default()
                .with_agent_cmd(&script_path.to_string_lossy())
                .with_agent_args(vec![])
                .with_max_attempts(2),
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = IssueContext {
            config: config.clone(),
            invoker: Arc::new(AgentInvoker::new(&config, cancel_rx)),
            ..h.ctx.clone()
        };
        drop(cancel_tx);

        let terminal = run_issue(&ctx, &test_issue(3)).await.unwrap();
        match terminal {
            IssueTerminal::Failed { attempts, reason, .. } => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("attempts exhausted"));
            }
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_agent_binary_is_fatal_to_the_run() {
        let h = harness("true", RunConfig::default()).await;
        let config = Arc::new(
            RunConfig::default()
                .with_agent_cmd("definitely-not-a-real-agent-binary")
                .with_agent_args(vec![]),
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = IssueContext {
            config: config.clone(),
            invoker: Arc::new(AgentInvoker::new(&config, cancel_rx)),
            ..h.ctx.clone()
        };
        drop(cancel_tx);

        assert!(run_issue(&ctx, &test_issue(4)).await.is_err());
    }
}
