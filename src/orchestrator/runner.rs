//! Top-level feature driver.
//!
//! `execute_feature` turns a feature spec into a terminal `FeatureResult`:
//! plan issues (architecture agent or caller-supplied), check dependency
//! feasibility, provision git state, run per-issue state machines under the
//! concurrency bound, and merge the feature branch when everything closed.
//! Merges into the feature branch are serialized; solving is parallel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::AgentInvoker;
use crate::agent::prompts;
use crate::audit::{AuditEvent, AuditHandle};
use crate::config::{RunConfig, WorktreeConfig};
use crate::errors::{ConfigurationError, OrchestrationError};
use crate::machine::{IssueContext, IssueTerminal, run_issue};
use crate::models::{
    AgentKind, AgentRun, Feature, FeatureResult, FeatureStatus, Issue, IssueOutcome, IssueSpec,
    IssueStatus,
};
use crate::schedule::IssueScheduler;
use crate::tracker::IssueTracker;
use crate::worktree::WorktreeManager;

/// Input to one feature run.
#[derive(Debug, Clone)]
pub struct FeatureSpec {
    pub name: String,
    pub description: String,
    pub base_branch: String,
    /// When set, an architecture agent plans the issue list; otherwise
    /// `issues` is used as-is.
    pub architecture_mode: bool,
    pub issues: Vec<IssueSpec>,
    pub parent_feature: Option<String>,
}

impl FeatureSpec {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            base_branch: "main".to_string(),
            architecture_mode: false,
            issues: Vec::new(),
            parent_feature: None,
        }
    }

    pub fn with_base_branch(mut self, base: &str) -> Self {
        self.base_branch = base.to_string();
        self
    }

    pub fn with_architecture_mode(mut self, enabled: bool) -> Self {
        self.architecture_mode = enabled;
        self
    }

    pub fn with_issues(mut self, issues: Vec<IssueSpec>) -> Self {
        self.issues = issues;
        self
    }

    pub fn with_parent_feature(mut self, parent: &str) -> Self {
        self.parent_feature = Some(parent.to_string());
        self
    }
}

pub struct Orchestrator {
    config: Arc<RunConfig>,
    worktree_config: WorktreeConfig,
    worktrees: Arc<WorktreeManager>,
    tracker: Arc<dyn IssueTracker>,
    audit: AuditHandle,
    features: Arc<Mutex<HashMap<String, Feature>>>,
    cancels: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl Orchestrator {
    pub fn new(
        config: RunConfig,
        worktree_config: WorktreeConfig,
        tracker: Arc<dyn IssueTracker>,
        audit: AuditHandle,
    ) -> Self {
        Self {
            config: Arc::new(config),
            worktrees: Arc::new(WorktreeManager::new(worktree_config.clone())),
            worktree_config,
            tracker,
            audit,
            features: Arc::new(Mutex::new(HashMap::new())),
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current view of a feature record.
    pub async fn feature_status(&self, name: &str) -> Option<Feature> {
        self.features.lock().await.get(name).cloned()
    }

    /// Signal cancellation to a running feature. In-flight agents are
    /// killed; non-terminal issues end `Failed`; aborted-issue worktrees are
    /// left in place for inspection. Returns `false` when no such run exists.
    pub async fn cancel_feature(&self, name: &str) -> bool {
        let cancels = self.cancels.lock().await;
        match cancels.get(name) {
            Some(tx) => {
                warn!(feature = name, "Cancelling feature run");
                tx.send(true).is_ok()
            }
            None => false,
        }
    }

    async fn set_status(&self, name: &str, status: FeatureStatus) {
        if let Some(feature) = self.features.lock().await.get_mut(name) {
            feature.status = status;
        }
    }

    /// Execute a feature end to end. Issue-level failures are reported in
    /// the returned `FeatureResult`; only run-fatal conditions (invalid
    /// configuration, agent unavailable, broken git setup) surface as `Err`.
    pub async fn execute_feature(
        &self,
        spec: FeatureSpec,
    ) -> Result<FeatureResult, OrchestrationError> {
        self.config.validate()?;

        let mut feature = Feature::new(&spec.name, &spec.description)?
            .with_architecture_mode(spec.architecture_mode);
        if let Some(parent) = &spec.parent_feature {
            feature = feature.with_parent(parent);
        }
        self.features
            .lock()
            .await
            .insert(spec.name.clone(), feature);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels
            .lock()
            .await
            .insert(spec.name.clone(), cancel_tx);

        let result = self.run_feature(&spec, cancel_rx).await;

        self.cancels.lock().await.remove(&spec.name);
        match &result {
            Ok(report) => self.set_status(&spec.name, report.status).await,
            Err(_) => self.set_status(&spec.name, FeatureStatus::Failed).await,
        }
        if let Ok(report) = &result {
            self.audit.record(AuditEvent::FeatureFinished {
                result: report.clone(),
            });
        }
        result
    }

    async fn run_feature(
        &self,
        spec: &FeatureSpec,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<FeatureResult, OrchestrationError> {
        let invoker = Arc::new(AgentInvoker::new(&self.config, cancel_rx.clone()));

        // One availability probe per run; a missing binary aborts before any
        // git state is touched.
        let availability = invoker.check_availability().await?;
        info!(
            command = %availability.command,
            version = availability.version.as_deref().unwrap_or("unknown"),
            "Agent available"
        );

        let planned = self.plan_issues(spec, &invoker).await?;
        let issues = self.persist_issues(spec, planned).await?;

        // Feasibility check before any agent solves anything.
        let scheduler = IssueScheduler::new(issues)?;
        self.audit.record(AuditEvent::FeatureStarted {
            feature: spec.name.clone(),
            issue_count: scheduler.len(),
        });

        self.worktrees.sync_base_branch(&spec.base_branch).await?;
        let branch = self
            .worktrees
            .ensure_feature_branch(&spec.name, &spec.base_branch)
            .await?;
        let feature_wt = self.worktrees.ensure_worktree(&spec.name, &branch).await?;
        {
            let mut features = self.features.lock().await;
            if let Some(feature) = features.get_mut(&spec.name) {
                feature.status = FeatureStatus::InProgress;
                feature.worktree_path = Some(feature_wt.path.clone());
            }
        }

        let (scheduler, reasons, fatal) = self
            .drive_issues(spec, scheduler, invoker, cancel_rx.clone())
            .await;

        if let Some(fatal) = fatal {
            error!(feature = %spec.name, error = %fatal, "Feature run aborted");
            return Err(fatal);
        }

        let cancelled = *cancel_rx.borrow();
        self.finish_feature(spec, scheduler, reasons, cancelled)
            .await
    }

    /// Produce the issue list: architecture agent or caller-supplied.
    async fn plan_issues(
        &self,
        spec: &FeatureSpec,
        invoker: &AgentInvoker,
    ) -> Result<Vec<IssueSpec>, OrchestrationError> {
        let planned = if spec.architecture_mode {
            let run = AgentRun::start(AgentKind::Architecture);
            self.audit.record(AuditEvent::AgentRunStarted {
                feature: spec.name.clone(),
                issue: None,
                run: run.clone(),
            });

            let prompt = prompts::architecture_prompt(&spec.name, &spec.description);
            let output = match invoker
                .run(
                    AgentKind::Architecture,
                    &prompt,
                    &self.worktree_config.main_repo,
                )
                .await
            {
                Ok(output) => {
                    self.audit.record(AuditEvent::AgentRunFinished {
                        feature: spec.name.clone(),
                        issue: None,
                        run: run.completed(),
                    });
                    output
                }
                Err(e) => {
                    self.audit.record(AuditEvent::AgentRunFinished {
                        feature: spec.name.clone(),
                        issue: None,
                        run: run.failed(&e.to_string()),
                    });
                    return Err(e.into());
                }
            };

            prompts::parse_issue_list(&output).context("architecture planning failed")?
        } else {
            spec.issues.clone()
        };

        if planned.is_empty() {
            return Err(ConfigurationError::InvalidSetting {
                setting: "issues".into(),
                message: "feature has no issues to execute".into(),
            }
            .into());
        }
        Ok(planned)
    }

    /// Persist planned issues; the tracker's responses are the source of
    /// truth for issue identity.
    async fn persist_issues(
        &self,
        spec: &FeatureSpec,
        planned: Vec<IssueSpec>,
    ) -> Result<Vec<Issue>, OrchestrationError> {
        for issue_spec in planned {
            self.tracker
                .create_issue(&spec.name, issue_spec)
                .await
                .context("issue tracker rejected planned issue")?;
        }
        let issues = self
            .tracker
            .list_issues_for_feature(&spec.name)
            .await
            .context("issue tracker listing failed")?;
        Ok(issues)
    }

    /// Scheduler loop: admit ready issues up to the concurrency bound, run
    /// one state machine per admitted issue, recompute readiness as issues
    /// close. Returns the settled scheduler, per-issue failure reasons, and
    /// the first fatal error if one occurred.
    async fn drive_issues(
        &self,
        spec: &FeatureSpec,
        scheduler: IssueScheduler,
        invoker: Arc<AgentInvoker>,
        cancel_rx: watch::Receiver<bool>,
    ) -> (
        IssueScheduler,
        HashMap<u32, String>,
        Option<OrchestrationError>,
    ) {
        let scheduler = Arc::new(Mutex::new(scheduler));
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_tasks));
        let (result_tx, mut result_rx) =
            mpsc::channel::<(u32, Result<IssueTerminal, OrchestrationError>)>(64);

        let ctx = IssueContext {
            feature: spec.name.clone(),
            base_branch: spec.base_branch.clone(),
            config: Arc::clone(&self.config),
            invoker,
            worktrees: Arc::clone(&self.worktrees),
            audit: self.audit.clone(),
            merge_lock: Arc::new(Mutex::new(())),
            worktree_lock: Arc::new(Mutex::new(())),
        };

        let mut active: HashSet<u32> = HashSet::new();
        let mut reasons: HashMap<u32, String> = HashMap::new();
        let mut fatal: Option<OrchestrationError> = None;

        loop {
            // Admit ready issues while there is capacity. Admission stops
            // once a fatal error or cancellation is seen.
            if fatal.is_none() && !*cancel_rx.borrow() {
                let ready = { scheduler.lock().await.ready_set() };
                for number in ready {
                    if active.len() >= self.config.max_concurrent_tasks {
                        break;
                    }
                    if active.contains(&number) {
                        continue;
                    }

                    let agent = Uuid::new_v4();
                    let issue = {
                        let mut sched = scheduler.lock().await;
                        sched.mark_in_progress(number, agent);
                        sched.issue(number).cloned()
                    };
                    let Some(issue) = issue else { continue };

                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                        break;
                    };
                    active.insert(number);
                    info!(feature = %spec.name, issue = number, "Admitting issue");

                    let task_ctx = ctx.clone();
                    let task_tx = result_tx.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let outcome = run_issue(&task_ctx, &issue).await;
                        task_tx.send((issue.number, outcome)).await.ok();
                    });
                }
            }

            if active.is_empty() {
                break;
            }

            let Some((number, outcome)) = result_rx.recv().await else {
                break;
            };
            active.remove(&number);

            match outcome {
                Ok(IssueTerminal::Closed { attempts }) => {
                    info!(feature = %spec.name, issue = number, attempts, "Issue closed");
                    let mut sched = scheduler.lock().await;
                    sched.mark_closed(number, attempts);
                    self.audit.record(AuditEvent::IssueSettled {
                        feature: spec.name.clone(),
                        issue: number,
                        status: IssueStatus::Closed,
                        attempts,
                    });
                }
                Ok(IssueTerminal::Failed {
                    attempts, reason, ..
                }) => {
                    warn!(feature = %spec.name, issue = number, attempts, reason = %reason, "Issue failed");
                    let mut sched = scheduler.lock().await;
                    sched.mark_failed(number, attempts);
                    reasons.insert(number, reason);
                    self.audit.record(AuditEvent::IssueSettled {
                        feature: spec.name.clone(),
                        issue: number,
                        status: IssueStatus::Failed,
                        attempts,
                    });
                }
                Err(e) => {
                    // Fatal: stop admitting and cancel in-flight work, but
                    // keep draining running machines so git state settles.
                    error!(feature = %spec.name, issue = number, error = %e, "Fatal error in issue state machine");
                    if fatal.is_none() {
                        fatal = Some(e);
                        self.cancel_feature(&spec.name).await;
                    }
                    let mut sched = scheduler.lock().await;
                    sched.mark_failed(number, 0);
                    reasons.insert(number, "aborted by fatal error".to_string());
                }
            }
        }

        let scheduler = match Arc::try_unwrap(scheduler) {
            Ok(mutex) => mutex.into_inner(),
            Err(_) => unreachable!("all issue tasks have completed"),
        };
        (scheduler, reasons, fatal)
    }

    /// Terminal bookkeeping: cancellation fallout, the feature-level merge,
    /// and the structured result.
    async fn finish_feature(
        &self,
        spec: &FeatureSpec,
        mut scheduler: IssueScheduler,
        mut reasons: HashMap<u32, String>,
        cancelled: bool,
    ) -> Result<FeatureResult, OrchestrationError> {
        if cancelled {
            // Issues that never ran are failed by the abort; their worktrees
            // (if any) are left for inspection.
            let open: Vec<u32> = scheduler
                .issues()
                .filter(|i| !i.status.is_terminal())
                .map(|i| i.number)
                .collect();
            for number in open {
                scheduler.mark_failed(number, 0);
                reasons
                    .entry(number)
                    .or_insert_with(|| "cancelled".to_string());
            }
        }

        let status = if scheduler.all_closed() {
            match self
                .worktrees
                .merge_feature_branch(&spec.name, &spec.base_branch, self.config.conflict_policy)
                .await
            {
                Ok(()) => {
                    if let Err(e) = self.worktrees.cleanup_feature(&spec.name).await {
                        warn!(feature = %spec.name, error = %e, "Feature worktree cleanup failed");
                    }
                    info!(feature = %spec.name, base = %spec.base_branch, "Feature merged");
                    FeatureStatus::Completed
                }
                Err(e) => {
                    error!(feature = %spec.name, error = %e, "Feature merge failed");
                    FeatureStatus::Failed
                }
            }
        } else {
            FeatureStatus::Failed
        };

        let issues: Vec<IssueOutcome> = scheduler
            .issues()
            .map(|issue| IssueOutcome {
                number: issue.number,
                title: issue.title.clone(),
                status: issue.status,
                attempts: issue.attempt_count,
                error: reasons.get(&issue.number).cloned(),
            })
            .collect();

        Ok(FeatureResult {
            feature: spec.name.clone(),
            status,
            closed_issues: scheduler.closed_issues(),
            failed_issues: scheduler.failed_issues(),
            issues,
        })
    }
}
