use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

use conductor::audit::JsonlAuditSink;
use conductor::config::{MergePolicy, RunConfig, WorktreeConfig};
use conductor::models::{FeatureStatus, IssueSpec, IssueStatus};
use conductor::orchestrator::{FeatureSpec, Orchestrator};
use conductor::tracker::InMemoryTracker;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Multi-agent feature orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the main git repository.
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a feature: plan issues, solve, review and merge.
    Run {
        /// Feature name (kebab-case, 2-50 chars).
        name: String,

        /// Feature description, fed to the agents.
        #[arg(short, long, default_value = "")]
        description: String,

        /// JSON file with the issue list; omit to use --architecture.
        #[arg(long, conflicts_with = "architecture")]
        issues_file: Option<PathBuf>,

        /// Let an architecture agent plan the issue list.
        #[arg(long)]
        architecture: bool,

        /// Base branch to branch from and merge into.
        #[arg(long, default_value = "main")]
        base: String,

        /// Concurrently running issue state machines.
        #[arg(long, default_value = "2")]
        max_concurrent: usize,

        /// Solve attempts per issue.
        #[arg(long, default_value = "3")]
        max_attempts: u32,

        /// Approvals required per attempt.
        #[arg(long, default_value = "1")]
        required_approvals: usize,

        /// Reviewer profile; repeat for multiple reviewers.
        #[arg(long = "reviewer", default_value = "general")]
        reviewers: Vec<String>,

        /// Conflict handling when merges collide.
        #[arg(long, value_enum, default_value_t = MergePolicy::Manual)]
        conflict_policy: MergePolicy,

        /// Per-invocation agent timeout in seconds.
        #[arg(long, default_value = "900")]
        agent_timeout_secs: u64,

        /// Agent CLI command (also CONDUCTOR_AGENT_CMD).
        #[arg(long)]
        agent_cmd: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "conductor=debug" } else { "conductor=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let repo = cli
        .repo
        .unwrap_or_else(|| PathBuf::from("."))
        .canonicalize()
        .context("Failed to resolve repository path")?;

    match cli.command {
        Commands::Run {
            name,
            description,
            issues_file,
            architecture,
            base,
            max_concurrent,
            max_attempts,
            required_approvals,
            reviewers,
            conflict_policy,
            agent_timeout_secs,
            agent_cmd,
        } => {
            let mut config = RunConfig::default()
                .with_max_concurrent_tasks(max_concurrent)
                .with_max_attempts(max_attempts)
                .with_required_approvals(required_approvals)
                .with_reviewer_profiles(reviewers)
                .with_conflict_policy(conflict_policy)
                .with_agent_timeout(Duration::from_secs(agent_timeout_secs));
            if let Some(cmd) = agent_cmd {
                config = config.with_agent_cmd(&cmd);
            }

            let issues = match issues_file {
                Some(path) => {
                    let content = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    serde_json::from_str::<Vec<IssueSpec>>(&content)
                        .context("Issues file is not a valid issue list")?
                }
                None => Vec::new(),
            };

            let project = repo
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "project".to_string());
            let worktree_config = WorktreeConfig::new(repo.clone(), &project);

            let audit_path = repo
                .join(".conductor")
                .join("audit")
                .join(format!("{}.jsonl", name));
            let (audit, sink) = JsonlAuditSink::create(audit_path)
                .await
                .context("Failed to open audit log")?;

            let orchestrator = Arc::new(Orchestrator::new(
                config,
                worktree_config,
                Arc::new(InMemoryTracker::new()),
                audit.clone(),
            ));

            // Ctrl-C aborts the run: in-flight agents are killed and
            // non-terminal issues are marked failed.
            let canceller = Arc::clone(&orchestrator);
            let feature_name = name.clone();
            let interrupt_task = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("{}", style("Interrupt received, cancelling feature run...").yellow());
                    canceller.cancel_feature(&feature_name).await;
                }
            });

            let spec = FeatureSpec::new(&name, &description)
                .with_base_branch(&base)
                .with_architecture_mode(architecture)
                .with_issues(issues);

            let result = orchestrator.execute_feature(spec).await;

            // Release every audit handle before flushing the sink: the
            // interrupt task holds the orchestrator (and its handle) alive.
            interrupt_task.abort();
            interrupt_task.await.ok();
            drop(audit);
            drop(orchestrator);
            sink.finish().await;

            let report = result?;
            print_report(&report);
            if report.status != FeatureStatus::Completed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn print_report(report: &conductor::models::FeatureResult) {
    let headline = match report.status {
        FeatureStatus::Completed => style(format!("Feature '{}' completed", report.feature)).green(),
        status => style(format!("Feature '{}' {}", report.feature, status)).red(),
    };
    println!("{}", headline.bold());
    println!(
        "  issues: {} closed, {} failed",
        report.closed_issues.len(),
        report.failed_issues.len()
    );
    for issue in &report.issues {
        let marker = match issue.status {
            IssueStatus::Closed => style("ok".to_string()).green(),
            IssueStatus::Failed => style("failed".to_string()).red(),
            other => style(format!("{:?}", other).to_lowercase()).yellow(),
        };
        let attempts = format!(
            "{} attempt{}",
            issue.attempts,
            if issue.attempts == 1 { "" } else { "s" }
        );
        match &issue.error {
            Some(error) => println!(
                "  #{} {} [{}] ({}) - {}",
                issue.number, issue.title, marker, attempts, error
            ),
            None => println!("  #{} {} [{}] ({})", issue.number, issue.title, marker, attempts),
        }
    }
}
