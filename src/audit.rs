//! Fire-and-forget audit event sink.
//!
//! Orchestration emits `AgentRun` start/end events, review verdicts and
//! issue/feature transitions for observability. Recording never blocks and
//! never fails the caller: events go over an unbounded channel to a
//! background writer (or are dropped when no sink is attached).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::{AgentRun, FeatureResult, IssueStatus, ReviewVerdict};

/// One observable event in a feature run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    FeatureStarted {
        feature: String,
        issue_count: usize,
    },
    AgentRunStarted {
        feature: String,
        issue: Option<u32>,
        run: AgentRun,
    },
    AgentRunFinished {
        feature: String,
        issue: Option<u32>,
        run: AgentRun,
    },
    VerdictRecorded {
        feature: String,
        issue: u32,
        verdict: ReviewVerdict,
    },
    IssueSettled {
        feature: String,
        issue: u32,
        status: IssueStatus,
        attempts: u32,
    },
    FeatureFinished {
        result: FeatureResult,
    },
}

/// Cheap cloneable handle used by the engine to record events.
#[derive(Clone, Default)]
pub struct AuditHandle {
    tx: Option<mpsc::UnboundedSender<TimestampedEvent>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditHandle {
    /// A handle that drops every event. Useful for tests and library use
    /// without observability.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Record an event. Never blocks; a closed or missing sink is ignored.
    pub fn record(&self, event: AuditEvent) {
        debug!(event = ?event, "audit");
        if let Some(tx) = &self.tx {
            let stamped = TimestampedEvent {
                at: Utc::now(),
                event,
            };
            if tx.send(stamped).is_err() {
                warn!("Audit sink closed, dropping event");
            }
        }
    }
}

/// Background writer that appends events as JSON lines to a file.
///
/// Dropping the last `AuditHandle` closes the channel; `finish()` then joins
/// the writer so the file is complete.
pub struct JsonlAuditSink {
    handle: AuditHandle,
    writer: JoinHandle<()>,
}

impl JsonlAuditSink {
    pub async fn create(path: PathBuf) -> std::io::Result<(AuditHandle, Self)> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<TimestampedEvent>();
        let writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(mut line) => {
                        line.push('\n');
                        if let Err(e) = file.write_all(line.as_bytes()).await {
                            warn!(error = %e, "Failed to write audit event");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize audit event"),
                }
            }
            file.flush().await.ok();
        });

        let handle = AuditHandle { tx: Some(tx) };
        Ok((handle.clone(), Self { handle, writer }))
    }

    /// Close the sink and wait for all buffered events to hit the file.
    pub async fn finish(self) {
        drop(self.handle);
        self.writer.await.ok();
    }
}
