//! Append-only audit trail.
//!
//! Every policy decision, approval, secret access, patch, and handoff is
//! recorded as one JSON line. The file sink writes
//! `logs/policy_audit.log`; every event is also mirrored through
//! `tracing` so operators see it live.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    PolicyDecision,
    Approval,
    SecretAccess,
    PatchProposed,
    PatchAdopted,
    PatchRefused,
    Handoff,
    RunStateChange,
    TriggerFired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    #[serde(default)]
    pub run_id: Option<u64>,
    #[serde(default)]
    pub step_index: Option<usize>,
    pub details: Value,
}

impl AuditEvent {
    pub fn now(kind: AuditKind, details: Value) -> Self {
        AuditEvent {
            timestamp: Utc::now(),
            kind,
            run_id: None,
            step_index: None,
            details,
        }
    }

    pub fn for_run(mut self, run_id: u64) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn at_step(mut self, step_index: usize) -> Self {
        self.step_index = Some(step_index);
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent);
}

/// Sink that only mirrors to `tracing`; used in tests and dry runs.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, event: AuditEvent) {
        tracing::info!(
            kind = ?event.kind,
            run_id = event.run_id,
            step_index = event.step_index,
            details = %event.details,
            "audit"
        );
    }
}

/// JSON-lines file sink. One event per line, append-only.
pub struct JsonLinesAuditSink {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonLinesAuditSink {
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(JsonLinesAuditSink {
            path,
            lock: tokio::sync::Mutex::new(()),
        })
    }

    pub async fn read_all(&self) -> std::io::Result<Vec<AuditEvent>> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        Ok(text
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[async_trait]
impl AuditSink for JsonLinesAuditSink {
    async fn append(&self, event: AuditEvent) {
        let _guard = self.lock.lock().await;
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize audit event");
                return;
            }
        };
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(error = %e, path = %self.path.display(), "audit append failed");
        }
        tracing::info!(kind = ?event.kind, run_id = event.run_id, "audit");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesAuditSink::new(dir.path().join("logs/policy_audit.log")).unwrap();

        sink.append(
            AuditEvent::now(AuditKind::PolicyDecision, json!({"allowed": false})).for_run(7),
        )
        .await;
        sink.append(AuditEvent::now(AuditKind::Approval, json!({"status": "approved"})).for_run(7))
            .await;

        let events = sink.read_all().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, AuditKind::PolicyDecision);
        assert_eq!(events[0].run_id, Some(7));
        assert_eq!(events[1].details["status"], "approved");
    }

    #[tokio::test]
    async fn test_event_builder() {
        let event = AuditEvent::now(AuditKind::SecretAccess, json!({"reference": "svc/key"}))
            .for_run(3)
            .at_step(2);
        assert_eq!(event.run_id, Some(3));
        assert_eq!(event.step_index, Some(2));
    }
}
