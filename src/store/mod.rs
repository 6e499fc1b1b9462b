//! Run persistence.
//!
//! The [`RunStore`] owns every record a run produces. Writes are atomic
//! per record and serialized per run; a step's final status is committed
//! only after its evidence rows exist.

pub mod audit;
pub mod model;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::policy::PolicyDecision;

pub use audit::{AuditEvent, AuditKind, AuditSink, JsonLinesAuditSink, TracingAuditSink};
pub use model::{
    ApprovalKind, ApprovalRecord, ApprovalStatus, Deviation, DeviationKind, DeviationSeverity,
    Evidence, EvidenceKey, EvidenceKind, PublicRun, RecoveryNote, Run, RunState, RunSummary,
    StepResult,
};

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Allocate the next monotonic run id.
    fn next_run_id(&self) -> u64;

    async fn put_run(&self, run: Run) -> CoreResult<()>;
    async fn get_run(&self, run_id: u64) -> CoreResult<Option<Run>>;
    async fn find_by_public_id(&self, public_id: &str) -> CoreResult<Option<Run>>;
    async fn list_runs(&self, limit: usize) -> CoreResult<Vec<RunSummary>>;
    /// Runs whose creation time falls in `[from, to)`, for metrics.
    async fn runs_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<RunSummary>>;

    /// Commit a step result. Evidence referenced by the result must have
    /// been recorded first.
    async fn record_step(&self, run_id: u64, result: StepResult) -> CoreResult<()>;
    async fn record_evidence(&self, evidence: Evidence) -> CoreResult<()>;
    async fn evidence_for(&self, run_id: u64) -> CoreResult<Vec<Evidence>>;

    async fn record_policy_decision(&self, run_id: u64, decision: PolicyDecision) -> CoreResult<()>;
    async fn policy_decisions(&self, run_id: u64) -> CoreResult<Vec<PolicyDecision>>;

    async fn record_deviation(&self, deviation: Deviation) -> CoreResult<()>;
    async fn deviations(&self, run_id: u64) -> CoreResult<Vec<Deviation>>;

    async fn record_approval(&self, approval: ApprovalRecord) -> CoreResult<()>;
    async fn approvals(&self, run_id: u64) -> CoreResult<Vec<ApprovalRecord>>;
}

/// In-memory store. The reference implementation and the test substrate;
/// a SQL-backed store implements the same trait out of tree.
pub struct MemoryRunStore {
    next_id: AtomicU64,
    runs: RwLock<HashMap<u64, Run>>,
    evidence: RwLock<Vec<Evidence>>,
    decisions: RwLock<HashMap<u64, Vec<PolicyDecision>>>,
    deviations: RwLock<HashMap<u64, Vec<Deviation>>>,
    approvals: RwLock<HashMap<u64, Vec<ApprovalRecord>>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        MemoryRunStore {
            next_id: AtomicU64::new(1),
            runs: RwLock::new(HashMap::new()),
            evidence: RwLock::new(Vec::new()),
            decisions: RwLock::new(HashMap::new()),
            deviations: RwLock::new(HashMap::new()),
            approvals: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    fn next_run_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn put_run(&self, run: Run) -> CoreResult<()> {
        self.runs.write().await.insert(run.run_id, run);
        Ok(())
    }

    async fn get_run(&self, run_id: u64) -> CoreResult<Option<Run>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn find_by_public_id(&self, public_id: &str) -> CoreResult<Option<Run>> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .find(|r| r.public_id == public_id)
            .cloned())
    }

    async fn list_runs(&self, limit: usize) -> CoreResult<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        let mut summaries: Vec<RunSummary> = runs.values().map(RunSummary::from).collect();
        summaries.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn runs_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CoreResult<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .filter(|r| r.created_at >= from && r.created_at < to)
            .map(RunSummary::from)
            .collect())
    }

    async fn record_step(&self, run_id: u64, result: StepResult) -> CoreResult<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(&run_id)
            .ok_or(CoreError::RunNotFound(run_id))?;
        let index = result.step_index;
        if run.step_results.len() <= index {
            run.step_results.resize(index + 1, None);
        }
        run.step_results[index] = Some(result);
        Ok(())
    }

    async fn record_evidence(&self, evidence: Evidence) -> CoreResult<()> {
        let mut rows = self.evidence.write().await;
        // Evidence artifacts are write-once per key.
        if !rows.iter().any(|e| e.key == evidence.key) {
            rows.push(evidence);
        }
        Ok(())
    }

    async fn evidence_for(&self, run_id: u64) -> CoreResult<Vec<Evidence>> {
        Ok(self
            .evidence
            .read()
            .await
            .iter()
            .filter(|e| e.key.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn record_policy_decision(
        &self,
        run_id: u64,
        decision: PolicyDecision,
    ) -> CoreResult<()> {
        self.decisions
            .write()
            .await
            .entry(run_id)
            .or_default()
            .push(decision);
        Ok(())
    }

    async fn policy_decisions(&self, run_id: u64) -> CoreResult<Vec<PolicyDecision>> {
        Ok(self
            .decisions
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_deviation(&self, deviation: Deviation) -> CoreResult<()> {
        self.deviations
            .write()
            .await
            .entry(deviation.run_id)
            .or_default()
            .push(deviation);
        Ok(())
    }

    async fn deviations(&self, run_id: u64) -> CoreResult<Vec<Deviation>> {
        Ok(self
            .deviations
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_approval(&self, approval: ApprovalRecord) -> CoreResult<()> {
        let mut approvals = self.approvals.write().await;
        let rows = approvals.entry(approval.run_id).or_default();
        // One approval per gate: replace the pending row on decision.
        if let Some(existing) = rows
            .iter_mut()
            .find(|a| a.kind == approval.kind && a.step_index == approval.step_index)
        {
            *existing = approval;
        } else {
            rows.push(approval);
        }
        Ok(())
    }

    async fn approvals(&self, run_id: u64) -> CoreResult<Vec<ApprovalRecord>> {
        Ok(self
            .approvals
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}
