//! Persistent run records.
//!
//! Runs, step results, evidence, deviations, and approvals are stored by
//! numeric id and resolved by lookup; records never hold back-pointers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dsl::schema::{Role, StepStatus};
use crate::error::ErrorCard;
use crate::manifest::Manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Queued,
    Running,
    Paused,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Cancelled)
    }
}

/// One recorded run of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: u64,
    /// Opaque id safe to expose on the HTTP surface.
    pub public_id: String,
    pub plan_name: String,
    /// Variables after substitution defaults, with secret values masked.
    pub variables_resolved: Map<String, Value>,
    pub manifest: Manifest,
    pub state: RunState,
    pub queue: String,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Sparse while the run progresses; indexed by step.
    pub step_results: Vec<Option<StepResult>>,
    #[serde(default)]
    pub error: Option<ErrorCard>,
}

impl Run {
    /// Read-only view exposed by public id: no variables, no raw params,
    /// just progress and the first-error card.
    pub fn masked_view(&self) -> PublicRun {
        PublicRun {
            public_id: self.public_id.clone(),
            plan_name: self.plan_name.clone(),
            state: self.state,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            steps: self
                .step_results
                .iter()
                .enumerate()
                .map(|(index, result)| PublicStep {
                    index,
                    status: result.as_ref().map(|r| r.status),
                    duration_ms: result.as_ref().map(|r| r.duration_ms),
                })
                .collect(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicRun {
    pub public_id: String,
    pub plan_name: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<PublicStep>,
    pub error: Option<ErrorCard>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicStep {
    pub index: usize,
    pub status: Option<StepStatus>,
    pub duration_ms: Option<u64>,
}

/// Structured note left by a self-recovery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryNote {
    pub action: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default)]
    pub recovery_actions: Vec<RecoveryNote>,
    /// Keys of evidence artifacts persisted before this result.
    #[serde(default)]
    pub evidence: Vec<EvidenceKey>,
    #[serde(default)]
    pub error: Option<ErrorCard>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Screenshot,
    DomSchema,
}

/// Content address of one evidence artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceKey {
    pub run_id: u64,
    pub step_index: usize,
    pub kind: EvidenceKind,
}

impl EvidenceKey {
    /// Relative artifact path under the artifacts root.
    pub fn artifact_path(&self) -> String {
        match self.kind {
            EvidenceKind::Screenshot => {
                format!("screenshots/{}_step_{}.png", self.run_id, self.step_index)
            }
            EvidenceKind::DomSchema => {
                format!("schemas/{}_step_{}.json", self.run_id, self.step_index)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub key: EvidenceKey,
    pub captured_at: DateTime<Utc>,
    /// Where the artifact landed on disk.
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    TimedOut,
}

/// Whether an approval gates the whole run or a `human_confirm` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    RunGate,
    Step,
}

impl Default for ApprovalKind {
    fn default() -> Self {
        ApprovalKind::Step
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub run_id: u64,
    #[serde(default)]
    pub kind: ApprovalKind,
    pub step_index: usize,
    pub message: String,
    pub required_role: Option<Role>,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approver_role: Option<Role>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviationKind {
    VerifierFail,
    DomainDrift,
    DownloadFail,
    RetryCap,
    UnexpectedElement,
    Timing,
    RiskEscalation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deviation {
    pub run_id: u64,
    pub step_index: usize,
    pub kind: DeviationKind,
    pub severity: DeviationSeverity,
    pub score: u32,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
}

/// Summary row for `list` surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: u64,
    pub public_id: String,
    pub plan_name: String,
    pub state: RunState,
    pub queue: String,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        RunSummary {
            run_id: run.run_id,
            public_id: run.public_id.clone(),
            plan_name: run.plan_name.clone(),
            state: run.state,
            queue: run.queue.clone(),
            priority: run.priority,
            created_at: run.created_at,
            finished_at: run.finished_at,
        }
    }
}
