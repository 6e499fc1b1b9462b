//! Run orchestrator: submission, workers, suspensions, approvals.
//!
//! Workers pull items off the queue manager and run each to completion
//! or suspension. Suspension releases the worker's lease; approvals and
//! explicit resumes re-enqueue the run, which continues from its
//! checkpoint.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::dsl::schema::{Action, Plan, Role};
use crate::dsl::validation::validate_plan;
use crate::error::{CoreError, CoreResult, ErrorCard, ErrorCode};
use crate::manifest::{derive_manifest, SignatureInfo};
use crate::metrics::MetricEvent;
use crate::queue::{QueueManager, WorkItem, WorkPayload};
use crate::services::Services;
use crate::store::{ApprovalStatus, AuditEvent, AuditKind, Run, RunState};

use super::executor::{Executor, RunController, RunOutcome, Suspension};

pub struct Orchestrator {
    services: Arc<Services>,
    queue: Arc<QueueManager>,
    controllers: Mutex<HashMap<u64, RunController>>,
    /// Plans of suspended runs awaiting a decision or resume.
    suspended: Mutex<HashMap<u64, Plan>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(services: Arc<Services>) -> Arc<Self> {
        let queue = Arc::new(QueueManager::new(&services.orchestrator));
        Arc::new(Orchestrator {
            services,
            queue,
            controllers: Mutex::new(HashMap::new()),
            suspended: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Validate, record, and enqueue a run for a plan. Returns the run
    /// id, or `QUEUE_FULL` when the target queue's backlog is saturated.
    pub async fn submit(
        &self,
        plan: Plan,
        variables: HashMap<String, Value>,
        auto_approve: bool,
        dry_run: bool,
    ) -> CoreResult<u64> {
        let report = validate_plan(&plan);
        if !report.is_valid {
            return Err(CoreError::ValidationFailed(Box::new(report)));
        }

        let mut merged = plan.clone();
        for (key, value) in &variables {
            merged.variables.insert(key.clone(), value.clone());
        }

        let mut manifest = derive_manifest(&merged);
        if let Some(signature) = &merged.signature {
            manifest.signature_info = Some(SignatureInfo {
                algo: signature.algo.clone(),
                key_id: signature.key_id.clone(),
                sig: signature.sig.clone(),
            });
        }

        let queue_name = merged
            .execution
            .as_ref()
            .and_then(|e| e.queue.clone())
            .unwrap_or_else(crate::config::default_queue);
        let priority = merged
            .execution
            .as_ref()
            .and_then(|e| e.priority)
            .unwrap_or_else(crate::config::default_priority);

        let run_id = self.services.store.next_run_id();
        let run = Run {
            run_id,
            public_id: uuid::Uuid::new_v4().to_string(),
            plan_name: merged.name.clone(),
            variables_resolved: merged
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            manifest,
            state: RunState::Queued,
            queue: queue_name.clone(),
            priority,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            step_results: Vec::new(),
            error: None,
        };
        self.services.store.put_run(run.clone()).await?;

        let enqueued = self.queue.enqueue(
            run_id,
            &queue_name,
            priority,
            WorkPayload::Start {
                plan: merged,
                variables,
                auto_approve,
                dry_run,
            },
        );
        if let Err(e) = enqueued {
            let mut failed = run;
            failed.state = RunState::Failed;
            failed.finished_at = Some(Utc::now());
            failed.error = Some(ErrorCard::new(
                ErrorCode::QueueFull,
                format!("queue '{queue_name}' is full"),
            ));
            let _ = self.services.store.put_run(failed).await;
            return Err(e);
        }

        self.services.metrics.record(MetricEvent::QueueDepth {
            depth: self.queue.depth(),
        });
        self.services
            .audit
            .append(
                AuditEvent::now(
                    AuditKind::TriggerFired,
                    json!({"queue": queue_name, "priority": priority}),
                )
                .for_run(run_id),
            )
            .await;
        Ok(run_id)
    }

    /// Spawn the worker pool. Workers run until [`shutdown`] fires.
    pub fn start_workers(self: &Arc<Self>) {
        for worker in 0..self.services.orchestrator.workers.max(1) {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tracing::debug!(worker, "worker started");
                this.worker_loop().await;
            });
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn worker_loop(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            while let Some(item) = self.queue.take_next() {
                self.execute_item(item).await;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.queue.wait_for_work() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }

    /// Claim and execute at most one queued item; used by the CLI's
    /// single-shot mode and by tests that want deterministic stepping.
    pub async fn process_one(&self) -> Option<(u64, RunOutcome)> {
        let item = self.queue.take_next()?;
        let run_id = item.run_id;
        let outcome = self.execute_item(item).await;
        Some((run_id, outcome))
    }

    /// Process queued work until everything is terminal or suspended.
    pub async fn drain(&self) -> usize {
        let mut processed = 0;
        while self.process_one().await.is_some() {
            processed += 1;
        }
        processed
    }

    async fn execute_item(&self, item: WorkItem) -> RunOutcome {
        let run_id = item.run_id;
        let queue_name = item.queue.clone();
        let controller = self
            .controllers
            .lock()
            .entry(run_id)
            .or_insert_with(RunController::new)
            .clone();

        let executor = Executor::new(Arc::clone(&self.services));
        let outcome = match item.payload {
            WorkPayload::Start {
                plan,
                variables,
                auto_approve,
                dry_run,
            } => {
                let keep = plan.clone();
                let outcome = executor
                    .execute_start(run_id, plan, variables, auto_approve, dry_run, &controller)
                    .await;
                if matches!(outcome, RunOutcome::Suspended(_)) {
                    self.suspended.lock().insert(run_id, keep);
                }
                outcome
            }
            WorkPayload::Resume { plan } => {
                let keep = plan.clone();
                let outcome = executor.execute_resume(run_id, plan, &controller).await;
                if matches!(outcome, RunOutcome::Suspended(_)) {
                    self.suspended.lock().insert(run_id, keep);
                }
                outcome
            }
        };

        self.queue.complete(&queue_name);

        match &outcome {
            RunOutcome::Suspended(Suspension::Approval { step_index }) => {
                self.arm_approval_timer(run_id, *step_index).await;
            }
            RunOutcome::Suspended(_) => {}
            _ => {
                self.controllers.lock().remove(&run_id);
                self.suspended.lock().remove(&run_id);
            }
        }
        outcome
    }

    /// Start the timeout clock for a pending `human_confirm` approval.
    /// Run-gate approvals wait for a human indefinitely.
    async fn arm_approval_timer(&self, run_id: u64, step_index: usize) {
        let plan = self.suspended.lock().get(&run_id).cloned();
        let Some(plan) = plan else { return };
        let Some(step) = plan.steps.get(step_index) else {
            return;
        };
        if step.action != "human_confirm" {
            return;
        }
        let timeout_minutes = match Action::from_parts(&step.action, &step.params) {
            Ok(Action::HumanConfirm { timeout_minutes, .. }) => timeout_minutes,
            _ => return,
        };

        let services = Arc::clone(&self.services);
        let queue = Arc::clone(&self.queue);
        let suspended = self.suspended.lock().get(&run_id).cloned();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout_minutes * 60)).await;
            let approvals = services.store.approvals(run_id).await.unwrap_or_default();
            let still_pending = approvals
                .iter()
                .any(|a| a.step_index == step_index && a.status == ApprovalStatus::Pending);
            if !still_pending {
                return;
            }
            tracing::warn!(run_id, step_index, "approval timed out");
            let mut record = approvals
                .into_iter()
                .find(|a| a.step_index == step_index)
                .expect("pending approval exists");
            record.status = ApprovalStatus::TimedOut;
            record.decided_at = Some(Utc::now());
            let _ = services.store.record_approval(record).await;
            if let Some(plan) = suspended {
                let _ = queue.enqueue(
                    run_id,
                    &plan_queue(&plan),
                    plan_priority(&plan),
                    WorkPayload::Resume { plan },
                );
            }
        });
    }

    /// Apply a human decision to the run's pending approval. The
    /// approver's role must satisfy the step's `required_role`; an
    /// insufficient role leaves the approval pending.
    pub async fn resolve_approval(
        &self,
        run_id: u64,
        approve: bool,
        approver_role: Option<Role>,
    ) -> CoreResult<()> {
        let approvals = self.services.store.approvals(run_id).await?;
        let mut pending = approvals
            .into_iter()
            .find(|a| a.status == ApprovalStatus::Pending)
            .ok_or_else(|| CoreError::Internal(format!("no pending approval for run {run_id}")))?;

        if let Some(required) = pending.required_role {
            let satisfied = approver_role.map(|r| r.satisfies(required)).unwrap_or(false);
            if !satisfied {
                return Err(CoreError::ApprovalDenied);
            }
        }

        pending.status = if approve {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Denied
        };
        pending.decided_at = Some(Utc::now());
        pending.approver_role = approver_role;
        let kind = pending.kind;
        self.services.store.record_approval(pending).await?;

        if approve {
            self.services.metrics.record(MetricEvent::ApprovalGranted);
        }
        self.services
            .audit
            .append(
                AuditEvent::now(
                    AuditKind::Approval,
                    json!({"approved": approve, "kind": format!("{kind:?}")}),
                )
                .for_run(run_id),
            )
            .await;

        self.requeue_suspended(run_id)
    }

    /// Force a pending approval into the timed-out state; the timer task
    /// does this on the clock, tests do it directly.
    pub async fn expire_approval(&self, run_id: u64) -> CoreResult<()> {
        let approvals = self.services.store.approvals(run_id).await?;
        let mut pending = approvals
            .into_iter()
            .find(|a| a.status == ApprovalStatus::Pending)
            .ok_or_else(|| CoreError::Internal(format!("no pending approval for run {run_id}")))?;
        pending.status = ApprovalStatus::TimedOut;
        pending.decided_at = Some(Utc::now());
        self.services.store.record_approval(pending).await?;
        self.requeue_suspended(run_id)
    }

    /// Resume a paused or safe-failed run.
    pub fn resume(&self, run_id: u64) -> CoreResult<()> {
        self.requeue_suspended(run_id)
    }

    fn requeue_suspended(&self, run_id: u64) -> CoreResult<()> {
        let plan = self
            .suspended
            .lock()
            .get(&run_id)
            .cloned()
            .ok_or(CoreError::RunNotFound(run_id))?;
        self.queue.enqueue(
            run_id,
            &plan_queue(&plan),
            plan_priority(&plan),
            WorkPayload::Resume { plan },
        )
    }

    /// Request cancellation. Running runs stop at the next step
    /// boundary; suspended runs are finalized immediately.
    pub async fn cancel_run(&self, run_id: u64) -> CoreResult<()> {
        if let Some(controller) = self.controllers.lock().get(&run_id) {
            controller.cancel.cancel();
        }
        let suspended = self.suspended.lock().remove(&run_id);
        if suspended.is_some() {
            if let Some(mut run) = self.services.store.get_run(run_id).await? {
                if !run.state.is_terminal() {
                    run.state = RunState::Cancelled;
                    run.finished_at = Some(Utc::now());
                    run.error = Some(ErrorCard::new(ErrorCode::Cancelled, "cancelled while suspended"));
                    self.services.store.put_run(run).await?;
                }
            }
            self.controllers.lock().remove(&run_id);
        }
        Ok(())
    }

    /// Request an explicit pause at the next step boundary.
    pub fn pause_run(&self, run_id: u64) {
        if let Some(controller) = self.controllers.lock().get(&run_id) {
            controller.pause.cancel();
        }
    }

    pub async fn run_state(&self, run_id: u64) -> CoreResult<RunState> {
        Ok(self
            .services
            .store
            .get_run(run_id)
            .await?
            .ok_or(CoreError::RunNotFound(run_id))?
            .state)
    }

    /// Poll the store until the run reaches a terminal state. Test and
    /// CLI convenience.
    pub async fn wait_terminal(&self, run_id: u64, timeout: Duration) -> CoreResult<RunState> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.run_state(run_id).await?;
            if state.is_terminal() {
                return Ok(state);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(state);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn plan_queue(plan: &Plan) -> String {
    plan.execution
        .as_ref()
        .and_then(|e| e.queue.clone())
        .unwrap_or_else(crate::config::default_queue)
}

fn plan_priority(plan: &Plan) -> u8 {
    plan.execution
        .as_ref()
        .and_then(|e| e.priority)
        .unwrap_or_else(crate::config::default_priority)
}
