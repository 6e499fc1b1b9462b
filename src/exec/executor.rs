//! Step executor.
//!
//! Drives one run from its policy gate through the step loop:
//! `when` gating, expression substitution (secrets last, masked on the
//! way out), adapter dispatch with timeout, deterministic self-recovery,
//! retry with multiplicative backoff, verifier integration, evidence
//! capture, L4 monitoring, Planner-L2 patching, HITL suspension, and
//! checkpointing.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::adapters::ElementTarget;
use crate::dsl::expr::{self, EvalContext, ExprRef, WhenExpr};
use crate::dsl::schema::{Action, AutoAction, Plan, RetryConfig, Step, StepStatus};
use crate::error::{ErrorCard, ErrorCode, StepError};
use crate::manifest::extract_domain;
use crate::metrics::MetricEvent;
use crate::monitor::{L4Monitor, MonitorVerdict};
use crate::planner::{AdoptionContext, AdoptionDecision};
use crate::secrets::SecretVault;
use crate::services::Services;
use crate::store::{
    ApprovalKind, ApprovalRecord, ApprovalStatus, AuditEvent, AuditKind, DeviationKind, Evidence,
    EvidenceKey, EvidenceKind, RecoveryNote, Run, RunState, StepResult,
};
use crate::verifier::{failure_code, Verifier, VerifierOutcome};

use super::checkpoint::Checkpoint;

/// Step durations above this raise a `TIMING` deviation even when the
/// step succeeds.
const TIMING_THRESHOLD_MS: u64 = 30_000;

/// Default per-step timeout when the plan does not set one.
const DEFAULT_STEP_TIMEOUT_MS: u64 = 120_000;

/// How a run left the executor.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed,
    Failed(ErrorCard),
    Cancelled,
    Suspended(Suspension),
}

#[derive(Debug, Clone)]
pub enum Suspension {
    /// Waiting on a human decision (run gate or `human_confirm`).
    Approval { step_index: usize },
    /// L4 safe-fail: paused pending human resume.
    SafeFail { reason: String },
    /// Explicit user pause.
    Paused,
}

/// External control surface for one running plan.
#[derive(Clone)]
pub struct RunController {
    pub cancel: CancellationToken,
    pub pause: CancellationToken,
}

impl RunController {
    pub fn new() -> Self {
        RunController {
            cancel: CancellationToken::new(),
            pause: CancellationToken::new(),
        }
    }
}

impl Default for RunController {
    fn default() -> Self {
        Self::new()
    }
}

struct FlowState {
    files: Vec<String>,
    newnames: Option<Vec<String>>,
    draft_id: Option<String>,
}

struct RunContext {
    run: Run,
    plan: Plan,
    variables: HashMap<String, Value>,
    step_outputs: Vec<Option<Map<String, Value>>>,
    vault: SecretVault,
    monitor: L4Monitor,
    flow: FlowState,
    auto_changes: u32,
    dry_run: bool,
    autopilot: bool,
    policy_window_open: bool,
    /// Set when the monitor demanded a safe-fail while a step was mid
    /// dispatch; honored at the next step boundary.
    pending_safe_fail: Option<String>,
}

impl RunContext {
    fn eval_context(&self) -> EvalContext<'_> {
        EvalContext {
            variables: &self.variables,
            step_outputs: &self.step_outputs,
        }
    }
}

enum StepFlow {
    Continue,
    Suspend(Suspension),
    Abort(ErrorCard),
}

pub struct Executor {
    services: Arc<Services>,
}

impl Executor {
    pub fn new(services: Arc<Services>) -> Self {
        Executor { services }
    }

    /// Execute a fresh run: policy gate, approval gate, then the step
    /// loop from index 0.
    pub async fn execute_start(
        &self,
        run_id: u64,
        plan: Plan,
        variables: HashMap<String, Value>,
        auto_approve: bool,
        dry_run: bool,
        controller: &RunController,
    ) -> RunOutcome {
        let Some(run) = self.load_run(run_id).await else {
            return RunOutcome::Failed(ErrorCard::new(
                ErrorCode::Internal,
                format!("run {run_id} not found"),
            ));
        };

        // Policy gate. The run never enters RUNNING when blocked.
        let signature = plan
            .signature
            .as_ref()
            .map(|_| self.services.trust.verify(&plan, Utc::now()));
        let decision =
            self.services
                .policy
                .evaluate(&run.manifest, Utc::now(), signature.as_ref());
        let _ = self
            .services
            .store
            .record_policy_decision(run_id, decision.clone())
            .await;
        self.services
            .audit
            .append(
                AuditEvent::now(
                    AuditKind::PolicyDecision,
                    serde_json::to_value(&decision).unwrap_or(Value::Null),
                )
                .for_run(run_id),
            )
            .await;

        if !decision.allowed {
            let reasons = decision.blocked_reasons();
            self.services.metrics.record(MetricEvent::PolicyBlock);
            let card = ErrorCard::new(
                ErrorCode::PolicyBlocked,
                format!("policy blocked: {}", reasons.join("; ")),
            );
            self.finish_run(run, RunState::Failed, Some(card.clone())).await;
            return RunOutcome::Failed(card);
        }

        let mut ctx = RunContext {
            run,
            plan,
            variables,
            step_outputs: Vec::new(),
            vault: SecretVault::new(),
            monitor: L4Monitor::new(
                decision.autopilot_enabled,
                self.services.policy.config().deviation_threshold,
                self.services.policy.config().penalties.clone(),
            ),
            flow: FlowState {
                files: Vec::new(),
                newnames: None,
                draft_id: None,
            },
            auto_changes: 0,
            dry_run,
            autopilot: decision.autopilot_enabled,
            policy_window_open: decision
                .checks
                .iter()
                .any(|c| c.kind == crate::policy::CheckKind::TimeWindow && c.allowed),
            pending_safe_fail: None,
        };

        // Permission strictness: a strict host fails fast on missing
        // OS permissions instead of warning.
        let issues = self.services.os.check_permissions().await;
        if !issues.is_empty() {
            if crate::config::permissions_strict() {
                self.services.metrics.record(MetricEvent::OsCapabilityMiss);
                let card = ErrorCard::new(
                    ErrorCode::OsCapabilityMiss,
                    format!("missing host permissions: {issues:?}"),
                );
                self.finish_run(ctx.run, RunState::Failed, Some(card.clone())).await;
                return RunOutcome::Failed(card);
            }
            tracing::warn!(run_id, ?issues, "continuing despite missing host permissions");
        }

        // Approval gate: risky plans need a human (or --auto-approve,
        // or a passing autopilot gate) before the first step runs.
        if !auto_approve && !ctx.autopilot && !ctx.run.manifest.risk_flags.is_empty() {
            return self.suspend_for_run_gate(&mut ctx).await;
        }

        if ctx.autopilot {
            self.services.metrics.record(MetricEvent::L4Autorun);
        }

        self.begin_running(&mut ctx).await;
        self.step_loop(&mut ctx, 0, controller).await
    }

    /// Resume from the checkpoint: rebuild variables and prior outputs,
    /// then continue at `next_step_index`.
    pub async fn execute_resume(
        &self,
        run_id: u64,
        plan: Plan,
        controller: &RunController,
    ) -> RunOutcome {
        let Some(run) = self.load_run(run_id).await else {
            return RunOutcome::Failed(ErrorCard::new(
                ErrorCode::Internal,
                format!("run {run_id} not found"),
            ));
        };
        let checkpoint = match self.services.checkpoints.load(run_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => {
                let card =
                    ErrorCard::new(ErrorCode::Internal, format!("no checkpoint for run {run_id}"));
                self.finish_run(run, RunState::Failed, Some(card.clone())).await;
                return RunOutcome::Failed(card);
            }
            Err(e) => {
                let card = ErrorCard::new(ErrorCode::Internal, e.to_string());
                self.finish_run(run, RunState::Failed, Some(card.clone())).await;
                return RunOutcome::Failed(card);
            }
        };

        // Run-gate decision check.
        let approvals = self
            .services
            .store
            .approvals(run_id)
            .await
            .unwrap_or_default();
        if let Some(gate) = approvals.iter().find(|a| a.kind == ApprovalKind::RunGate) {
            match gate.status {
                ApprovalStatus::Denied => {
                    let card = ErrorCard::new(ErrorCode::ApprovalDenied, "run approval denied");
                    self.finish_run(run, RunState::Failed, Some(card.clone())).await;
                    return RunOutcome::Failed(card);
                }
                ApprovalStatus::TimedOut => {
                    let card =
                        ErrorCard::new(ErrorCode::ApprovalTimeout, "run approval timed out");
                    self.finish_run(run, RunState::Failed, Some(card.clone())).await;
                    return RunOutcome::Failed(card);
                }
                _ => {}
            }
        }

        let decision = self
            .services
            .store
            .policy_decisions(run_id)
            .await
            .ok()
            .and_then(|mut d| d.pop());
        let autopilot = decision.as_ref().map(|d| d.autopilot_enabled).unwrap_or(false);
        let policy_window_open = decision
            .map(|d| {
                d.checks
                    .iter()
                    .any(|c| c.kind == crate::policy::CheckKind::TimeWindow && c.allowed)
            })
            .unwrap_or(false);

        let next = checkpoint.next_step_index;
        let engine_url = ctx_engine_url(&checkpoint);
        let mut ctx = RunContext {
            run,
            plan: checkpoint.patched_plan.clone().unwrap_or(plan),
            variables: checkpoint.variables,
            step_outputs: checkpoint.step_outputs,
            vault: SecretVault::new(),
            monitor: L4Monitor::new(
                autopilot,
                self.services.policy.config().deviation_threshold,
                self.services.policy.config().penalties.clone(),
            ),
            flow: FlowState {
                files: Vec::new(),
                newnames: None,
                draft_id: None,
            },
            auto_changes: checkpoint.auto_changes_applied,
            dry_run: false,
            autopilot,
            policy_window_open,
            pending_safe_fail: None,
        };
        // Reopen the web context the checkpoint recorded, if any.
        if let (Some(web), Some(url)) = (
            self.services.web.as_ref(),
            engine_url,
        ) {
            let _ = web.open(&url, "resume").await;
        }

        self.begin_running(&mut ctx).await;
        self.step_loop(&mut ctx, next, controller).await
    }

    async fn load_run(&self, run_id: u64) -> Option<Run> {
        self.services.store.get_run(run_id).await.ok().flatten()
    }

    async fn begin_running(&self, ctx: &mut RunContext) {
        ctx.run.state = RunState::Running;
        if ctx.run.started_at.is_none() {
            ctx.run.started_at = Some(Utc::now());
        }
        let _ = self.services.store.put_run(ctx.run.clone()).await;
        self.services
            .audit
            .append(
                AuditEvent::now(AuditKind::RunStateChange, json!({"state": "RUNNING"}))
                    .for_run(ctx.run.run_id),
            )
            .await;
    }

    async fn finish_run(&self, mut run: Run, state: RunState, error: Option<ErrorCard>) {
        run.state = state;
        run.finished_at = Some(Utc::now());
        run.error = error.clone();
        let duration_ms = run
            .started_at
            .map(|s| (Utc::now() - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let _ = self.services.store.put_run(run.clone()).await;
        let _ = self.services.checkpoints.delete(run.run_id).await;
        self.services.metrics.record(MetricEvent::RunFinished {
            state,
            duration_ms,
            queue: run.queue.clone(),
        });
        if let Some(card) = &error {
            self.services.metrics.record(MetricEvent::Failure {
                code: card.code,
                message: card.message.clone(),
            });
        }
        self.services
            .audit
            .append(
                AuditEvent::now(
                    AuditKind::RunStateChange,
                    json!({"state": format!("{state:?}"), "error": error.map(|e| e.to_string())}),
                )
                .for_run(run.run_id),
            )
            .await;
    }

    async fn suspend_for_run_gate(&self, ctx: &mut RunContext) -> RunOutcome {
        let run_id = ctx.run.run_id;
        let _ = self
            .services
            .store
            .record_approval(ApprovalRecord {
                run_id,
                kind: ApprovalKind::RunGate,
                step_index: 0,
                message: format!(
                    "plan '{}' requires approval for risks {:?}",
                    ctx.run.plan_name, ctx.run.manifest.risk_flags
                ),
                required_role: None,
                status: ApprovalStatus::Pending,
                requested_at: Utc::now(),
                decided_at: None,
                approver_role: None,
            })
            .await;
        self.services.metrics.record(MetricEvent::ApprovalRequired);
        self.write_checkpoint(ctx, 0).await;
        self.set_state(ctx, RunState::WaitingApproval).await;
        RunOutcome::Suspended(Suspension::Approval { step_index: 0 })
    }

    async fn set_state(&self, ctx: &mut RunContext, state: RunState) {
        ctx.run.state = state;
        let _ = self.services.store.put_run(ctx.run.clone()).await;
    }

    async fn write_checkpoint(&self, ctx: &RunContext, next_step_index: usize) {
        let mut engine_contexts = HashMap::new();
        if let Some(web) = &self.services.web {
            if let Some(url) = web.current_url().await {
                engine_contexts.insert("web".to_string(), json!({"url": url}));
            }
        }
        let checkpoint = Checkpoint {
            run_id: ctx.run.run_id,
            plan_name: ctx.plan.name.clone(),
            created_at: Utc::now().timestamp(),
            next_step_index,
            variables: ctx.variables.clone(),
            step_outputs: ctx
                .step_outputs
                .iter()
                .map(|o| {
                    o.as_ref().map(|m| {
                        match ctx.vault.mask_value(&Value::Object(m.clone())) {
                            Value::Object(masked) => masked,
                            _ => m.clone(),
                        }
                    })
                })
                .collect(),
            engine_contexts,
            auto_changes_applied: ctx.auto_changes,
            patched_plan: Some(ctx.plan.clone()),
        };
        if let Err(e) = self.services.checkpoints.save(&checkpoint).await {
            tracing::error!(run_id = ctx.run.run_id, error = %e, "checkpoint save failed");
        }
    }

    async fn step_loop(
        &self,
        ctx: &mut RunContext,
        start_index: usize,
        controller: &RunController,
    ) -> RunOutcome {
        let checkpoint_every = self.services.orchestrator.checkpoint_every.max(1);
        let mut completed_since_checkpoint = 0usize;
        let mut index = start_index;

        while index < ctx.plan.steps.len() {
            if controller.cancel.is_cancelled() {
                self.write_checkpoint(ctx, index).await;
                let card = ErrorCard::new(ErrorCode::Cancelled, "run cancelled by user");
                self.finish_run(ctx.run.clone(), RunState::Cancelled, Some(card)).await;
                return RunOutcome::Cancelled;
            }
            if controller.pause.is_cancelled() {
                self.write_checkpoint(ctx, index).await;
                self.set_state(ctx, RunState::Paused).await;
                return RunOutcome::Suspended(Suspension::Paused);
            }

            let step = ctx.plan.steps[index].clone();
            match self.execute_step(ctx, &step).await {
                StepFlow::Continue => {
                    completed_since_checkpoint += 1;
                    if completed_since_checkpoint >= checkpoint_every {
                        self.write_checkpoint(ctx, index + 1).await;
                        completed_since_checkpoint = 0;
                    }
                    index += 1;
                }
                StepFlow::Suspend(suspension) => return RunOutcome::Suspended(suspension),
                StepFlow::Abort(card) => {
                    self.finish_run(ctx.run.clone(), RunState::Failed, Some(card.clone())).await;
                    return RunOutcome::Failed(card);
                }
            }
        }

        self.finish_run(ctx.run.clone(), RunState::Completed, None).await;
        RunOutcome::Completed
    }

    async fn execute_step(&self, ctx: &mut RunContext, step: &Step) -> StepFlow {
        let run_id = ctx.run.run_id;
        let started_at = Utc::now();

        // (1) Conditional gate.
        if let Some(when) = &step.when {
            let compiled = match WhenExpr::compile(when) {
                Ok(compiled) => compiled,
                Err(e) => {
                    return self
                        .commit_failure(
                            ctx,
                            step,
                            started_at,
                            0,
                            StepError::new(ErrorCode::ValidationFailed, e.to_string()),
                            Vec::new(),
                        )
                        .await;
                }
            };
            match compiled.evaluate(&ctx.eval_context()) {
                Ok(true) => {}
                Ok(false) => {
                    let result = StepResult {
                        step_index: step.index,
                        status: StepStatus::Skipped,
                        started_at,
                        duration_ms: 0,
                        output: Map::new(),
                        recovery_actions: Vec::new(),
                        evidence: Vec::new(),
                        error: None,
                    };
                    self.record_result(ctx, step.index, result, None).await;
                    return StepFlow::Continue;
                }
                Err(e) => {
                    return self
                        .commit_failure(
                            ctx,
                            step,
                            started_at,
                            0,
                            StepError::new(ErrorCode::ValidationFailed, e.to_string()),
                            Vec::new(),
                        )
                        .await;
                }
            }
        }

        // human_confirm synchronizes with the approval store and may
        // suspend; it bypasses substitution and retries.
        if step.action == "human_confirm" {
            return self.execute_human_confirm(ctx, step, started_at).await;
        }

        // (2) Substitution: variables and step outputs first, secrets
        // resolved last so they can be masked on the way out.
        let rendered = match expr::render_value(&Value::Object(step.params.clone()), &ctx.eval_context()) {
            Ok(Value::Object(map)) => map,
            Ok(_) => unreachable!("object renders to object"),
            Err(e) => {
                return self
                    .commit_failure(
                        ctx,
                        step,
                        started_at,
                        0,
                        StepError::new(ErrorCode::ValidationFailed, e.to_string()),
                        Vec::new(),
                    )
                    .await;
            }
        };
        let rendered = match self.resolve_secrets(ctx, step.index, rendered).await {
            Ok(rendered) => rendered,
            Err(e) => {
                return self.commit_failure(ctx, step, started_at, 0, e, Vec::new()).await;
            }
        };

        let action = match Action::from_parts(&step.action, &rendered) {
            Ok(action) => action,
            Err(e) => {
                return self
                    .commit_failure(
                        ctx,
                        step,
                        started_at,
                        0,
                        StepError::new(
                            ErrorCode::ValidationFailed,
                            format!("invalid params for {}: {e}", step.action),
                        ),
                        Vec::new(),
                    )
                    .await;
            }
        };

        // (5) Verification actions route through the verifier.
        if action.is_verification() {
            return self.execute_verification(ctx, step, &action, started_at).await;
        }

        // (3,6) Dispatch with retry policy and self-recovery.
        let retry = self.effective_retry(ctx);
        let timeout = Duration::from_millis(step.timeout_ms.unwrap_or(DEFAULT_STEP_TIMEOUT_MS));
        let mut recovery_notes: Vec<RecoveryNote> = Vec::new();
        let mut patched_this_step = false;
        let mut recovery_enabled = false;
        let mut attempt = 0u32;
        let mut current_action = action;

        let failure = loop {
            attempt += 1;
            self.services.metrics.record(MetricEvent::StepExecuted);
            let dispatched = tokio::time::timeout(
                timeout,
                self.dispatch(
                    ctx,
                    step.index,
                    &current_action,
                    recovery_enabled,
                    &mut recovery_notes,
                ),
            )
            .await
            .unwrap_or_else(|_| {
                Err(StepError::new(
                    ErrorCode::Timeout,
                    format!("step timed out after {}ms", timeout.as_millis()),
                ))
            });

            match dispatched {
                Ok(output) => {
                    let duration_ms = elapsed_ms(started_at);
                    if duration_ms > TIMING_THRESHOLD_MS {
                        self.note_deviation(
                            ctx,
                            step.index,
                            DeviationKind::Timing,
                            format!("step took {duration_ms}ms"),
                        )
                        .await;
                    }
                    self.check_domain_drift(ctx, step.index).await;
                    let evidence = self.capture_evidence(ctx, step.index).await;
                    let result = StepResult {
                        step_index: step.index,
                        status: if attempt > 1 {
                            StepStatus::Retry
                        } else {
                            StepStatus::Pass
                        },
                        started_at,
                        duration_ms,
                        output: mask_map(&ctx.vault, output),
                        recovery_actions: recovery_notes,
                        evidence,
                        error: None,
                    };
                    self.record_result(ctx, step.index, result, None).await;
                    // The step committed; a safe-fail demanded during it
                    // suspends the run before the next one.
                    if let Some(reason) = ctx.pending_safe_fail.take() {
                        return self.safe_fail(ctx, step.index + 1, step.index, reason).await;
                    }
                    return StepFlow::Continue;
                }
                Err(error) => {
                    tracing::warn!(
                        run_id,
                        step_index = step.index,
                        attempt,
                        code = %error.code(),
                        "step attempt failed"
                    );

                    if error.code() == ErrorCode::WebElementNotFound {
                        // One differential patch per failure; when it is
                        // not adopted, fall back to the deterministic
                        // at-most-once label recovery.
                        if !patched_this_step {
                            patched_this_step = true;
                            if let Some(new_action) =
                                self.try_patch(ctx, step, &current_action, &error).await
                            {
                                current_action = new_action;
                                continue;
                            }
                        }
                        if !recovery_enabled {
                            recovery_enabled = true;
                            continue;
                        }
                    }

                    if error.code().is_retryable() && attempt < retry.max_attempts {
                        self.services.metrics.record(MetricEvent::StepRetried);
                        let backoff = retry.backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16));
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                        continue;
                    }
                    if error.code().is_retryable() && retry.max_attempts > 1 {
                        self.note_deviation(
                            ctx,
                            step.index,
                            DeviationKind::RetryCap,
                            format!("retries exhausted after {attempt} attempts"),
                        )
                        .await;
                    }
                    break error;
                }
            }
        };

        if failure.code() == ErrorCode::DownloadTimeout
            || failure.code() == ErrorCode::DownloadIncomplete
        {
            self.note_deviation(
                ctx,
                step.index,
                DeviationKind::DownloadFail,
                failure.to_string(),
            )
            .await;
        }
        if failure.code() == ErrorCode::OsCapabilityMiss {
            self.services.metrics.record(MetricEvent::OsCapabilityMiss);
            // A step may declare a graceful fallback for hosts missing
            // the capability; without one the failure stands.
            let declared_skip = step
                .params
                .get("on_capability_miss")
                .and_then(Value::as_str)
                == Some("skip");
            if declared_skip {
                let result = StepResult {
                    step_index: step.index,
                    status: StepStatus::Skipped,
                    started_at,
                    duration_ms: elapsed_ms(started_at),
                    output: Map::new(),
                    recovery_actions: vec![RecoveryNote {
                        action: "capability_fallback".to_string(),
                        detail: failure.to_string(),
                    }],
                    evidence: Vec::new(),
                    error: None,
                };
                self.record_result(ctx, step.index, result, None).await;
                return StepFlow::Continue;
            }
        }

        // A safe-fail outranks the step failure: the run pauses for a
        // human instead of dying.
        if let Some(reason) = ctx.pending_safe_fail.take() {
            return self.safe_fail(ctx, step.index, step.index, reason).await;
        }

        self.commit_failure(ctx, step, started_at, elapsed_ms(started_at), failure, recovery_notes)
            .await
    }

    async fn execute_verification(
        &self,
        ctx: &mut RunContext,
        step: &Step,
        action: &Action,
        started_at: chrono::DateTime<Utc>,
    ) -> StepFlow {
        let verifier = Verifier::new(
            self.services.os.as_ref(),
            self.services.web.as_deref(),
        )
        .with_config(self.services.verifier);
        let result = verifier.run(action).await;
        self.services.metrics.record(MetricEvent::Verifier {
            outcome: result.outcome,
        });

        let evidence = self.capture_evidence(ctx, step.index).await;
        let duration_ms = elapsed_ms(started_at);

        match result.outcome {
            VerifierOutcome::Pass | VerifierOutcome::Retry => {
                let status = if result.outcome == VerifierOutcome::Pass {
                    StepStatus::Pass
                } else {
                    StepStatus::Retry
                };
                let mut output = result.details.clone();
                output.insert("status".to_string(), json!(format!("{:?}", result.outcome)));
                output.insert("message".to_string(), json!(result.message));
                let record = StepResult {
                    step_index: step.index,
                    status,
                    started_at,
                    duration_ms,
                    output: mask_map(&ctx.vault, output),
                    recovery_actions: Vec::new(),
                    evidence,
                    error: None,
                };
                self.record_result(ctx, step.index, record, None).await;
                StepFlow::Continue
            }
            VerifierOutcome::Fail => {
                let code = failure_code(action);
                let error = StepError::new(code, result.message.clone());

                // A failed wait may still be rescuable by a wait-tuning
                // patch before the run aborts.
                if code == ErrorCode::VerifierTimeout {
                    if let Some(new_action) = self.try_patch(ctx, step, action, &error).await {
                        let verifier = Verifier::new(
                            self.services.os.as_ref(),
                            self.services.web.as_deref(),
                        )
                        .with_config(self.services.verifier);
                        let retried = verifier.run(&new_action).await;
                        self.services.metrics.record(MetricEvent::Verifier {
                            outcome: retried.outcome,
                        });
                        if retried.passed() {
                            let record = StepResult {
                                step_index: step.index,
                                status: StepStatus::Retry,
                                started_at,
                                duration_ms: elapsed_ms(started_at),
                                output: mask_map(&ctx.vault, retried.details.clone()),
                                recovery_actions: vec![RecoveryNote {
                                    action: "wait_tuning".to_string(),
                                    detail: "timeout extended by planner patch".to_string(),
                                }],
                                evidence,
                                error: None,
                            };
                            self.record_result(ctx, step.index, record, None).await;
                            return StepFlow::Continue;
                        }
                    }
                }

                self.note_deviation(
                    ctx,
                    step.index,
                    DeviationKind::VerifierFail,
                    result.message.clone(),
                )
                .await;
                if let Some(reason) = ctx.pending_safe_fail.take() {
                    return self.safe_fail(ctx, step.index, step.index, reason).await;
                }

                // Verifier FAIL aborts the run.
                let record = StepResult {
                    step_index: step.index,
                    status: StepStatus::Fail,
                    started_at,
                    duration_ms,
                    output: Map::new(),
                    recovery_actions: Vec::new(),
                    evidence,
                    error: Some(error.card.clone().at_step(step.index)),
                };
                self.record_result(ctx, step.index, record, None).await;
                StepFlow::Abort(error.card.at_step(step.index))
            }
        }
    }

    async fn execute_human_confirm(
        &self,
        ctx: &mut RunContext,
        step: &Step,
        started_at: chrono::DateTime<Utc>,
    ) -> StepFlow {
        let action = match Action::from_parts(&step.action, &step.params) {
            Ok(Action::HumanConfirm {
                message,
                timeout_minutes,
                auto_action,
                required_role,
                ..
            }) => (message, timeout_minutes, auto_action, required_role),
            _ => {
                return self
                    .commit_failure(
                        ctx,
                        step,
                        started_at,
                        0,
                        StepError::new(ErrorCode::ValidationFailed, "invalid human_confirm params"),
                        Vec::new(),
                    )
                    .await;
            }
        };
        let (message, _timeout_minutes, auto_action, required_role) = action;
        // The role requirement may sit in the step envelope rather than
        // the action params.
        let required_role = required_role.or(step.required_role);

        let existing = self
            .services
            .store
            .approvals(ctx.run.run_id)
            .await
            .unwrap_or_default()
            .into_iter()
            .find(|a| a.kind == ApprovalKind::Step && a.step_index == step.index);

        match existing.map(|a| a.status) {
            Some(ApprovalStatus::Approved) => {
                let result = StepResult {
                    step_index: step.index,
                    status: StepStatus::Pass,
                    started_at,
                    duration_ms: elapsed_ms(started_at),
                    output: Map::from_iter([
                        ("approved".to_string(), json!(true)),
                        ("message".to_string(), json!(message)),
                    ]),
                    recovery_actions: Vec::new(),
                    evidence: Vec::new(),
                    error: None,
                };
                self.record_result(ctx, step.index, result, None).await;
                StepFlow::Continue
            }
            Some(ApprovalStatus::Denied) => {
                self.commit_failure(
                    ctx,
                    step,
                    started_at,
                    elapsed_ms(started_at),
                    StepError::new(ErrorCode::ApprovalDenied, "approval denied"),
                    Vec::new(),
                )
                .await
            }
            Some(ApprovalStatus::TimedOut) => match auto_action {
                AutoAction::Approve => {
                    let result = StepResult {
                        step_index: step.index,
                        status: StepStatus::Pass,
                        started_at,
                        duration_ms: elapsed_ms(started_at),
                        output: Map::from_iter([
                            ("approved".to_string(), json!(true)),
                            ("auto".to_string(), json!(true)),
                        ]),
                        recovery_actions: Vec::new(),
                        evidence: Vec::new(),
                        error: None,
                    };
                    self.record_result(ctx, step.index, result, None).await;
                    StepFlow::Continue
                }
                AutoAction::Deny => {
                    self.commit_failure(
                        ctx,
                        step,
                        started_at,
                        elapsed_ms(started_at),
                        StepError::new(ErrorCode::ApprovalTimeout, "approval timed out"),
                        Vec::new(),
                    )
                    .await
                }
            },
            Some(ApprovalStatus::Pending) | None => {
                let _ = self
                    .services
                    .store
                    .record_approval(ApprovalRecord {
                        run_id: ctx.run.run_id,
                        kind: ApprovalKind::Step,
                        step_index: step.index,
                        message: message.clone(),
                        required_role,
                        status: ApprovalStatus::Pending,
                        requested_at: Utc::now(),
                        decided_at: None,
                        approver_role: None,
                    })
                    .await;
                self.services.metrics.record(MetricEvent::ApprovalRequired);
                self.services
                    .audit
                    .append(
                        AuditEvent::now(AuditKind::Approval, json!({"message": message, "status": "pending"}))
                            .for_run(ctx.run.run_id)
                            .at_step(step.index),
                    )
                    .await;
                self.write_checkpoint(ctx, step.index).await;
                self.set_state(ctx, RunState::WaitingApproval).await;
                StepFlow::Suspend(Suspension::Approval {
                    step_index: step.index,
                })
            }
        }
    }

    /// Resolve any `{{secrets://...}}` placeholders left after variable
    /// substitution, recording each access in the audit trail.
    async fn resolve_secrets(
        &self,
        ctx: &RunContext,
        step_index: usize,
        params: Map<String, Value>,
    ) -> Result<Map<String, Value>, StepError> {
        let value = Value::Object(params);
        let refs = expr::scan_value_refs(&value)
            .map_err(|e| StepError::new(ErrorCode::ValidationFailed, e.to_string()))?;
        let mut resolved: HashMap<String, String> = HashMap::new();
        for r in refs {
            if let ExprRef::Secret { service, key } = r {
                let (outcome, access) = self
                    .services
                    .secrets
                    .resolve(service.as_deref(), &key, &ctx.vault)
                    .await;
                self.services
                    .audit
                    .append(
                        AuditEvent::now(
                            AuditKind::SecretAccess,
                            serde_json::to_value(&access).unwrap_or(Value::Null),
                        )
                        .for_run(ctx.run.run_id)
                        .at_step(step_index),
                    )
                    .await;
                let placeholder = match &service {
                    Some(service) => format!("{{{{secrets://{service}/{key}}}}}"),
                    None => format!("{{{{secrets://{key}}}}}"),
                };
                match outcome {
                    Ok(sensitive) => {
                        resolved.insert(placeholder, sensitive.expose().to_string());
                    }
                    Err(e) => {
                        return Err(StepError::new(ErrorCode::Internal, e.to_string())
                            .with_hint("store the secret or set its environment variable"));
                    }
                }
            }
        }
        let substituted = replace_placeholders(value, &resolved);
        match substituted {
            Value::Object(map) => Ok(map),
            _ => unreachable!("object stays object"),
        }
    }

    fn effective_retry(&self, ctx: &RunContext) -> RetryConfig {
        if let Some(retry) = ctx.plan.execution.as_ref().and_then(|e| e.retry) {
            return retry;
        }
        self.services
            .orchestrator
            .queues
            .get(&ctx.run.queue)
            .and_then(|q| q.retry_policy)
            .unwrap_or_default()
    }

    /// Record one deviation with the monitor and the store. A safe-fail
    /// verdict is latched into the context and honored at the next step
    /// boundary, never mid-dispatch.
    async fn note_deviation(
        &self,
        ctx: &mut RunContext,
        step_index: usize,
        kind: DeviationKind,
        reason: String,
    ) {
        let step_has_risk = !ctx.run.manifest.risk_flags.is_empty();
        let (deviation, verdict) =
            ctx.monitor
                .observe(ctx.run.run_id, step_index, kind, reason, step_has_risk);
        let _ = self.services.store.record_deviation(deviation).await;
        if let MonitorVerdict::SafeFail { reason } = verdict {
            ctx.pending_safe_fail.get_or_insert(reason);
        }
    }

    async fn safe_fail(
        &self,
        ctx: &mut RunContext,
        next_step_index: usize,
        step_index: usize,
        reason: String,
    ) -> StepFlow {
        self.write_checkpoint(ctx, next_step_index).await;
        let handoff = ctx.monitor.handoff(ctx.run.run_id, step_index, &reason);
        self.services
            .audit
            .append(
                AuditEvent::now(
                    AuditKind::Handoff,
                    serde_json::to_value(&handoff).unwrap_or(Value::Null),
                )
                .for_run(ctx.run.run_id)
                .at_step(step_index),
            )
            .await;
        self.services.metrics.record(MetricEvent::DeviationStop);
        self.set_state(ctx, RunState::Paused).await;
        tracing::warn!(run_id = ctx.run.run_id, step_index, %reason, "L4 safe-fail");
        StepFlow::Suspend(Suspension::SafeFail { reason })
    }

    async fn check_domain_drift(&self, ctx: &mut RunContext, step_index: usize) {
        let Some(web) = self.services.web.as_ref() else {
            return;
        };
        let Some(url) = web.current_url().await else {
            return;
        };
        let Some(domain) = extract_domain(&url) else {
            return;
        };
        if ctx.run.manifest.target_domains.is_empty() {
            return;
        }
        let expected = ctx
            .run
            .manifest
            .target_domains
            .iter()
            .any(|d| domain == *d || domain.ends_with(&format!(".{d}")));
        if !expected {
            self.note_deviation(
                ctx,
                step_index,
                DeviationKind::DomainDrift,
                format!("navigated to unexpected domain {domain}"),
            )
            .await;
        }
    }

    async fn try_patch(
        &self,
        ctx: &mut RunContext,
        step: &Step,
        action: &Action,
        error: &StepError,
    ) -> Option<Action> {
        let schema = match self.services.web.as_ref() {
            Some(web) => web.capture_dom_schema("page").await.ok(),
            None => None,
        };
        let patch = self
            .services
            .planner
            .propose(step.index, action, error, schema.as_ref())?;

        self.services.metrics.record(MetricEvent::PatchProposed);
        self.services
            .audit
            .append(
                AuditEvent::now(
                    AuditKind::PatchProposed,
                    serde_json::to_value(&patch).unwrap_or(Value::Null),
                )
                .for_run(ctx.run.run_id)
                .at_step(step.index),
            )
            .await;

        let decision = self.services.planner.evaluate_adoption(
            &patch,
            &AdoptionContext {
                autopilot_enabled: ctx.autopilot,
                policy_window_open: ctx.policy_window_open,
                policy: &self.services.policy.config().adopt_policy,
                changes_this_run: ctx.auto_changes,
            },
        );
        match decision {
            AdoptionDecision::AutoAdopt => {}
            other => {
                self.services
                    .audit
                    .append(
                        AuditEvent::now(
                            AuditKind::PatchRefused,
                            serde_json::to_value(&other).unwrap_or(Value::Null),
                        )
                        .for_run(ctx.run.run_id)
                        .at_step(step.index),
                    )
                    .await;
                return None;
            }
        }

        match self.services.planner.apply(&ctx.plan, &patch) {
            Ok(patched) => {
                ctx.plan = patched;
                ctx.auto_changes += 1;
                self.services.metrics.record(MetricEvent::PatchAutoAdopted);
                self.services
                    .audit
                    .append(
                        AuditEvent::now(
                            AuditKind::PatchAdopted,
                            serde_json::to_value(&patch).unwrap_or(Value::Null),
                        )
                        .for_run(ctx.run.run_id)
                        .at_step(step.index),
                    )
                    .await;
                // Re-render the action from the patched step params,
                // secrets last as in the main substitution path.
                let patched_step = ctx.plan.steps.get(step.index)?.clone();
                let rendered = expr::render_value(
                    &Value::Object(patched_step.params.clone()),
                    &ctx.eval_context(),
                )
                .ok()?;
                let rendered = self
                    .resolve_secrets(ctx, step.index, rendered.as_object()?.clone())
                    .await
                    .ok()?;
                Action::from_parts(&patched_step.action, &rendered).ok()
            }
            Err(refused) => {
                self.services
                    .audit
                    .append(
                        AuditEvent::now(AuditKind::PatchRefused, json!({"reason": refused.to_string()}))
                            .for_run(ctx.run.run_id)
                            .at_step(step.index),
                    )
                    .await;
                None
            }
        }
    }

    async fn capture_evidence(&self, ctx: &RunContext, step_index: usize) -> Vec<EvidenceKey> {
        let Some(config) = ctx.plan.execution.as_ref().and_then(|e| e.evidence) else {
            return Vec::new();
        };
        let mut keys = Vec::new();
        let artifacts = Path::new(&self.services.orchestrator.artifacts_dir);

        if config.screenshots {
            let key = EvidenceKey {
                run_id: ctx.run.run_id,
                step_index,
                kind: EvidenceKind::Screenshot,
            };
            let path = artifacts.join(key.artifact_path());
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match self.services.os.take_screenshot(&path).await {
                Ok(()) => {
                    let _ = self
                        .services
                        .store
                        .record_evidence(Evidence {
                            key: key.clone(),
                            captured_at: Utc::now(),
                            path: path.to_string_lossy().into_owned(),
                        })
                        .await;
                    keys.push(key);
                }
                Err(e) => tracing::warn!(error = %e, "screenshot capture failed"),
            }
        }

        if config.dom_schemas {
            let schema = match self.services.web.as_ref() {
                Some(web) if web.current_url().await.is_some() => {
                    web.capture_dom_schema("page").await.ok()
                }
                _ => self.services.os.capture_screen_schema("frontmost").await.ok(),
            };
            if let Some(schema) = schema {
                let key = EvidenceKey {
                    run_id: ctx.run.run_id,
                    step_index,
                    kind: EvidenceKind::DomSchema,
                };
                let path = artifacts.join(key.artifact_path());
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let masked = ctx
                    .vault
                    .mask_value(&serde_json::to_value(&schema).unwrap_or(Value::Null));
                if std::fs::write(&path, serde_json::to_vec_pretty(&masked).unwrap_or_default())
                    .is_ok()
                {
                    let _ = self
                        .services
                        .store
                        .record_evidence(Evidence {
                            key: key.clone(),
                            captured_at: Utc::now(),
                            path: path.to_string_lossy().into_owned(),
                        })
                        .await;
                    keys.push(key);
                    self.services.metrics.record(MetricEvent::SchemaCaptured);
                }
            }
        }

        keys
    }

    async fn record_result(
        &self,
        ctx: &mut RunContext,
        step_index: usize,
        result: StepResult,
        error: Option<&ErrorCard>,
    ) {
        if ctx.step_outputs.len() <= step_index {
            ctx.step_outputs.resize(step_index + 1, None);
        }
        // Outputs stay visible to later steps even though the persisted
        // copy is masked.
        if matches!(result.status, StepStatus::Pass | StepStatus::Retry) {
            ctx.step_outputs[step_index] = Some(result.output.clone());
        }
        let _ = self
            .services
            .store
            .record_step(ctx.run.run_id, result)
            .await;
        if let Some(card) = error {
            self.services.metrics.record(MetricEvent::Failure {
                code: card.code,
                message: ctx.vault.mask_str(&card.message),
            });
        }
    }

    async fn commit_failure(
        &self,
        ctx: &mut RunContext,
        step: &Step,
        started_at: chrono::DateTime<Utc>,
        duration_ms: u64,
        error: StepError,
        recovery_actions: Vec<RecoveryNote>,
    ) -> StepFlow {
        let mut card = error.card.clone().at_step(step.index);
        card.message = ctx.vault.mask_str(&card.message);
        let evidence = self.capture_evidence(ctx, step.index).await;
        let result = StepResult {
            step_index: step.index,
            status: StepStatus::Fail,
            started_at,
            duration_ms,
            output: Map::new(),
            recovery_actions,
            evidence,
            error: Some(card.clone()),
        };
        self.record_result(ctx, step.index, result, Some(&card)).await;
        StepFlow::Abort(card)
    }

    // -----------------------------------------------------------------
    // Action dispatch
    // -----------------------------------------------------------------

    async fn dispatch(
        &self,
        ctx: &mut RunContext,
        step_index: usize,
        action: &Action,
        recovery_enabled: bool,
        recovery: &mut Vec<RecoveryNote>,
    ) -> Result<Map<String, Value>, StepError> {
        let os = self.services.os.as_ref();
        let dry = ctx.dry_run;
        match action {
            Action::FindFiles { query, roots, limit } => {
                let mut found = os.find_files(query, roots, *limit).await?;
                if found.is_empty() && recovery.iter().all(|n| n.action != "widen_search") {
                    // Self-recovery: widen one level up the tree, once.
                    let widened: Vec<String> = roots
                        .iter()
                        .map(|root| parent_of(root))
                        .collect();
                    recovery.push(RecoveryNote {
                        action: "widen_search".to_string(),
                        detail: format!("no matches under {roots:?}, retrying in {widened:?}"),
                    });
                    found = os.find_files(query, &widened, *limit).await?;
                }
                ctx.flow.files = found.clone();
                ctx.flow.newnames = None;
                Ok(Map::from_iter([
                    ("found".to_string(), json!(found.len())),
                    ("paths".to_string(), json!(found)),
                ]))
            }
            Action::Rename { pattern } => {
                // Non-destructive: compute target basenames for a later
                // move. `{date}`, `{index}`, `{basename}` placeholders.
                let date = Utc::now().format("%Y-%m-%d").to_string();
                let newnames: Vec<String> = ctx
                    .flow
                    .files
                    .iter()
                    .enumerate()
                    .map(|(i, path)| {
                        let basename = Path::new(path)
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        pattern
                            .replace("{date}", &date)
                            .replace("{index}", &(i + 1).to_string())
                            .replace("{basename}", &basename)
                    })
                    .collect();
                ctx.flow.newnames = Some(newnames.clone());
                Ok(Map::from_iter([(
                    "renamed_previews".to_string(),
                    json!(newnames.iter().take(10).collect::<Vec<_>>()),
                )]))
            }
            Action::MoveTo { dest } => {
                if dry {
                    return Ok(Map::from_iter([(
                        "would_move".to_string(),
                        json!(ctx.flow.files.len()),
                    )]));
                }
                let newnames = ctx.flow.newnames.clone();
                let files = ctx.flow.files.clone();
                let mut created_dir = false;
                let moved = match os.move_files(&files, dest, newnames.as_deref()).await {
                    Ok(moved) => moved,
                    Err(e)
                        if e.code() == ErrorCode::FileNotFound
                            && e.to_string().contains("destination")
                            && recovery.iter().all(|n| n.action != "create_dest") =>
                    {
                        // Self-recovery: create the missing destination
                        // directory and retry once.
                        os.create_dir(dest).await?;
                        created_dir = true;
                        recovery.push(RecoveryNote {
                            action: "create_dest".to_string(),
                            detail: format!("created missing destination {dest}"),
                        });
                        os.move_files(&files, dest, newnames.as_deref()).await?
                    }
                    Err(e) => return Err(e),
                };
                ctx.flow.files = moved.clone();
                ctx.flow.newnames = None;
                Ok(Map::from_iter([
                    ("moved".to_string(), json!(moved.len())),
                    ("paths".to_string(), json!(moved)),
                    ("created_dir".to_string(), json!(created_dir)),
                ]))
            }
            Action::ZipFolder { folder, out } => {
                if dry {
                    return Ok(Map::from_iter([("would_zip".to_string(), json!(folder))]));
                }
                let zip = os.zip_folder(folder, out).await?;
                Ok(Map::from_iter([("zip".to_string(), json!(zip))]))
            }
            Action::PdfMerge { inputs, out } => {
                let inputs = if inputs.is_empty() {
                    ctx.flow.files.clone()
                } else {
                    inputs.clone()
                };
                if dry {
                    return Ok(Map::from_iter([(
                        "would_merge".to_string(),
                        json!(inputs.len()),
                    )]));
                }
                let page_count = os.pdf_merge(&inputs, out).await?;
                Ok(Map::from_iter([
                    ("path".to_string(), json!(out)),
                    ("page_count".to_string(), json!(page_count)),
                ]))
            }
            Action::PdfExtractPages { path, ranges, out } => {
                if dry {
                    return Ok(Map::from_iter([(
                        "would_extract".to_string(),
                        json!(ranges),
                    )]));
                }
                let page_count = os.pdf_extract_pages(path, ranges, out).await?;
                Ok(Map::from_iter([
                    ("path".to_string(), json!(out)),
                    ("page_count".to_string(), json!(page_count)),
                ]))
            }
            Action::ComposeMail { to, subject, body } => {
                if dry {
                    return Ok(Map::from_iter([("would_compose".to_string(), json!(true))]));
                }
                let draft_id = os.compose_mail(to, subject, body).await?;
                ctx.flow.draft_id = Some(draft_id.clone());
                Ok(Map::from_iter([("draft_id".to_string(), json!(draft_id))]))
            }
            Action::AttachFiles { files } => {
                if dry {
                    return Ok(Map::from_iter([(
                        "would_attach".to_string(),
                        json!(files.len()),
                    )]));
                }
                let draft_id = ctx.flow.draft_id.clone().ok_or_else(|| {
                    StepError::new(ErrorCode::ValidationFailed, "attach_files before compose_mail")
                })?;
                os.attach_files(&draft_id, files).await?;
                Ok(Map::from_iter([
                    ("attached".to_string(), json!(files.len())),
                    ("draft_id".to_string(), json!(draft_id)),
                ]))
            }
            Action::SaveDraft => {
                if dry {
                    return Ok(Map::from_iter([("would_save".to_string(), json!(true))]));
                }
                let draft_id = ctx.flow.draft_id.clone().ok_or_else(|| {
                    StepError::new(ErrorCode::ValidationFailed, "save_draft before compose_mail")
                })?;
                os.save_draft(&draft_id).await?;
                Ok(Map::from_iter([
                    ("saved".to_string(), json!(true)),
                    ("draft_id".to_string(), json!(draft_id)),
                ]))
            }
            Action::OpenBrowser { url } => {
                let web = self.web()?;
                web.open(url, "default").await?;
                Ok(Map::from_iter([
                    ("url".to_string(), json!(url)),
                    ("opened".to_string(), json!(true)),
                ]))
            }
            Action::FillByLabel { label, text, frame } => {
                let web = self.web()?;
                let mut target = ElementTarget::by_label(label);
                target.frame = frame.clone();
                match web.fill(&target, text).await {
                    Ok(()) => {}
                    Err(e) if e.code() == ErrorCode::WebElementNotFound && recovery_enabled => {
                        self.label_recovery_fill(ctx, step_index, label, text, recovery)
                            .await?;
                    }
                    Err(e) => return Err(e),
                }
                Ok(Map::from_iter([("filled".to_string(), json!(label))]))
            }
            Action::ClickByText { text, role, frame } => {
                let web = self.web()?;
                let mut target = ElementTarget::by_text(text, role.as_deref());
                target.frame = frame.clone();
                match web.click(&target).await {
                    Ok(()) => {}
                    Err(e) if e.code() == ErrorCode::WebElementNotFound && recovery_enabled => {
                        self.label_recovery_click(ctx, step_index, text, role.as_deref(), recovery)
                            .await?;
                    }
                    Err(e) => return Err(e),
                }
                Ok(Map::from_iter([("clicked".to_string(), json!(text))]))
            }
            Action::UploadFile {
                selector,
                label,
                path,
            } => {
                let web = self.web()?;
                let target = ElementTarget {
                    selector: selector.clone(),
                    label: label.clone(),
                    ..Default::default()
                };
                let result = web.upload(&target, path).await;
                self.services.metrics.record(MetricEvent::WebUpload {
                    success: result.is_ok(),
                });
                result?;
                Ok(Map::from_iter([("uploaded".to_string(), json!(path))]))
            }
            Action::DownloadFile { url, to } => {
                let web = self.web()?;
                web.download(url, to).await?;
                Ok(Map::from_iter([
                    ("url".to_string(), json!(url)),
                    ("to".to_string(), json!(to)),
                ]))
            }
            Action::WaitForDownload { to, timeout_ms } => {
                let web = self.web()?;
                let bytes = web.wait_for_download(to, *timeout_ms).await?;
                Ok(Map::from_iter([
                    ("path".to_string(), json!(to)),
                    ("bytes".to_string(), json!(bytes)),
                ]))
            }
            Action::CaptureScreenSchema { target } => {
                let schema = match self.services.web.as_ref() {
                    Some(web) if web.current_url().await.is_some() => {
                        web.capture_dom_schema(target).await?
                    }
                    _ => os.capture_screen_schema(target).await?,
                };
                self.services.metrics.record(MetricEvent::SchemaCaptured);
                Ok(Map::from_iter([
                    ("captured".to_string(), json!(true)),
                    ("element_count".to_string(), json!(schema.elements.len())),
                ]))
            }
            Action::PolicyGuard => {
                let decisions = self
                    .services
                    .store
                    .policy_decisions(ctx.run.run_id)
                    .await
                    .unwrap_or_default();
                let checks = decisions
                    .last()
                    .map(|d| serde_json::to_value(&d.checks).unwrap_or(Value::Null))
                    .unwrap_or(Value::Null);
                Ok(Map::from_iter([("checks".to_string(), checks)]))
            }
            Action::Log { message } => {
                tracing::info!(run_id = ctx.run.run_id, step_index, "{message}");
                Ok(Map::from_iter([("message".to_string(), json!(message))]))
            }
            Action::HumanConfirm { .. } => unreachable!("handled before dispatch"),
            Action::WaitForElement { .. }
            | Action::AssertElement { .. }
            | Action::AssertText { .. }
            | Action::AssertFileExists { .. }
            | Action::AssertPdfPages { .. } => unreachable!("verifier actions handled separately"),
        }
    }

    fn web(&self) -> Result<&dyn crate::adapters::WebEngine, StepError> {
        self.services.web.as_deref().ok_or_else(|| {
            StepError::new(
                ErrorCode::OsCapabilityMiss,
                "no web engine configured for this host",
            )
        })
    }

    /// Label self-recovery: one pass over the built-in synonym table and
    /// placeholder/aria-label fallback. Engaging it is itself an
    /// unexpected-UI deviation.
    async fn label_recovery_click(
        &self,
        ctx: &mut RunContext,
        step_index: usize,
        text: &str,
        role: Option<&str>,
        recovery: &mut Vec<RecoveryNote>,
    ) -> Result<(), StepError> {
        if recovery.iter().any(|n| n.action == "label_synonyms") {
            return Err(StepError::new(
                ErrorCode::WebElementNotFound,
                format!("no element with text '{text}'"),
            ));
        }
        let web = self.web()?;
        let synonyms = crate::planner::SYNONYM_TABLE
            .iter()
            .find(|(key, _)| *key == text)
            .map(|(_, synonyms)| *synonyms)
            .unwrap_or(&[]);
        for synonym in synonyms.iter().copied() {
            if web
                .click(&ElementTarget::by_text(synonym, role))
                .await
                .is_ok()
            {
                recovery.push(RecoveryNote {
                    action: "label_synonyms".to_string(),
                    detail: format!("clicked synonym '{synonym}' for '{text}'"),
                });
                // Landing on text with destructive vocabulary the plan
                // never declared is a risk escalation.
                let escalated: Vec<_> = crate::manifest::risks_in_text(synonym)
                    .into_iter()
                    .filter(|r| !ctx.run.manifest.risk_flags.contains(r))
                    .collect();
                if !escalated.is_empty() {
                    self.note_deviation(
                        ctx,
                        step_index,
                        DeviationKind::RiskEscalation,
                        format!("recovery clicked '{synonym}' introducing risks {escalated:?}"),
                    )
                    .await;
                } else {
                    self.note_deviation(
                        ctx,
                        step_index,
                        DeviationKind::UnexpectedElement,
                        format!("label '{text}' replaced by '{synonym}' at runtime"),
                    )
                    .await;
                }
                return Ok(());
            }
        }
        Err(StepError::new(
            ErrorCode::WebElementNotFound,
            format!("no element with text '{text}' (synonyms exhausted)"),
        ))
    }

    async fn label_recovery_fill(
        &self,
        ctx: &mut RunContext,
        step_index: usize,
        label: &str,
        text: &str,
        recovery: &mut Vec<RecoveryNote>,
    ) -> Result<(), StepError> {
        if recovery.iter().any(|n| n.action == "label_synonyms") {
            return Err(StepError::new(
                ErrorCode::WebElementNotFound,
                format!("no element matching label '{label}'"),
            ));
        }
        let web = self.web()?;
        // Placeholder / aria-label fallback: find an element whose
        // placeholder or aria-label carries the requested label, then
        // address it by that facet.
        let schema = web.capture_dom_schema("page").await?;
        let fallback = schema
            .elements
            .iter()
            .filter(|e| e.matches(Some(label), None))
            .find_map(|e| e.placeholder.clone().or_else(|| e.aria_label.clone()));
        if let Some(fallback_label) = fallback {
            let target = ElementTarget {
                selector: Some(fallback_label.clone()),
                ..Default::default()
            };
            if web.fill(&target, text).await.is_ok() {
                recovery.push(RecoveryNote {
                    action: "label_synonyms".to_string(),
                    detail: format!("filled via placeholder/aria fallback '{fallback_label}'"),
                });
                self.note_deviation(
                    ctx,
                    step_index,
                    DeviationKind::UnexpectedElement,
                    format!("label '{label}' resolved via fallback at runtime"),
                )
                .await;
                return Ok(());
            }
        }
        Err(StepError::new(
            ErrorCode::WebElementNotFound,
            format!("no element matching label '{label}' (fallback exhausted)"),
        ))
    }
}

fn elapsed_ms(started_at: chrono::DateTime<Utc>) -> u64 {
    (Utc::now() - started_at).num_milliseconds().max(0) as u64
}

fn parent_of(root: &str) -> String {
    Path::new(root)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.to_string())
}

fn mask_map(vault: &SecretVault, map: Map<String, Value>) -> Map<String, Value> {
    match vault.mask_value(&Value::Object(map)) {
        Value::Object(masked) => masked,
        _ => Map::new(),
    }
}

fn replace_placeholders(value: Value, resolved: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) => {
            let mut out = s;
            for (placeholder, secret) in resolved {
                if out.contains(placeholder.as_str()) {
                    out = out.replace(placeholder.as_str(), secret);
                }
            }
            Value::String(out)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| replace_placeholders(item, resolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, replace_placeholders(v, resolved)))
                .collect(),
        ),
        other => other,
    }
}

fn ctx_engine_url(checkpoint: &Checkpoint) -> Option<String> {
    checkpoint
        .engine_contexts
        .get("web")
        .and_then(|v| v.get("url"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
