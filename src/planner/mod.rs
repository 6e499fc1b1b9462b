//! Planner-L2: differential patch proposals.
//!
//! On a step failure the planner proposes at most one small patch:
//! a text replacement sourced from the captured schema, a bounded
//! fallback search, or a timeout increase. Patches are applied to an
//! in-memory copy of the plan for the remainder of the run; the template
//! file on disk is never modified. Application refuses any patch that
//! would grow the plan's risk set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::adapters::ScreenSchema;
use crate::dsl::schema::{Action, Plan};
use crate::error::{ErrorCode, StepError};
use crate::manifest::derive_manifest;
use crate::policy::AdoptPolicy;

/// Bounded, read-only synonym table for UI label recovery. Loaded once;
/// never expanded at runtime.
pub const SYNONYM_TABLE: &[(&str, &[&str])] = &[
    ("送信", &["確定", "送出", "提出", "実行"]),
    ("確定", &["送信", "OK", "決定", "完了"]),
    ("提出", &["送信", "確定", "送出"]),
    ("キャンセル", &["取消", "中止", "戻る", "Cancel"]),
    ("保存", &["Save", "登録", "適用"]),
    ("Submit", &["Send", "Confirm", "OK", "Execute"]),
    ("Cancel", &["Close", "Abort", "Back", "キャンセル"]),
    ("Save", &["Store", "Apply", "保存"]),
    ("Edit", &["Modify", "Change", "編集"]),
    ("Upload", &["Attach", "Browse", "アップロード"]),
];

/// Maximum synonyms carried by a fallback-search patch.
pub const MAX_FALLBACK_SYNONYMS: usize = 4;

/// Cap applied by wait tuning.
pub const WAIT_TUNING_CAP_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchRisk {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchPayload {
    ReplaceText {
        find: String,
        replace_with: String,
        role: Option<String>,
    },
    FallbackSearch {
        goal: String,
        synonyms: Vec<String>,
        role: Option<String>,
        attempts: u32,
    },
    WaitTuning {
        step_index: usize,
        timeout_ms: u64,
    },
    AddStep {
        at_index: usize,
        step: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub payload: PatchPayload,
    pub confidence: f64,
    pub risk_level: PatchRisk,
    pub generated_at: DateTime<Utc>,
}

impl Patch {
    fn new(payload: PatchPayload, confidence: f64, risk_level: PatchRisk) -> Self {
        Patch {
            payload,
            confidence,
            risk_level,
            generated_at: Utc::now(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.payload {
            PatchPayload::ReplaceText { .. } => "replace_text",
            PatchPayload::FallbackSearch { .. } => "fallback_search",
            PatchPayload::WaitTuning { .. } => "wait_tuning",
            PatchPayload::AddStep { .. } => "add_step",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdoptionDecision {
    AutoAdopt,
    RequiresConfirmation { reason: String },
    Blocked { reason: String },
}

/// Context for the adoption decision, assembled by the executor.
#[derive(Debug, Clone, Copy)]
pub struct AdoptionContext<'a> {
    pub autopilot_enabled: bool,
    pub policy_window_open: bool,
    pub policy: &'a AdoptPolicy,
    pub changes_this_run: u32,
}

pub struct PlannerL2;

impl PlannerL2 {
    pub fn new() -> Self {
        PlannerL2
    }

    /// Propose at most one patch for a failing step.
    pub fn propose(
        &self,
        step_index: usize,
        action: &Action,
        error: &StepError,
        schema: Option<&ScreenSchema>,
    ) -> Option<Patch> {
        match error.code() {
            ErrorCode::WebElementNotFound => {
                let (target, role) = match action {
                    Action::ClickByText { text, role, .. } => (text.clone(), role.clone()),
                    Action::FillByLabel { label, .. } => (label.clone(), None),
                    _ => return None,
                };
                if let Some(patch) = self.replace_text_patch(&target, role.as_deref(), schema) {
                    return Some(patch);
                }
                self.fallback_search_patch(&target, role.as_deref())
            }
            ErrorCode::VerifierTimeout | ErrorCode::Timeout => match action {
                Action::WaitForElement { timeout_ms, .. } => Some(Patch::new(
                    PatchPayload::WaitTuning {
                        step_index,
                        timeout_ms: (timeout_ms * 2).min(WAIT_TUNING_CAP_MS),
                    },
                    0.85,
                    PatchRisk::Low,
                )),
                _ => None,
            },
            _ => None,
        }
    }

    /// Propose a literal replacement when the schema contains a known
    /// synonym of the missing target. Confidence increases with match
    /// strength (earlier table entries are stronger synonyms). Risk is
    /// low because the role is preserved.
    fn replace_text_patch(
        &self,
        target: &str,
        role: Option<&str>,
        schema: Option<&ScreenSchema>,
    ) -> Option<Patch> {
        let schema = schema?;
        let synonyms = synonyms_for(target)?;
        for (rank, synonym) in synonyms.iter().enumerate() {
            let present = schema
                .elements
                .iter()
                .any(|e| e.matches(Some(synonym), role));
            if present {
                let confidence = match_confidence(rank);
                return Some(Patch::new(
                    PatchPayload::ReplaceText {
                        find: target.to_string(),
                        replace_with: (*synonym).to_string(),
                        role: role.map(str::to_string),
                    },
                    confidence,
                    PatchRisk::Low,
                ));
            }
        }
        None
    }

    fn fallback_search_patch(&self, target: &str, role: Option<&str>) -> Option<Patch> {
        let synonyms = synonyms_for(target)?;
        let bounded: Vec<String> = synonyms
            .iter()
            .take(MAX_FALLBACK_SYNONYMS)
            .map(|s| (*s).to_string())
            .collect();
        Some(Patch::new(
            PatchPayload::FallbackSearch {
                goal: format!("{target} {}", role.unwrap_or("element")),
                synonyms: bounded,
                role: role.map(str::to_string),
                attempts: 1,
            },
            0.88,
            PatchRisk::Low,
        ))
    }

    /// Adoption policy: auto-adopt only when autopilot is on, the policy
    /// window is open, risk is low, confidence clears the bar, and the
    /// per-run change budget is not exhausted.
    pub fn evaluate_adoption(&self, patch: &Patch, ctx: &AdoptionContext<'_>) -> AdoptionDecision {
        if patch.risk_level == PatchRisk::High {
            return AdoptionDecision::Blocked {
                reason: "high-risk patches are blocked by policy".to_string(),
            };
        }
        if patch.confidence < ctx.policy.min_confidence {
            return AdoptionDecision::RequiresConfirmation {
                reason: format!(
                    "confidence {:.2} below threshold {:.2}",
                    patch.confidence, ctx.policy.min_confidence
                ),
            };
        }
        if ctx.changes_this_run >= ctx.policy.max_auto_changes {
            return AdoptionDecision::RequiresConfirmation {
                reason: format!(
                    "auto-change budget exhausted ({})",
                    ctx.policy.max_auto_changes
                ),
            };
        }
        if patch.risk_level == PatchRisk::Low
            && ctx.policy.low_risk_auto
            && ctx.autopilot_enabled
            && ctx.policy_window_open
        {
            return AdoptionDecision::AutoAdopt;
        }
        AdoptionDecision::RequiresConfirmation {
            reason: "outside the autopilot window".to_string(),
        }
    }

    /// Apply a patch to an in-memory copy of the plan. Refused with
    /// `POLICY_BLOCKED` if the rewritten plan's risk set grows.
    pub fn apply(&self, plan: &Plan, patch: &Patch) -> Result<Plan, StepError> {
        let mut patched = plan.clone();
        match &patch.payload {
            PatchPayload::ReplaceText {
                find, replace_with, ..
            } => {
                for step in &mut patched.steps {
                    for key in ["text", "label"] {
                        if step.params.get(key).and_then(Value::as_str) == Some(find.as_str()) {
                            step.params
                                .insert(key.to_string(), Value::String(replace_with.clone()));
                        }
                    }
                }
            }
            PatchPayload::WaitTuning {
                step_index,
                timeout_ms,
            } => {
                let step = patched.steps.get_mut(*step_index).ok_or_else(|| {
                    StepError::new(ErrorCode::Internal, "wait_tuning step index out of range")
                })?;
                step.params
                    .insert("timeout_ms".to_string(), json!(timeout_ms));
            }
            PatchPayload::FallbackSearch {
                goal,
                synonyms,
                role,
                attempts,
            } => {
                // Recorded as plan metadata: the executor's label
                // recovery consults it on the next attempt.
                patched.variables.insert(
                    "_fallback_search".to_string(),
                    json!({
                        "goal": goal,
                        "synonyms": synonyms,
                        "role": role,
                        "attempts": attempts,
                    }),
                );
            }
            PatchPayload::AddStep { at_index, step } => {
                let at = (*at_index).min(patched.steps.len());
                let new_step = crate::dsl::parser::parse_step_value(at, step)
                    .map_err(|e| StepError::new(ErrorCode::Internal, e.to_string()))?;
                patched.steps.insert(at, new_step);
                for (i, step) in patched.steps.iter_mut().enumerate() {
                    step.index = i;
                }
            }
        }

        let before = derive_manifest(plan);
        let after = derive_manifest(&patched);
        if !after.risk_flags.is_subset(&before.risk_flags) {
            return Err(StepError::new(
                ErrorCode::PolicyBlocked,
                format!(
                    "patch refused: risk set would grow from {:?} to {:?}",
                    before.risk_flags, after.risk_flags
                ),
            ));
        }
        Ok(patched)
    }
}

impl Default for PlannerL2 {
    fn default() -> Self {
        Self::new()
    }
}

fn synonyms_for(target: &str) -> Option<&'static [&'static str]> {
    SYNONYM_TABLE
        .iter()
        .find(|(key, _)| *key == target)
        .map(|(_, synonyms)| *synonyms)
}

/// Monotonically decreasing in table rank: rank 0 is the strongest match.
fn match_confidence(rank: usize) -> f64 {
    (0.95 - 0.03 * rank as f64).max(0.80)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SchemaElement;
    use crate::dsl::parse_plan;

    fn planner() -> PlannerL2 {
        PlannerL2::new()
    }

    fn click_action(text: &str) -> Action {
        Action::ClickByText {
            text: text.into(),
            role: Some("button".into()),
            frame: None,
        }
    }

    fn not_found() -> StepError {
        StepError::new(ErrorCode::WebElementNotFound, "missing")
    }

    fn schema_with(texts: &[&str]) -> ScreenSchema {
        ScreenSchema {
            source: "web".into(),
            elements: texts.iter().map(|t| SchemaElement::button(t)).collect(),
        }
    }

    #[test]
    fn test_replace_text_from_schema_synonym() {
        let patch = planner()
            .propose(2, &click_action("送信"), &not_found(), Some(&schema_with(&["確定"])))
            .unwrap();
        match &patch.payload {
            PatchPayload::ReplaceText {
                find,
                replace_with,
                role,
            } => {
                assert_eq!(find, "送信");
                assert_eq!(replace_with, "確定");
                assert_eq!(role.as_deref(), Some("button"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert_eq!(patch.risk_level, PatchRisk::Low);
        assert!(patch.confidence >= 0.85);
    }

    #[test]
    fn test_confidence_monotone_in_match_strength() {
        assert!(match_confidence(0) > match_confidence(1));
        assert!(match_confidence(1) > match_confidence(3));
        assert!(match_confidence(10) >= 0.80);
    }

    #[test]
    fn test_fallback_search_when_no_schema_match() {
        let patch = planner()
            .propose(1, &click_action("送信"), &not_found(), Some(&schema_with(&["無関係"])))
            .unwrap();
        match &patch.payload {
            PatchPayload::FallbackSearch {
                synonyms, attempts, ..
            } => {
                assert!(synonyms.len() <= MAX_FALLBACK_SYNONYMS);
                assert_eq!(*attempts, 1);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_wait_tuning_doubles_and_caps() {
        let action = Action::WaitForElement {
            text: Some("x".into()),
            role: None,
            timeout_ms: 5000,
        };
        let err = StepError::new(ErrorCode::VerifierTimeout, "timed out");
        let patch = planner().propose(3, &action, &err, None).unwrap();
        assert_eq!(
            patch.payload,
            PatchPayload::WaitTuning {
                step_index: 3,
                timeout_ms: 10_000
            }
        );

        let action = Action::WaitForElement {
            text: None,
            role: None,
            timeout_ms: 20_000,
        };
        let patch = planner().propose(3, &action, &err, None).unwrap();
        assert_eq!(
            patch.payload,
            PatchPayload::WaitTuning {
                step_index: 3,
                timeout_ms: WAIT_TUNING_CAP_MS
            }
        );
    }

    #[test]
    fn test_at_most_one_patch_per_failure() {
        // An unrelated error yields nothing.
        let err = StepError::new(ErrorCode::PdfParseError, "bad pdf");
        assert!(planner().propose(0, &click_action("送信"), &err, None).is_none());
    }

    #[test]
    fn test_adoption_auto_in_window() {
        let policy = AdoptPolicy::default();
        let patch = Patch::new(
            PatchPayload::ReplaceText {
                find: "a".into(),
                replace_with: "b".into(),
                role: None,
            },
            0.9,
            PatchRisk::Low,
        );
        let decision = planner().evaluate_adoption(
            &patch,
            &AdoptionContext {
                autopilot_enabled: true,
                policy_window_open: true,
                policy: &policy,
                changes_this_run: 0,
            },
        );
        assert_eq!(decision, AdoptionDecision::AutoAdopt);
    }

    #[test]
    fn test_adoption_denied_outside_window_or_budget() {
        let policy = AdoptPolicy::default();
        let patch = Patch::new(
            PatchPayload::ReplaceText {
                find: "a".into(),
                replace_with: "b".into(),
                role: None,
            },
            0.9,
            PatchRisk::Low,
        );

        let outside = planner().evaluate_adoption(
            &patch,
            &AdoptionContext {
                autopilot_enabled: false,
                policy_window_open: true,
                policy: &policy,
                changes_this_run: 0,
            },
        );
        assert!(matches!(outside, AdoptionDecision::RequiresConfirmation { .. }));

        let exhausted = planner().evaluate_adoption(
            &patch,
            &AdoptionContext {
                autopilot_enabled: true,
                policy_window_open: true,
                policy: &policy,
                changes_this_run: 3,
            },
        );
        assert!(matches!(exhausted, AdoptionDecision::RequiresConfirmation { .. }));
    }

    #[test]
    fn test_adoption_low_confidence_requires_confirmation() {
        let policy = AdoptPolicy::default();
        let patch = Patch::new(
            PatchPayload::ReplaceText {
                find: "a".into(),
                replace_with: "b".into(),
                role: None,
            },
            0.5,
            PatchRisk::Low,
        );
        let decision = planner().evaluate_adoption(
            &patch,
            &AdoptionContext {
                autopilot_enabled: true,
                policy_window_open: true,
                policy: &policy,
                changes_this_run: 0,
            },
        );
        assert!(matches!(decision, AdoptionDecision::RequiresConfirmation { .. }));
    }

    #[test]
    fn test_apply_replace_text_rewrites_plan() {
        let plan = parse_plan(
            r#"
dsl_version: "1.1"
name: x
steps:
  - open_browser: {url: "https://portal.example.com"}
  - click_by_text: {text: "Save", role: button}
"#,
        )
        .unwrap();
        let patch = Patch::new(
            PatchPayload::ReplaceText {
                find: "Save".into(),
                replace_with: "Apply".into(),
                role: Some("button".into()),
            },
            0.9,
            PatchRisk::Low,
        );
        let patched = planner().apply(&plan, &patch).unwrap();
        assert_eq!(
            patched.steps[1].params.get("text").unwrap(),
            &Value::String("Apply".into())
        );
        // The original plan is untouched.
        assert_eq!(
            plan.steps[1].params.get("text").unwrap(),
            &Value::String("Save".into())
        );
    }

    #[test]
    fn test_apply_refuses_risk_growth() {
        let plan = parse_plan(
            r#"
dsl_version: "1.1"
name: x
steps:
  - click_by_text: {text: "Open", role: button}
"#,
        )
        .unwrap();
        // A replacement that turns a benign label into destructive
        // vocabulary must be refused.
        let patch = Patch::new(
            PatchPayload::ReplaceText {
                find: "Open".into(),
                replace_with: "削除".into(),
                role: Some("button".into()),
            },
            0.95,
            PatchRisk::Low,
        );
        let err = planner().apply(&plan, &patch).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PolicyBlocked);
    }

    #[test]
    fn test_apply_add_step_refuses_destructive() {
        let plan = parse_plan(
            r#"
dsl_version: "1.1"
name: x
steps:
  - log: {message: hi}
"#,
        )
        .unwrap();
        let patch = Patch::new(
            PatchPayload::AddStep {
                at_index: 1,
                step: serde_json::json!({"compose_mail": {"to": ["a@b"], "subject": "s", "body": "b"}}),
            },
            0.9,
            PatchRisk::Low,
        );
        let err = planner().apply(&plan, &patch).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PolicyBlocked);
    }
}
