//! Static plan validation.
//!
//! Validation is pure: it never executes a step or contacts an external
//! system. Diagnostics carry the step index and a field pointer so the
//! CLI can print a usable line reference.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::expr::{self, ExprRef, WhenExpr};
use super::schema::{action_catalog, is_known_action, Plan, SUPPORTED_DSL_VERSIONS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub step_index: Option<usize>,
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationReport {
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.level == DiagnosticLevel::Error)
    }
}

fn error(code: &str, message: String, step_index: Option<usize>, field: Option<String>) -> Diagnostic {
    Diagnostic {
        level: DiagnosticLevel::Error,
        code: code.to_string(),
        message,
        step_index,
        field,
    }
}

fn warn(code: &str, message: String, step_index: Option<usize>, field: Option<String>) -> Diagnostic {
    Diagnostic {
        level: DiagnosticLevel::Warning,
        code: code.to_string(),
        message,
        step_index,
        field,
    }
}

/// Validate a loaded plan. Returns all diagnostics rather than stopping
/// at the first problem.
pub fn validate_plan(plan: &Plan) -> ValidationReport {
    let mut diags = Vec::new();

    if !SUPPORTED_DSL_VERSIONS.contains(&plan.dsl_version.as_str()) {
        diags.push(error(
            "E001",
            format!(
                "unsupported dsl_version: {}, supported: {}",
                plan.dsl_version,
                SUPPORTED_DSL_VERSIONS.join(", ")
            ),
            None,
            Some("dsl_version".to_string()),
        ));
    }

    if plan.name.trim().is_empty() {
        diags.push(warn("W001", "plan name is empty".to_string(), None, Some("name".to_string())));
    }

    if plan.steps.is_empty() {
        diags.push(error("E002", "plan has no steps".to_string(), None, Some("steps".to_string())));
    }

    if let Some(execution) = &plan.execution {
        if let Some(priority) = execution.priority {
            if !(1..=9).contains(&priority) {
                diags.push(error(
                    "E009",
                    format!("priority must be 1..9, got {priority}"),
                    None,
                    Some("execution.priority".to_string()),
                ));
            }
        }
    }

    for step in &plan.steps {
        validate_step(plan, step.index, &mut diags);
    }

    let is_valid = !diags.iter().any(|d| d.level == DiagnosticLevel::Error);
    ValidationReport {
        is_valid,
        diagnostics: diags,
    }
}

fn validate_step(plan: &Plan, index: usize, diags: &mut Vec<Diagnostic>) {
    let step = &plan.steps[index];

    if !is_known_action(&step.action) {
        diags.push(error(
            "E003",
            format!("unknown action: {}", step.action),
            Some(index),
            Some("action".to_string()),
        ));
        return;
    }

    let spec = action_catalog()
        .iter()
        .find(|s| s.name == step.action)
        .expect("known action");
    for required in spec.required {
        if !step.params.contains_key(*required) {
            diags.push(error(
                "E004",
                format!("action '{}' requires param '{}'", step.action, required),
                Some(index),
                Some(format!("{}.{}", step.action, required)),
            ));
        }
    }

    // Reference checks over every templated param field.
    match expr::scan_value_refs(&Value::Object(step.params.clone())) {
        Ok(refs) => {
            for r in &refs {
                check_ref(plan, index, r, "params", diags);
            }
        }
        Err(e) => diags.push(error(
            "E005",
            format!("malformed expression: {e}"),
            Some(index),
            Some("params".to_string()),
        )),
    }

    if let Some(when) = &step.when {
        match WhenExpr::compile(when) {
            Ok(compiled) => {
                for r in compiled.refs() {
                    check_ref(plan, index, r, "when", diags);
                }
            }
            Err(e) => diags.push(error(
                "E008",
                format!("invalid when expression: {e}"),
                Some(index),
                Some("when".to_string()),
            )),
        }
    }
}

fn check_ref(plan: &Plan, index: usize, r: &ExprRef, field: &str, diags: &mut Vec<Diagnostic>) {
    match r {
        ExprRef::StepField { index: referenced, .. } => {
            if *referenced >= index {
                diags.push(error(
                    "E006",
                    format!(
                        "step {index} references steps[{referenced}]; only earlier steps are visible"
                    ),
                    Some(index),
                    Some(field.to_string()),
                ));
            }
        }
        ExprRef::Variable(name) => {
            if !plan.variables.contains_key(name) {
                diags.push(error(
                    "E007",
                    format!("undefined variable: {name}"),
                    Some(index),
                    Some(field.to_string()),
                ));
            }
        }
        ExprRef::Secret { .. } => {}
    }
}
