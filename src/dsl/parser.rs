//! Plan file parsing.
//!
//! Plans are YAML ordered mappings. Steps are single-key mappings from
//! action name to params; envelope keys (`when`, `timeout_ms`, `engine`,
//! `required_role`) are lifted out of the params into the [`Step`].

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::CoreError;

use super::schema::{
    ExecutionConfig, Plan, Role, SignatureBlock, Step, WebEngineKind, RESERVED_STEP_KEYS,
};

/// Parse plan YAML text into a [`Plan`]. Structural problems surface as
/// [`CoreError::PlanParse`]; semantic problems are the validator's job.
pub fn parse_plan(text: &str) -> Result<Plan, CoreError> {
    let root: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| CoreError::PlanParse(e.to_string()))?;
    let root = yaml_to_json(root);
    let obj = root
        .as_object()
        .ok_or_else(|| CoreError::PlanParse("plan root must be a mapping".to_string()))?;

    let dsl_version = obj
        .get("dsl_version")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::PlanParse("missing dsl_version".to_string()))?
        .to_string();
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let variables: HashMap<String, Value> = obj
        .get("variables")
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    let execution: Option<ExecutionConfig> = match obj.get("execution") {
        Some(v) => Some(
            serde_json::from_value(v.clone())
                .map_err(|e| CoreError::PlanParse(format!("invalid execution block: {e}")))?,
        ),
        None => None,
    };

    let signature: Option<SignatureBlock> = match obj.get("signature") {
        Some(v) => Some(
            serde_json::from_value(v.clone())
                .map_err(|e| CoreError::PlanParse(format!("invalid signature block: {e}")))?,
        ),
        None => None,
    };

    let raw_steps = obj
        .get("steps")
        .and_then(Value::as_array)
        .ok_or_else(|| CoreError::PlanParse("missing steps sequence".to_string()))?;

    let mut steps = Vec::with_capacity(raw_steps.len());
    for (index, raw) in raw_steps.iter().enumerate() {
        steps.push(parse_step_value(index, raw)?);
    }

    Ok(Plan {
        dsl_version,
        name,
        variables,
        execution,
        steps,
        signature,
    })
}

/// Parse one raw step mapping into a [`Step`]. Also used by the patch
/// engine when splicing a proposed step into a plan copy.
pub fn parse_step_value(index: usize, raw: &Value) -> Result<Step, CoreError> {
    let map = raw
        .as_object()
        .ok_or_else(|| CoreError::PlanParse(format!("step {index} must be a mapping")))?;

    let action_keys: Vec<&String> = map
        .keys()
        .filter(|k| !RESERVED_STEP_KEYS.contains(&k.as_str()))
        .collect();
    if action_keys.len() != 1 {
        return Err(CoreError::PlanParse(format!(
            "step {index} must be a single-key mapping from action name to params, found keys: {:?}",
            map.keys().collect::<Vec<_>>()
        )));
    }
    let action = action_keys[0].clone();

    let mut params = match map.get(&action) {
        Some(Value::Object(params)) => params.clone(),
        Some(Value::Null) | None => Map::new(),
        Some(other) => {
            return Err(CoreError::PlanParse(format!(
                "step {index} ({action}) params must be a mapping, got {other}"
            )))
        }
    };

    // Envelope keys sit beside the action key. `when`, `engine`, and
    // `required_role` may also appear inside the params for brevity;
    // `timeout_ms` may not, because verifier actions carry their own
    // `timeout_ms` param.
    let mut envelope = Map::new();
    for key in RESERVED_STEP_KEYS {
        if let Some(v) = map.get(*key) {
            envelope.insert((*key).to_string(), v.clone());
        }
    }
    for key in ["when", "engine", "required_role"] {
        if !envelope.contains_key(key) {
            if let Some(v) = params.remove(key) {
                envelope.insert(key.to_string(), v);
            }
        }
    }

    let when = envelope
        .get("when")
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| CoreError::PlanParse(format!("step {index}: when must be a string")))
        })
        .transpose()?;

    let timeout_ms = envelope
        .get("timeout_ms")
        .map(|v| {
            v.as_u64()
                .ok_or_else(|| CoreError::PlanParse(format!("step {index}: timeout_ms must be an integer")))
        })
        .transpose()?;

    let engine: Option<WebEngineKind> = envelope
        .get("engine")
        .map(|v| {
            serde_json::from_value(v.clone())
                .map_err(|_| CoreError::PlanParse(format!("step {index}: invalid engine override")))
        })
        .transpose()?;

    let required_role: Option<Role> = envelope
        .get("required_role")
        .map(|v| {
            serde_json::from_value(v.clone())
                .map_err(|_| CoreError::PlanParse(format!("step {index}: invalid required_role")))
        })
        .transpose()?;

    Ok(Step {
        index,
        action,
        params,
        when,
        engine,
        required_role,
        timeout_ms,
    })
}

/// Convert YAML values into JSON values. Non-string mapping keys are
/// stringified; YAML-specific types have no place in a plan.
pub fn yaml_to_json(value: serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                Value::from(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(items) => {
            Value::Array(items.into_iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(m) => {
            let mut out = Map::new();
            for (k, v) in m {
                let key = match k {
                    serde_yaml::Value::String(s) => s,
                    other => serde_yaml::to_string(&other)
                        .unwrap_or_default()
                        .trim()
                        .to_string(),
                };
                out.insert(key, yaml_to_json(v));
            }
            Value::Object(out)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_plan() {
        let plan = parse_plan(
            r#"
dsl_version: "1.1"
name: demo
steps:
  - log: {message: hello}
"#,
        )
        .unwrap();
        assert_eq!(plan.dsl_version, "1.1");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].action, "log");
        assert_eq!(plan.steps[0].index, 0);
    }

    #[test]
    fn test_envelope_keys_lifted() {
        let plan = parse_plan(
            r#"
dsl_version: "1.1"
name: demo
variables: {mode: draft}
steps:
  - log: {message: a}
  - log:
      message: b
      when: "mode == 'draft'"
    timeout_ms: 2000
"#,
        )
        .unwrap();
        let step = &plan.steps[1];
        assert_eq!(step.when.as_deref(), Some("mode == 'draft'"));
        assert_eq!(step.timeout_ms, Some(2000));
        assert!(!step.params.contains_key("when"));
        assert!(!step.params.contains_key("timeout_ms"));
    }

    #[test]
    fn test_timeout_ms_stays_in_verifier_params() {
        let plan = parse_plan(
            r#"
dsl_version: "1.1"
name: demo
steps:
  - wait_for_element: {text: "送信", timeout_ms: 500}
"#,
        )
        .unwrap();
        let step = &plan.steps[0];
        // The action's own timeout param is not an envelope key.
        assert_eq!(step.timeout_ms, None);
        assert_eq!(step.params.get("timeout_ms"), Some(&Value::from(500)));
    }

    #[test]
    fn test_step_with_two_action_keys_rejected() {
        let err = parse_plan(
            r#"
dsl_version: "1.1"
name: demo
steps:
  - log: {message: a}
    save_draft: {}
"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_missing_version_rejected() {
        let err = parse_plan("name: demo\nsteps: []\n").unwrap_err();
        assert!(err.to_string().contains("dsl_version"));
    }

    #[test]
    fn test_signature_block_parsed() {
        let plan = parse_plan(
            r#"
dsl_version: "1.1"
name: signed
signature:
  algo: ed25519
  key_id: "da:2025:alice"
  created_at: "2025-06-01T00:00:00Z"
  sig: "QUJD"
steps:
  - log: {message: hi}
"#,
        )
        .unwrap();
        assert_eq!(plan.signature.as_ref().unwrap().key_id, "da:2025:alice");
    }

    #[test]
    fn test_params_must_be_mapping() {
        let err = parse_plan(
            r#"
dsl_version: "1.1"
name: demo
steps:
  - log: "just a string"
"#,
        );
        assert!(err.is_err());
    }
}
