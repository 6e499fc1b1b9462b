//! Expression substitution and the `when` grammar.
//!
//! Three reference forms are recognized inside string fields:
//! `{{var}}`, `{{steps[i].field}}`, and `{{secrets://[service/]key}}`.
//! Substitution happens at step start. Secrets are intentionally NOT
//! resolved here; [`render_value`] leaves them in place so the executor
//! can resolve them last and mask them in anything it persists.
//!
//! `when:` expressions compile to a total two-term grammar:
//! `term [ (== | != | > | >= | < | <=) term ]`. No calls, no nesting.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("malformed expression: {0}")]
    Malformed(String),
    #[error("reference to undefined variable '{0}'")]
    UndefinedVariable(String),
    #[error("reference to step {referenced} output from step {current}")]
    ForwardReference { referenced: usize, current: usize },
    #[error("step {0} produced no output")]
    MissingStepOutput(usize),
    #[error("unknown field '{field}' in step {index} output")]
    UnknownField { index: usize, field: String },
}

/// A parsed reference found inside a string field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprRef {
    Variable(String),
    StepField { index: usize, field: String },
    Secret { service: Option<String>, key: String },
}

fn ref_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("ref pattern"))
}

fn step_field_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^steps\[(\d+)\]\.([A-Za-z_][A-Za-z0-9_]*)$").expect("step pattern"))
}

/// Parse the inside of a `{{ ... }}` placeholder.
pub fn parse_ref(body: &str) -> Result<ExprRef, ExprError> {
    let body = body.trim();
    if let Some(rest) = body.strip_prefix("secrets://") {
        let rest = rest.trim();
        if rest.is_empty() {
            return Err(ExprError::Malformed(format!("empty secret reference: {body}")));
        }
        return Ok(match rest.split_once('/') {
            Some((service, key)) if !service.is_empty() && !key.is_empty() => ExprRef::Secret {
                service: Some(service.to_string()),
                key: key.to_string(),
            },
            _ => ExprRef::Secret {
                service: None,
                key: rest.to_string(),
            },
        });
    }
    if let Some(caps) = step_field_pattern().captures(body) {
        let index: usize = caps[1]
            .parse()
            .map_err(|_| ExprError::Malformed(format!("bad step index in {body}")))?;
        return Ok(ExprRef::StepField {
            index,
            field: caps[2].to_string(),
        });
    }
    if body.is_empty() || body.contains(char::is_whitespace) {
        return Err(ExprError::Malformed(body.to_string()));
    }
    Ok(ExprRef::Variable(body.to_string()))
}

/// All references found in a string, in order of appearance.
pub fn scan_refs(text: &str) -> Result<Vec<ExprRef>, ExprError> {
    let mut refs = Vec::new();
    for caps in ref_pattern().captures_iter(text) {
        refs.push(parse_ref(&caps[1])?);
    }
    Ok(refs)
}

/// Recursively scan a params value for references.
pub fn scan_value_refs(value: &Value) -> Result<Vec<ExprRef>, ExprError> {
    let mut refs = Vec::new();
    collect_value_refs(value, &mut refs)?;
    Ok(refs)
}

fn collect_value_refs(value: &Value, out: &mut Vec<ExprRef>) -> Result<(), ExprError> {
    match value {
        Value::String(s) => out.extend(scan_refs(s)?),
        Value::Array(items) => {
            for item in items {
                collect_value_refs(item, out)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_value_refs(item, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Evaluation context for substitution: plan variables plus the outputs
/// of already-completed steps (sparse; skipped steps have no output).
pub struct EvalContext<'a> {
    pub variables: &'a HashMap<String, Value>,
    pub step_outputs: &'a [Option<Map<String, Value>>],
}

impl EvalContext<'_> {
    fn lookup(&self, r: &ExprRef) -> Result<Value, ExprError> {
        match r {
            ExprRef::Variable(name) => self
                .variables
                .get(name)
                .cloned()
                .ok_or_else(|| ExprError::UndefinedVariable(name.clone())),
            ExprRef::StepField { index, field } => {
                let output = self
                    .step_outputs
                    .get(*index)
                    .and_then(|o| o.as_ref())
                    .ok_or(ExprError::MissingStepOutput(*index))?;
                output.get(field).cloned().ok_or_else(|| ExprError::UnknownField {
                    index: *index,
                    field: field.clone(),
                })
            }
            // Secrets are resolved by the executor, after substitution.
            ExprRef::Secret { .. } => Err(ExprError::Malformed(
                "secret references are resolved by the executor".into(),
            )),
        }
    }
}

/// Substitute variable and step references in a string. A string that is
/// exactly one placeholder yields the referenced value unchanged (so a
/// `{{steps[0].paths}}` param stays an array); otherwise references are
/// stringified into the surrounding text. Secret placeholders pass
/// through untouched.
pub fn render_string(text: &str, ctx: &EvalContext<'_>) -> Result<Value, ExprError> {
    let re = ref_pattern();

    // Whole-string single reference: return the raw value.
    if let Some(caps) = re.captures(text) {
        let whole = caps.get(0).expect("match");
        if whole.start() == 0 && whole.end() == text.len() {
            let r = parse_ref(&caps[1])?;
            if matches!(r, ExprRef::Secret { .. }) {
                return Ok(Value::String(text.to_string()));
            }
            return ctx.lookup(&r);
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in re.captures_iter(text) {
        let whole = caps.get(0).expect("match");
        out.push_str(&text[last..whole.start()]);
        let r = parse_ref(&caps[1])?;
        if matches!(r, ExprRef::Secret { .. }) {
            out.push_str(whole.as_str());
        } else {
            out.push_str(&stringify(&ctx.lookup(&r)?));
        }
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(Value::String(out))
}

/// Substitute recursively through a params value.
pub fn render_value(value: &Value, ctx: &EvalContext<'_>) -> Result<Value, ExprError> {
    match value {
        Value::String(s) => render_string(s, ctx),
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| render_value(item, ctx))
                .collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------
// `when` grammar
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Int(i64),
    Str(String),
    Ref(ExprRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A compiled `when` expression: one term, optionally compared to another.
#[derive(Debug, Clone, PartialEq)]
pub struct WhenExpr {
    pub left: Term,
    pub comparison: Option<(Cmp, Term)>,
}

impl WhenExpr {
    /// Compile `term [op term]`. Terms are integer literals, quoted
    /// strings, or references (bare or `{{...}}`-wrapped).
    pub fn compile(source: &str) -> Result<WhenExpr, ExprError> {
        let tokens = tokenize(source)?;
        match tokens.as_slice() {
            [left] => Ok(WhenExpr {
                left: parse_term(left)?,
                comparison: None,
            }),
            [left, op, right] => Ok(WhenExpr {
                left: parse_term(left)?,
                comparison: Some((parse_cmp(op)?, parse_term(right)?)),
            }),
            _ => Err(ExprError::Malformed(format!(
                "expected 'term [op term]', got: {source}"
            ))),
        }
    }

    /// References used by this expression (for validation).
    pub fn refs(&self) -> Vec<&ExprRef> {
        let mut out = Vec::new();
        if let Term::Ref(r) = &self.left {
            out.push(r);
        }
        if let Some((_, Term::Ref(r))) = &self.comparison {
            out.push(r);
        }
        out
    }

    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<bool, ExprError> {
        let left = resolve_term(&self.left, ctx)?;
        match &self.comparison {
            None => Ok(truthy(&left)),
            Some((op, right)) => {
                let right = resolve_term(right, ctx)?;
                Ok(compare(&left, *op, &right))
            }
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<String>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '\'' || c == '"' {
            let quote = c;
            chars.next();
            let mut lit = String::from(quote);
            let mut closed = false;
            for ch in chars.by_ref() {
                if ch == quote {
                    closed = true;
                    break;
                }
                lit.push(ch);
            }
            if !closed {
                return Err(ExprError::Malformed(format!("unterminated string in: {source}")));
            }
            tokens.push(lit);
        } else {
            let mut tok = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                tok.push(ch);
                chars.next();
            }
            tokens.push(tok);
        }
    }
    Ok(tokens)
}

fn parse_term(token: &str) -> Result<Term, ExprError> {
    if let Some(stripped) = token.strip_prefix('\'').or_else(|| token.strip_prefix('"')) {
        return Ok(Term::Str(stripped.to_string()));
    }
    if let Ok(n) = token.parse::<i64>() {
        return Ok(Term::Int(n));
    }
    let body = token
        .strip_prefix("{{")
        .and_then(|t| t.strip_suffix("}}"))
        .unwrap_or(token);
    let r = parse_ref(body)?;
    if matches!(r, ExprRef::Secret { .. }) {
        return Err(ExprError::Malformed(
            "secret references are not allowed in when expressions".into(),
        ));
    }
    Ok(Term::Ref(r))
}

fn parse_cmp(token: &str) -> Result<Cmp, ExprError> {
    Ok(match token {
        "==" => Cmp::Eq,
        "!=" => Cmp::Ne,
        ">" => Cmp::Gt,
        ">=" => Cmp::Ge,
        "<" => Cmp::Lt,
        "<=" => Cmp::Le,
        other => return Err(ExprError::Malformed(format!("unknown operator: {other}"))),
    })
}

fn resolve_term(term: &Term, ctx: &EvalContext<'_>) -> Result<Value, ExprError> {
    match term {
        Term::Int(n) => Ok(Value::from(*n)),
        Term::Str(s) => Ok(Value::String(s.clone())),
        Term::Ref(r) => ctx.lookup(r),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(left: &Value, op: Cmp, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (as_num(left), as_num(right)) {
        return match op {
            Cmp::Eq => l == r,
            Cmp::Ne => l != r,
            Cmp::Gt => l > r,
            Cmp::Ge => l >= r,
            Cmp::Lt => l < r,
            Cmp::Le => l <= r,
        };
    }
    let l = stringify(left);
    let r = stringify(right);
    match op {
        Cmp::Eq => l == r,
        Cmp::Ne => l != r,
        Cmp::Gt => l > r,
        Cmp::Ge => l >= r,
        Cmp::Lt => l < r,
        Cmp::Le => l <= r,
    }
}

fn as_num(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}
