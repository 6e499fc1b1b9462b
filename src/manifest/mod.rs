//! Manifest derivation: capabilities, risk flags, and target domains.
//!
//! The analyzer is deterministic and side-effect-free: walking the same
//! plan twice yields byte-identical manifests. Capability and risk sets
//! are ordered (`BTreeSet`) for that reason.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::dsl::schema::{Plan, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Webx,
    Fs,
    Pdf,
    MailDraft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    Sends,
    Deletes,
    Overwrites,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub algo: String,
    pub key_id: String,
    pub sig: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub capabilities: BTreeSet<Capability>,
    pub risk_flags: BTreeSet<RiskFlag>,
    pub required_capabilities: BTreeSet<Capability>,
    /// Ordered set: first occurrence wins.
    pub target_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_info: Option<SignatureInfo>,
}

/// Destructive vocabulary, grouped by the risk it raises. Tokens are
/// matched case-insensitively as substrings of string params.
const SENDS_TOKENS: &[&str] = &[
    "submit", "send", "送信", "提出", "確定送信", "enviar", "senden",
];
const DELETES_TOKENS: &[&str] = &[
    "delete", "remove", "削除", "消去", "eliminar", "löschen",
];
const OVERWRITES_TOKENS: &[&str] = &["overwrite", "上書き", "sobrescribir", "überschreiben"];

fn capability_of(action: &str) -> Option<Capability> {
    match action {
        "open_browser" | "fill_by_label" | "click_by_text" | "upload_file" | "download_file"
        | "wait_for_download" | "capture_screen_schema" | "wait_for_element" | "assert_element"
        | "assert_text" => Some(Capability::Webx),
        "find_files" | "rename" | "move_to" | "zip_folder" | "assert_file_exists" => {
            Some(Capability::Fs)
        }
        "pdf_merge" | "pdf_extract_pages" | "assert_pdf_pages" => Some(Capability::Pdf),
        "compose_mail" | "attach_files" | "save_draft" => Some(Capability::MailDraft),
        _ => None,
    }
}

/// Derive the manifest for a plan. Signature info is attached by the
/// caller after trust verification; derivation itself never inspects it.
pub fn derive_manifest(plan: &Plan) -> Manifest {
    let mut manifest = Manifest::default();

    for step in &plan.steps {
        if let Some(cap) = capability_of(&step.action) {
            manifest.capabilities.insert(cap);
        }

        match step.action.as_str() {
            "compose_mail" | "save_draft" => {
                manifest.risk_flags.insert(RiskFlag::Sends);
            }
            "upload_file" => {
                manifest.risk_flags.insert(RiskFlag::Sends);
            }
            _ => {}
        }

        scan_step_params(step, &mut manifest);
    }

    manifest.required_capabilities = manifest.capabilities.clone();
    manifest
}

fn scan_step_params(step: &Step, manifest: &mut Manifest) {
    for (key, value) in &step.params {
        scan_param(key, value, manifest);
    }
}

fn scan_param(key: &str, value: &Value, manifest: &mut Manifest) {
    match value {
        Value::String(s) => {
            if key == "url" {
                if let Some(domain) = extract_domain(s) {
                    if !manifest.target_domains.contains(&domain) {
                        manifest.target_domains.push(domain);
                    }
                }
            }
            scan_vocabulary(s, manifest);
        }
        Value::Bool(true) if key == "overwrite_if_exists" => {
            manifest.risk_flags.insert(RiskFlag::Overwrites);
        }
        Value::Array(items) => {
            for item in items {
                scan_param(key, item, manifest);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                scan_param(k, v, manifest);
            }
        }
        _ => {}
    }
}

fn scan_vocabulary(text: &str, manifest: &mut Manifest) {
    manifest.risk_flags.extend(risks_in_text(text));
}

/// Risks implied by a piece of UI text or a parameter value. Used both
/// for static manifest derivation and for spotting run-time risk
/// escalation when a recovery lands on different text than planned.
pub fn risks_in_text(text: &str) -> BTreeSet<RiskFlag> {
    let lowered = text.to_lowercase();
    let mut risks = BTreeSet::new();
    if SENDS_TOKENS.iter().any(|t| lowered.contains(t)) {
        risks.insert(RiskFlag::Sends);
    }
    if DELETES_TOKENS.iter().any(|t| lowered.contains(t)) {
        risks.insert(RiskFlag::Deletes);
    }
    if OVERWRITES_TOKENS.iter().any(|t| lowered.contains(t)) {
        risks.insert(RiskFlag::Overwrites);
    }
    risks
}

/// Pull the host out of a URL-ish string without a URL crate: scheme
/// prefix stripped, then everything up to the first `/`, `?`, or `#`,
/// with any `user@` and `:port` removed.
pub fn extract_domain(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.rsplit('@').next()?;
    let host = host.split(':').next()?;
    if host.is_empty() || host.contains("{{") {
        return None;
    }
    Some(host.to_ascii_lowercase())
}
