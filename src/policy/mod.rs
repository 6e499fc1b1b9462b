//! Execution policy engine.
//!
//! Evaluation always runs every check and returns the full list of
//! per-check results; the run is allowed iff all checks pass. Autopilot
//! (L4) additionally requires `autopilot: true` in the config.

pub mod time_window;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::manifest::{Capability, Manifest, RiskFlag};
use crate::signing::VerifiedSignature;

pub use time_window::{TimeWindow, TimeWindowError};

/// Patch adoption policy for Planner-L2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdoptPolicy {
    pub low_risk_auto: bool,
    pub min_confidence: f64,
    pub max_auto_changes: u32,
}

impl Default for AdoptPolicy {
    fn default() -> Self {
        AdoptPolicy {
            low_risk_auto: true,
            min_confidence: 0.85,
            max_auto_changes: 3,
        }
    }
}

/// Deviation penalty weights for the L4 monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenaltyWeights {
    pub verifier_fail: u32,
    pub risk_penalty: u32,
    pub unexpected_element: u32,
    pub timing: u32,
    pub domain_drift: u32,
    pub download_fail: u32,
    pub retry_cap: u32,
}

impl Default for PenaltyWeights {
    fn default() -> Self {
        PenaltyWeights {
            verifier_fail: 1,
            risk_penalty: 1,
            unexpected_element: 2,
            timing: 1,
            domain_drift: 3,
            download_fail: 3,
            retry_cap: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub autopilot: bool,
    /// Suffix-match allowlist; empty means no domain restriction.
    #[serde(default)]
    pub allow_domains: Vec<String>,
    #[serde(default = "all_risks")]
    pub allow_risks: Vec<RiskFlag>,
    /// `None` = always; `"never"` = blocked; otherwise a window string.
    #[serde(default)]
    pub window: Option<String>,
    #[serde(default)]
    pub require_signed_templates: bool,
    #[serde(default)]
    pub require_capabilities: Vec<Capability>,
    #[serde(default)]
    pub adopt_policy: AdoptPolicy,
    #[serde(default = "default_deviation_threshold")]
    pub deviation_threshold: u32,
    #[serde(default)]
    pub penalties: PenaltyWeights,
}

fn all_risks() -> Vec<RiskFlag> {
    vec![RiskFlag::Sends, RiskFlag::Deletes, RiskFlag::Overwrites]
}

fn default_deviation_threshold() -> u32 {
    3
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            autopilot: false,
            allow_domains: Vec::new(),
            allow_risks: all_risks(),
            window: None,
            require_signed_templates: false,
            require_capabilities: Vec::new(),
            adopt_policy: AdoptPolicy::default(),
            deviation_threshold: default_deviation_threshold(),
            penalties: PenaltyWeights::default(),
        }
    }
}

impl PolicyConfig {
    /// Fallback used when the policy file is missing or unreadable:
    /// block everything until an operator writes a real policy.
    pub fn restrictive() -> Self {
        PolicyConfig {
            autopilot: false,
            allow_domains: Vec::new(),
            allow_risks: Vec::new(),
            window: Some("never".to_string()),
            require_signed_templates: true,
            require_capabilities: Vec::new(),
            adopt_policy: AdoptPolicy::default(),
            deviation_threshold: default_deviation_threshold(),
            penalties: PenaltyWeights::default(),
        }
    }
}

/// One of the five policy checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Domain,
    TimeWindow,
    Risk,
    Signature,
    Capabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyCheck {
    pub kind: CheckKind,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PolicyCheck {
    fn pass(kind: CheckKind) -> Self {
        PolicyCheck {
            kind,
            allowed: true,
            reason: None,
        }
    }

    fn block(kind: CheckKind, reason: String) -> Self {
        PolicyCheck {
            kind,
            allowed: false,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    /// True only when all checks pass AND the config enables autopilot.
    pub autopilot_enabled: bool,
    pub checks: Vec<PolicyCheck>,
}

impl PolicyDecision {
    pub fn blocked_reasons(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.allowed)
            .map(|c| {
                format!(
                    "{}: {}",
                    serde_json::to_value(c.kind)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default(),
                    c.reason.clone().unwrap_or_default()
                )
            })
            .collect()
    }
}

pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        PolicyEngine { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Evaluate every check against the manifest at `now`.
    ///
    /// `signature` is the trust-store verification outcome for signed
    /// plans, `None` for unsigned ones.
    pub fn evaluate(
        &self,
        manifest: &Manifest,
        now: DateTime<Utc>,
        signature: Option<&Result<VerifiedSignature, ErrorCode>>,
    ) -> PolicyDecision {
        let checks = vec![
            self.check_domains(manifest),
            self.check_window(now),
            self.check_risks(manifest),
            self.check_signature(signature),
            self.check_capabilities(manifest),
        ];

        let allowed = checks.iter().all(|c| c.allowed);
        PolicyDecision {
            allowed,
            autopilot_enabled: allowed && self.config.autopilot,
            checks,
        }
    }

    fn check_domains(&self, manifest: &Manifest) -> PolicyCheck {
        if self.config.allow_domains.is_empty() {
            return PolicyCheck::pass(CheckKind::Domain);
        }
        for domain in &manifest.target_domains {
            if !self
                .config
                .allow_domains
                .iter()
                .any(|allowed| domain_matches(domain, allowed))
            {
                return PolicyCheck::block(
                    CheckKind::Domain,
                    format!(
                        "domain '{domain}' not in allow_domains {:?}",
                        self.config.allow_domains
                    ),
                );
            }
        }
        PolicyCheck::pass(CheckKind::Domain)
    }

    fn check_window(&self, now: DateTime<Utc>) -> PolicyCheck {
        let Some(window) = self.config.window.as_deref() else {
            return PolicyCheck::pass(CheckKind::TimeWindow);
        };
        if window.eq_ignore_ascii_case("never") {
            return PolicyCheck::block(
                CheckKind::TimeWindow,
                "policy window is 'never'".to_string(),
            );
        }
        match TimeWindow::parse(window) {
            Ok(parsed) if parsed.contains(now) => PolicyCheck::pass(CheckKind::TimeWindow),
            Ok(_) => PolicyCheck::block(
                CheckKind::TimeWindow,
                format!("current time outside window '{window}'"),
            ),
            Err(e) => PolicyCheck::block(
                CheckKind::TimeWindow,
                format!("unparseable window '{window}': {e}"),
            ),
        }
    }

    fn check_risks(&self, manifest: &Manifest) -> PolicyCheck {
        for risk in &manifest.risk_flags {
            if !self.config.allow_risks.contains(risk) {
                return PolicyCheck::block(
                    CheckKind::Risk,
                    format!("risk '{risk:?}' not in allow_risks"),
                );
            }
        }
        PolicyCheck::pass(CheckKind::Risk)
    }

    fn check_signature(
        &self,
        signature: Option<&Result<VerifiedSignature, ErrorCode>>,
    ) -> PolicyCheck {
        if !self.config.require_signed_templates {
            return PolicyCheck::pass(CheckKind::Signature);
        }
        match signature {
            Some(Ok(_)) => PolicyCheck::pass(CheckKind::Signature),
            Some(Err(code)) => PolicyCheck::block(
                CheckKind::Signature,
                format!("signature verification failed: {code}"),
            ),
            None => PolicyCheck::block(
                CheckKind::Signature,
                "signed template required but plan is unsigned".to_string(),
            ),
        }
    }

    fn check_capabilities(&self, manifest: &Manifest) -> PolicyCheck {
        for required in &self.config.require_capabilities {
            if !manifest.required_capabilities.contains(required) {
                return PolicyCheck::block(
                    CheckKind::Capabilities,
                    format!("required capability '{required:?}' missing from manifest"),
                );
            }
        }
        PolicyCheck::pass(CheckKind::Capabilities)
    }
}

/// Suffix-match: `portal.example.com` matches `example.com`,
/// `*.example.com`, and itself; it does not match `ample.com`.
fn domain_matches(domain: &str, allowed: &str) -> bool {
    let allowed = allowed.strip_prefix("*.").unwrap_or(allowed);
    domain == allowed || domain.ends_with(&format!(".{allowed}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::derive_manifest;
    use crate::dsl::parse_plan;

    fn manifest_for(yaml: &str) -> Manifest {
        derive_manifest(&parse_plan(yaml).unwrap())
    }

    fn web_manifest(url: &str) -> Manifest {
        manifest_for(&format!(
            "dsl_version: \"1.1\"\nname: t\nsteps:\n  - open_browser: {{url: \"{url}\"}}\n"
        ))
    }

    #[test]
    fn test_default_allows_plain_plan() {
        let engine = PolicyEngine::new(PolicyConfig::default());
        let manifest = manifest_for(
            "dsl_version: \"1.1\"\nname: t\nsteps:\n  - log: {message: hi}\n",
        );
        let decision = engine.evaluate(&manifest, Utc::now(), None);
        assert!(decision.allowed);
        assert_eq!(decision.checks.len(), 5);
        assert!(!decision.autopilot_enabled);
    }

    #[test]
    fn test_domain_block_produces_domain_check() {
        let engine = PolicyEngine::new(PolicyConfig {
            allow_domains: vec!["partner.example.com".into()],
            ..PolicyConfig::default()
        });
        let decision = engine.evaluate(&web_manifest("https://evil.example.net/x"), Utc::now(), None);
        assert!(!decision.allowed);
        let check = decision
            .checks
            .iter()
            .find(|c| c.kind == CheckKind::Domain)
            .unwrap();
        assert!(!check.allowed);
        assert!(check.reason.as_ref().unwrap().contains("evil.example.net"));
    }

    #[test]
    fn test_domain_suffix_match() {
        let engine = PolicyEngine::new(PolicyConfig {
            allow_domains: vec!["example.com".into()],
            ..PolicyConfig::default()
        });
        assert!(engine
            .evaluate(&web_manifest("https://portal.example.com"), Utc::now(), None)
            .allowed);
        assert!(!engine
            .evaluate(&web_manifest("https://badexample.com"), Utc::now(), None)
            .allowed);
    }

    #[test]
    fn test_never_window_blocks() {
        let engine = PolicyEngine::new(PolicyConfig {
            window: Some("never".into()),
            ..PolicyConfig::default()
        });
        let manifest = Manifest::default();
        let decision = engine.evaluate(&manifest, Utc::now(), None);
        assert!(!decision.allowed);
        assert!(decision
            .checks
            .iter()
            .any(|c| c.kind == CheckKind::TimeWindow && !c.allowed));
    }

    #[test]
    fn test_risk_restriction() {
        let engine = PolicyEngine::new(PolicyConfig {
            allow_risks: vec![],
            ..PolicyConfig::default()
        });
        let manifest = manifest_for(
            "dsl_version: \"1.1\"\nname: t\nsteps:\n  - compose_mail: {to: [\"a@b\"], subject: s, body: b}\n",
        );
        let decision = engine.evaluate(&manifest, Utc::now(), None);
        assert!(decision
            .checks
            .iter()
            .any(|c| c.kind == CheckKind::Risk && !c.allowed));
    }

    #[test]
    fn test_signature_required_unsigned_blocks() {
        let engine = PolicyEngine::new(PolicyConfig {
            require_signed_templates: true,
            ..PolicyConfig::default()
        });
        let decision = engine.evaluate(&Manifest::default(), Utc::now(), None);
        assert!(decision
            .checks
            .iter()
            .any(|c| c.kind == CheckKind::Signature && !c.allowed));
    }

    #[test]
    fn test_all_checks_always_reported() {
        // Two independent violations: both must appear in the reasons.
        let engine = PolicyEngine::new(PolicyConfig {
            allow_domains: vec!["partner.example.com".into()],
            window: Some("never".into()),
            ..PolicyConfig::default()
        });
        let decision = engine.evaluate(&web_manifest("https://evil.example.net"), Utc::now(), None);
        let blocked: Vec<_> = decision.checks.iter().filter(|c| !c.allowed).collect();
        assert_eq!(blocked.len(), 2);
    }

    #[test]
    fn test_autopilot_requires_all_pass() {
        let engine = PolicyEngine::new(PolicyConfig {
            autopilot: true,
            window: Some("never".into()),
            ..PolicyConfig::default()
        });
        let decision = engine.evaluate(&Manifest::default(), Utc::now(), None);
        assert!(!decision.autopilot_enabled);

        let engine = PolicyEngine::new(PolicyConfig {
            autopilot: true,
            ..PolicyConfig::default()
        });
        let decision = engine.evaluate(&Manifest::default(), Utc::now(), None);
        assert!(decision.autopilot_enabled);
    }

    #[test]
    fn test_capability_requirement() {
        let engine = PolicyEngine::new(PolicyConfig {
            require_capabilities: vec![Capability::Pdf],
            ..PolicyConfig::default()
        });
        let decision = engine.evaluate(&Manifest::default(), Utc::now(), None);
        assert!(decision
            .checks
            .iter()
            .any(|c| c.kind == CheckKind::Capabilities && !c.allowed));
    }
}
