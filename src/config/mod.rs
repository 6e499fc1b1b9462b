//! Configuration surfaces.
//!
//! Each config file is a small typed YAML document. A missing policy
//! file degrades to the restrictive default; everything else degrades to
//! its `Default`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::dsl::schema::{RetryConfig, WebEngineKind};
use crate::policy::PolicyConfig;
use crate::signing::TrustStore;

/// `web_engine.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebEngineConfig {
    #[serde(default = "default_engine")]
    pub engine: WebEngineKind,
    #[serde(default = "default_engine_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub enable_debugger_upload: bool,
    #[serde(default)]
    pub fallback_engine: Option<WebEngineKind>,
}

fn default_engine() -> WebEngineKind {
    WebEngineKind::Extension
}

fn default_engine_timeout() -> u64 {
    30_000
}

impl Default for WebEngineConfig {
    fn default() -> Self {
        WebEngineConfig {
            engine: default_engine(),
            timeout_ms: default_engine_timeout(),
            enable_debugger_upload: false,
            fallback_engine: None,
        }
    }
}

/// One entry of `schedules.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub template: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

pub fn default_queue() -> String {
    "default".to_string()
}

pub fn default_priority() -> u8 {
    5
}

/// Per-queue settings inside `orchestrator.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
    #[serde(default)]
    pub retry_policy: Option<RetryConfig>,
}

fn default_max_concurrent() -> usize {
    2
}

fn default_max_queued() -> usize {
    50
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_concurrent: default_max_concurrent(),
            max_queued: default_max_queued(),
            retry_policy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub queues: BTreeMap<String, QueueSettings>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    /// Where run artifacts (screenshots, schemas) land.
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: String,
}

fn default_workers() -> usize {
    2
}

fn default_checkpoint_every() -> usize {
    5
}

fn default_artifacts_dir() -> String {
    "artifacts".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            queues: BTreeMap::from([(default_queue(), QueueSettings::default())]),
            workers: default_workers(),
            checkpoint_every: default_checkpoint_every(),
            artifacts_dir: default_artifacts_dir(),
        }
    }
}

/// Load a typed YAML config, falling back to `Default` when the file is
/// missing. A present-but-invalid file is an error.
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, String> {
    if !path.exists() {
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_yaml::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))
}

/// Load the policy config. A missing file yields the restrictive
/// default, never the permissive one.
pub fn load_policy(path: &Path) -> Result<PolicyConfig, String> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "policy config missing, using restrictive default");
        return Ok(PolicyConfig::restrictive());
    }
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_yaml::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))
}

pub fn load_trust_store(path: &Path) -> Result<TrustStore, String> {
    load_or_default(path)
}

/// `PERMISSIONS_STRICT`: when set truthy, missing OS permissions block
/// execution instead of warning.
pub fn permissions_strict() -> bool {
    std::env::var("PERMISSIONS_STRICT")
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_policy_is_restrictive() {
        let dir = tempfile::tempdir().unwrap();
        let policy = load_policy(&dir.path().join("policy.yaml")).unwrap();
        assert_eq!(policy.window.as_deref(), Some("never"));
        assert!(policy.require_signed_templates);
        assert!(policy.allow_risks.is_empty());
    }

    #[test]
    fn test_policy_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(
            &path,
            r#"
autopilot: true
allow_domains: [partner.example.com]
allow_risks: [sends]
window: "MON-FRI 09:00-17:00 Asia/Tokyo"
require_signed_templates: false
deviation_threshold: 4
"#,
        )
        .unwrap();
        let policy = load_policy(&path).unwrap();
        assert!(policy.autopilot);
        assert_eq!(policy.allow_domains, vec!["partner.example.com"]);
        assert_eq!(policy.deviation_threshold, 4);
    }

    #[test]
    fn test_invalid_policy_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yaml");
        std::fs::write(&path, "allow_risks: [terrible]").unwrap();
        assert!(load_policy(&path).is_err());
    }

    #[test]
    fn test_orchestrator_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.queues["default"].max_concurrent, 2);
        assert_eq!(config.checkpoint_every, 5);
    }

    #[test]
    fn test_schedule_entry_parses() {
        let entry: ScheduleEntry = serde_yaml::from_str(
            r#"
id: weekly-report
cron: "0 9 * * MON"
timezone: Asia/Tokyo
template: plans/weekly.yaml
queue: reports
priority: 3
variables: {inbox: ./sample_data}
"#,
        )
        .unwrap();
        assert_eq!(entry.id, "weekly-report");
        assert_eq!(entry.priority, 3);
        assert_eq!(entry.variables["inbox"], serde_json::json!("./sample_data"));
    }
}
