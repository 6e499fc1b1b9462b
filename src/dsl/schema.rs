//! Plan and step schema.
//!
//! A plan is an immutable, version-stamped sequence of steps. On disk a
//! step is a single-key mapping from action name to params; reserved keys
//! (`when`, `timeout_ms`, `engine`, `required_role`) are lifted out of the
//! params at parse time. Params stay a raw JSON map until execution so
//! that expression placeholders can stand in for any scalar; the typed
//! [`Action`] is produced after substitution.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Current supported DSL version.
pub const CURRENT_DSL_VERSION: &str = "1.1";

/// All supported DSL versions.
pub const SUPPORTED_DSL_VERSIONS: &[&str] = &["1.1"];

/// Step keys that belong to the step envelope, not to the action params.
pub const RESERVED_STEP_KEYS: &[&str] = &["when", "timeout_ms", "engine", "required_role"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub dsl_version: String,
    pub name: String,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub execution: Option<ExecutionConfig>,
    pub steps: Vec<Step>,
    /// Detached signature block; excluded from canonical bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureBlock>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub web_engine: Option<WebEngineKind>,
    #[serde(default)]
    pub evidence: Option<EvidenceConfig>,
}

/// Per-step evidence capture requested by the plan.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EvidenceConfig {
    #[serde(default)]
    pub screenshots: bool,
    #[serde(default)]
    pub dom_schemas: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 1,
            backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebEngineKind {
    Extension,
    Playwright,
}

/// Signature block stored alongside a signed plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureBlock {
    pub algo: String,
    pub key_id: String,
    pub created_at: String,
    pub sig: String,
}

/// One ordered step. `index` is the 0-based stable id within the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub action: String,
    pub params: Map<String, Value>,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub engine: Option<WebEngineKind>,
    #[serde(default)]
    pub required_role: Option<Role>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Approver role lattice: `Admin > Editor > Viewer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Role {
    Viewer,
    Editor,
    Admin,
}

impl Role {
    /// Whether a holder of `self` satisfies a `required` role.
    pub fn satisfies(self, required: Role) -> bool {
        self >= required
    }
}

/// Per-step result status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pass,
    Fail,
    Retry,
    Skipped,
}

/// Auto-action taken when a `human_confirm` times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoAction {
    #[default]
    Deny,
    Approve,
}

/// The closed action set. Produced from a step's name + substituted
/// params at execution time; the validator checks names and required
/// params against [`action_catalog`] without full typing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    FindFiles {
        query: String,
        roots: Vec<String>,
        #[serde(default = "default_find_limit")]
        limit: usize,
    },
    Rename {
        pattern: String,
    },
    MoveTo {
        dest: String,
    },
    ZipFolder {
        folder: String,
        out: String,
    },
    PdfMerge {
        #[serde(default)]
        inputs: Vec<String>,
        out: String,
    },
    PdfExtractPages {
        path: String,
        ranges: String,
        out: String,
    },
    ComposeMail {
        to: Vec<String>,
        subject: String,
        body: String,
    },
    AttachFiles {
        files: Vec<String>,
    },
    SaveDraft,
    OpenBrowser {
        url: String,
    },
    FillByLabel {
        label: String,
        text: String,
        #[serde(default)]
        frame: Option<String>,
    },
    ClickByText {
        text: String,
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        frame: Option<String>,
    },
    UploadFile {
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        label: Option<String>,
        path: String,
    },
    DownloadFile {
        url: String,
        to: String,
    },
    WaitForDownload {
        to: String,
        #[serde(default = "default_download_timeout")]
        timeout_ms: u64,
    },
    CaptureScreenSchema {
        #[serde(default = "default_schema_target")]
        target: String,
    },
    WaitForElement {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        role: Option<String>,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
    },
    AssertElement {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        role: Option<String>,
        #[serde(default = "default_count_gte")]
        count_gte: usize,
    },
    AssertText {
        contains: String,
    },
    AssertFileExists {
        path: String,
    },
    AssertPdfPages {
        path: String,
        expected_pages: usize,
    },
    HumanConfirm {
        message: String,
        #[serde(default = "default_confirm_timeout")]
        timeout_minutes: u64,
        #[serde(default)]
        auto_action: AutoAction,
        #[serde(default)]
        required_role: Option<Role>,
        #[serde(default)]
        risk_level: Option<String>,
    },
    PolicyGuard,
    Log {
        message: String,
    },
}

fn default_find_limit() -> usize {
    100
}
fn default_download_timeout() -> u64 {
    30_000
}
fn default_wait_timeout() -> u64 {
    15_000
}
fn default_schema_target() -> String {
    "frontmost".to_string()
}
fn default_count_gte() -> usize {
    1
}
fn default_confirm_timeout() -> u64 {
    10
}

impl Action {
    /// Parse a typed action from a step's name + (substituted) params.
    pub fn from_parts(name: &str, params: &Map<String, Value>) -> Result<Action, String> {
        let mut obj = params.clone();
        obj.insert("action".to_string(), Value::String(name.to_string()));
        serde_json::from_value(Value::Object(obj)).map_err(|e| e.to_string())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::FindFiles { .. } => "find_files",
            Action::Rename { .. } => "rename",
            Action::MoveTo { .. } => "move_to",
            Action::ZipFolder { .. } => "zip_folder",
            Action::PdfMerge { .. } => "pdf_merge",
            Action::PdfExtractPages { .. } => "pdf_extract_pages",
            Action::ComposeMail { .. } => "compose_mail",
            Action::AttachFiles { .. } => "attach_files",
            Action::SaveDraft => "save_draft",
            Action::OpenBrowser { .. } => "open_browser",
            Action::FillByLabel { .. } => "fill_by_label",
            Action::ClickByText { .. } => "click_by_text",
            Action::UploadFile { .. } => "upload_file",
            Action::DownloadFile { .. } => "download_file",
            Action::WaitForDownload { .. } => "wait_for_download",
            Action::CaptureScreenSchema { .. } => "capture_screen_schema",
            Action::WaitForElement { .. } => "wait_for_element",
            Action::AssertElement { .. } => "assert_element",
            Action::AssertText { .. } => "assert_text",
            Action::AssertFileExists { .. } => "assert_file_exists",
            Action::AssertPdfPages { .. } => "assert_pdf_pages",
            Action::HumanConfirm { .. } => "human_confirm",
            Action::PolicyGuard => "policy_guard",
            Action::Log { .. } => "log",
        }
    }

    /// Whether this action is evaluated by the verifier.
    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            Action::WaitForElement { .. }
                | Action::AssertElement { .. }
                | Action::AssertText { .. }
                | Action::AssertFileExists { .. }
                | Action::AssertPdfPages { .. }
        )
    }
}

/// Catalog entry: action name, required param keys, whether it is a
/// verification action. This is what the validator checks against.
pub struct ActionSpec {
    pub name: &'static str,
    pub required: &'static [&'static str],
}

/// The closed action catalog. Unknown names are a validation error.
pub fn action_catalog() -> &'static [ActionSpec] {
    const CATALOG: &[ActionSpec] = &[
        ActionSpec { name: "find_files", required: &["query", "roots"] },
        ActionSpec { name: "rename", required: &["pattern"] },
        ActionSpec { name: "move_to", required: &["dest"] },
        ActionSpec { name: "zip_folder", required: &["folder", "out"] },
        ActionSpec { name: "pdf_merge", required: &["out"] },
        ActionSpec { name: "pdf_extract_pages", required: &["path", "ranges", "out"] },
        ActionSpec { name: "compose_mail", required: &["to", "subject", "body"] },
        ActionSpec { name: "attach_files", required: &["files"] },
        ActionSpec { name: "save_draft", required: &[] },
        ActionSpec { name: "open_browser", required: &["url"] },
        ActionSpec { name: "fill_by_label", required: &["label", "text"] },
        ActionSpec { name: "click_by_text", required: &["text"] },
        ActionSpec { name: "upload_file", required: &["path"] },
        ActionSpec { name: "download_file", required: &["url", "to"] },
        ActionSpec { name: "wait_for_download", required: &["to"] },
        ActionSpec { name: "capture_screen_schema", required: &[] },
        ActionSpec { name: "wait_for_element", required: &[] },
        ActionSpec { name: "assert_element", required: &[] },
        ActionSpec { name: "assert_text", required: &["contains"] },
        ActionSpec { name: "assert_file_exists", required: &["path"] },
        ActionSpec { name: "assert_pdf_pages", required: &["path", "expected_pages"] },
        ActionSpec { name: "human_confirm", required: &["message"] },
        ActionSpec { name: "policy_guard", required: &[] },
        ActionSpec { name: "log", required: &["message"] },
    ];
    CATALOG
}

pub fn is_known_action(name: &str) -> bool {
    action_catalog().iter().any(|spec| spec.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_action_from_parts() {
        let action = Action::from_parts(
            "find_files",
            &params(json!({"query": "*.pdf", "roots": ["./sample_data"], "limit": 10})),
        )
        .unwrap();
        assert_eq!(
            action,
            Action::FindFiles {
                query: "*.pdf".into(),
                roots: vec!["./sample_data".into()],
                limit: 10,
            }
        );
        assert_eq!(action.name(), "find_files");
    }

    #[test]
    fn test_action_defaults() {
        let action =
            Action::from_parts("wait_for_element", &params(json!({"text": "Submit"}))).unwrap();
        match action {
            Action::WaitForElement { timeout_ms, .. } => assert_eq!(timeout_ms, 15_000),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn test_action_rejects_bad_params() {
        let err = Action::from_parts("pdf_merge", &params(json!({"inputs": 3}))).unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn test_unknown_action_name() {
        assert!(!is_known_action("format_disk"));
        assert!(is_known_action("human_confirm"));
    }

    #[test]
    fn test_verification_actions() {
        let assert_pages = Action::from_parts(
            "assert_pdf_pages",
            &params(json!({"path": "a.pdf", "expected_pages": 3})),
        )
        .unwrap();
        assert!(assert_pages.is_verification());

        let log = Action::from_parts("log", &params(json!({"message": "hi"}))).unwrap();
        assert!(!log.is_verification());
    }

    #[test]
    fn test_role_lattice() {
        assert!(Role::Admin.satisfies(Role::Editor));
        assert!(Role::Editor.satisfies(Role::Editor));
        assert!(!Role::Viewer.satisfies(Role::Editor));
    }

    #[test]
    fn test_plan_roundtrip() {
        let plan = Plan {
            dsl_version: CURRENT_DSL_VERSION.to_string(),
            name: "weekly".to_string(),
            variables: HashMap::new(),
            execution: Some(ExecutionConfig {
                queue: Some("default".into()),
                priority: Some(3),
                retry: Some(RetryConfig::default()),
                web_engine: Some(WebEngineKind::Extension),
                evidence: None,
            }),
            steps: vec![Step {
                index: 0,
                action: "log".into(),
                params: params(json!({"message": "hello"})),
                when: None,
                engine: None,
                required_role: None,
                timeout_ms: None,
            }],
            signature: None,
        };
        let text = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&text).unwrap();
        assert_eq!(back.steps.len(), 1);
        assert_eq!(back.execution.unwrap().priority, Some(3));
    }
}
