//! Step verification with one-shot auto-retry.
//!
//! Every assertion evaluates once; on failure it performs exactly one
//! retry with extended timing and, for element-level asserts, a
//! broadened text search. The three outcomes are exhaustive and mutually
//! exclusive: `PASS` (first try), `RETRY` (second try succeeded), `FAIL`
//! (both failed). A `FAIL` aborts the run.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::adapters::{OsAdapter, ScreenSchema, WebEngine};
use crate::dsl::schema::Action;
use crate::error::{ErrorCode, StepError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifierOutcome {
    Pass,
    Retry,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierResult {
    pub outcome: VerifierOutcome,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl VerifierResult {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, VerifierOutcome::Pass | VerifierOutcome::Retry)
    }

    fn from_attempts(first: Result<String, String>, second: Option<Result<String, String>>) -> Self {
        match (first, second) {
            (Ok(message), _) => VerifierResult {
                outcome: VerifierOutcome::Pass,
                message,
                details: Map::new(),
            },
            (Err(_), Some(Ok(message))) => VerifierResult {
                outcome: VerifierOutcome::Retry,
                message: format!("{message} (after retry)"),
                details: Map::new(),
            },
            (Err(first), Some(Err(second))) => VerifierResult {
                outcome: VerifierOutcome::Fail,
                message: format!("{first}; retry: {second}"),
                details: Map::new(),
            },
            (Err(first), None) => VerifierResult {
                outcome: VerifierOutcome::Fail,
                message: first,
                details: Map::new(),
            },
        }
    }

    fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

/// Timing knobs; tests shrink these to keep the suite fast.
#[derive(Debug, Clone, Copy)]
pub struct VerifierConfig {
    pub poll_interval: Duration,
    pub retry_pause: Duration,
    /// Multiplier applied to the timeout on the auto-retry.
    pub retry_extension: f64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            poll_interval: Duration::from_millis(100),
            retry_pause: Duration::from_millis(250),
            retry_extension: 1.5,
        }
    }
}

pub struct Verifier<'a> {
    os: &'a dyn OsAdapter,
    web: Option<&'a dyn WebEngine>,
    config: VerifierConfig,
}

impl<'a> Verifier<'a> {
    pub fn new(os: &'a dyn OsAdapter, web: Option<&'a dyn WebEngine>) -> Self {
        Verifier {
            os,
            web,
            config: VerifierConfig::default(),
        }
    }

    pub fn with_config(mut self, config: VerifierConfig) -> Self {
        self.config = config;
        self
    }

    /// Run a verification action. Non-verification actions are a caller
    /// bug and report `FAIL`.
    pub async fn run(&self, action: &Action) -> VerifierResult {
        match action {
            Action::WaitForElement {
                text,
                role,
                timeout_ms,
            } => {
                self.wait_for_element(text.as_deref(), role.as_deref(), *timeout_ms)
                    .await
            }
            Action::AssertElement {
                text,
                role,
                count_gte,
            } => {
                self.assert_element(text.as_deref(), role.as_deref(), *count_gte)
                    .await
            }
            Action::AssertText { contains } => self.assert_text(contains).await,
            Action::AssertFileExists { path } => self.assert_file_exists(path).await,
            Action::AssertPdfPages {
                path,
                expected_pages,
            } => self.assert_pdf_pages(path, *expected_pages).await,
            other => VerifierResult {
                outcome: VerifierOutcome::Fail,
                message: format!("{} is not a verification action", other.name()),
                details: Map::new(),
            },
        }
    }

    async fn capture(&self) -> Result<ScreenSchema, StepError> {
        match self.web {
            Some(web) if web.current_url().await.is_some() => {
                web.capture_dom_schema("page").await
            }
            _ => self.os.capture_screen_schema("frontmost").await,
        }
    }

    async fn wait_for_element(
        &self,
        text: Option<&str>,
        role: Option<&str>,
        timeout_ms: u64,
    ) -> VerifierResult {
        let first = self
            .poll_for_element(text, role, Duration::from_millis(timeout_ms))
            .await;
        if first.is_ok() {
            return VerifierResult::from_attempts(first, None)
                .with_detail("timeout_ms", json!(timeout_ms));
        }

        // One auto-retry with extended timing.
        tokio::time::sleep(self.config.retry_pause).await;
        let extended =
            Duration::from_millis((timeout_ms as f64 * self.config.retry_extension) as u64);
        let second = self.poll_for_element(text, role, extended).await;
        VerifierResult::from_attempts(first, Some(second))
            .with_detail("timeout_ms", json!(timeout_ms))
    }

    async fn poll_for_element(
        &self,
        text: Option<&str>,
        role: Option<&str>,
        timeout: Duration,
    ) -> Result<String, String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(schema) = self.capture().await {
                let found = schema.find(text, role).len();
                if found > 0 {
                    return Ok(format!(
                        "element found: {} (role: {})",
                        text.unwrap_or("<any>"),
                        role.unwrap_or("<any>")
                    ));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!(
                    "element not found within {}ms: {} (role: {})",
                    timeout.as_millis(),
                    text.unwrap_or("<any>"),
                    role.unwrap_or("<any>")
                ));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn assert_element(
        &self,
        text: Option<&str>,
        role: Option<&str>,
        count_gte: usize,
    ) -> VerifierResult {
        let first = self.count_elements(text, role, count_gte).await;
        if first.is_ok() {
            return VerifierResult::from_attempts(first, None);
        }

        tokio::time::sleep(self.config.retry_pause).await;
        // Broadened search: first half of the target text.
        let broadened = text.map(broaden);
        let second = self
            .count_elements(broadened.as_deref().or(text), role, count_gte)
            .await;
        VerifierResult::from_attempts(first, Some(second))
    }

    async fn count_elements(
        &self,
        text: Option<&str>,
        role: Option<&str>,
        count_gte: usize,
    ) -> Result<String, String> {
        let schema = self.capture().await.map_err(|e| e.to_string())?;
        let found = schema.find(text, role).len();
        if found >= count_gte {
            Ok(format!("found {found} elements (required {count_gte})"))
        } else {
            Err(format!("found {found} elements, required {count_gte}"))
        }
    }

    async fn assert_text(&self, contains: &str) -> VerifierResult {
        let first = self.text_present(contains).await;
        if first.is_ok() {
            return VerifierResult::from_attempts(first, None);
        }
        tokio::time::sleep(self.config.retry_pause).await;
        let second = self.text_present(contains).await;
        VerifierResult::from_attempts(first, Some(second))
    }

    async fn text_present(&self, contains: &str) -> Result<String, String> {
        let schema = self.capture().await.map_err(|e| e.to_string())?;
        if schema.contains_text(contains) {
            Ok(format!("text found: '{contains}'"))
        } else {
            Err(format!("text not found: '{contains}'"))
        }
    }

    async fn assert_file_exists(&self, path: &str) -> VerifierResult {
        let first = if self.os.file_exists(path).await {
            Ok(format!("file exists: {path}"))
        } else {
            Err(format!("file does not exist: {path}"))
        };
        if first.is_ok() {
            return VerifierResult::from_attempts(first, None);
        }
        tokio::time::sleep(self.config.retry_pause).await;
        let second = if self.os.file_exists(path).await {
            Ok(format!("file exists: {path}"))
        } else {
            Err(format!("file does not exist: {path}"))
        };
        VerifierResult::from_attempts(first, Some(second))
    }

    async fn assert_pdf_pages(&self, path: &str, expected: usize) -> VerifierResult {
        let first = self.pdf_pages_match(path, expected).await;
        if first.is_ok() {
            return VerifierResult::from_attempts(first, None)
                .with_detail("expected_pages", json!(expected));
        }
        tokio::time::sleep(self.config.retry_pause).await;
        let second = self.pdf_pages_match(path, expected).await;
        VerifierResult::from_attempts(first, Some(second))
            .with_detail("expected_pages", json!(expected))
    }

    async fn pdf_pages_match(&self, path: &str, expected: usize) -> Result<String, String> {
        match self.os.pdf_page_count(path).await {
            Ok(actual) if actual as usize == expected => {
                Ok(format!("PDF has expected {expected} pages"))
            }
            Ok(actual) => Err(format!("PDF has {actual} pages, expected {expected}")),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Error code for a failed verifier outcome.
pub fn failure_code(action: &Action) -> ErrorCode {
    match action {
        Action::WaitForElement { .. } => ErrorCode::VerifierTimeout,
        _ => ErrorCode::VerifierFail,
    }
}

/// First half of the text, by characters; used for the broadened retry.
fn broaden(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= 3 {
        return text.to_string();
    }
    chars[..chars.len() / 2].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FakeOsAdapter, FakeWebEngine, SchemaElement, WebEngine};

    fn fast_config() -> VerifierConfig {
        VerifierConfig {
            poll_interval: Duration::from_millis(5),
            retry_pause: Duration::from_millis(5),
            retry_extension: 1.5,
        }
    }

    #[tokio::test]
    async fn test_wait_for_element_pass() {
        let os = FakeOsAdapter::new();
        let web = FakeWebEngine::new();
        web.open("https://x.example.com", "default").await.unwrap();
        web.add_element(SchemaElement::button("送信"));

        let verifier = Verifier::new(&os, Some(&web)).with_config(fast_config());
        let result = verifier
            .run(&Action::WaitForElement {
                text: Some("送信".into()),
                role: Some("button".into()),
                timeout_ms: 100,
            })
            .await;
        assert_eq!(result.outcome, VerifierOutcome::Pass);
    }

    #[tokio::test]
    async fn test_wait_for_element_retry_then_fail_laws() {
        let os = FakeOsAdapter::new();
        let web = FakeWebEngine::new();
        web.open("https://x.example.com", "default").await.unwrap();
        // Never appears: both attempts fail.
        let verifier = Verifier::new(&os, Some(&web)).with_config(fast_config());
        let result = verifier
            .run(&Action::WaitForElement {
                text: Some("送信".into()),
                role: None,
                timeout_ms: 20,
            })
            .await;
        assert_eq!(result.outcome, VerifierOutcome::Fail);
        assert!(!result.passed());
    }

    #[tokio::test]
    async fn test_wait_for_element_succeeds_on_extended_retry() {
        let os = FakeOsAdapter::new();
        let web = FakeWebEngine::new();
        web.open("https://x.example.com", "default").await.unwrap();
        // Visible only from a later observation: the first bounded poll
        // exhausts its window, the extended retry sees it.
        web.add_deferred_element(SchemaElement::button("送信"), 8);

        let verifier = Verifier::new(&os, Some(&web)).with_config(fast_config());
        let result = verifier
            .run(&Action::WaitForElement {
                text: Some("送信".into()),
                role: Some("button".into()),
                timeout_ms: 15,
            })
            .await;
        assert_eq!(result.outcome, VerifierOutcome::Retry);
        assert!(result.passed());
    }

    #[tokio::test]
    async fn test_assert_element_count() {
        let os = FakeOsAdapter::new();
        let web = FakeWebEngine::new();
        web.open("https://x.example.com", "default").await.unwrap();
        web.add_element(SchemaElement::button("Add row"));
        web.add_element(SchemaElement::button("Add column"));

        let verifier = Verifier::new(&os, Some(&web)).with_config(fast_config());
        let result = verifier
            .run(&Action::AssertElement {
                text: Some("Add".into()),
                role: Some("button".into()),
                count_gte: 2,
            })
            .await;
        assert_eq!(result.outcome, VerifierOutcome::Pass);

        let result = verifier
            .run(&Action::AssertElement {
                text: Some("Delete".into()),
                role: None,
                count_gte: 1,
            })
            .await;
        assert_eq!(result.outcome, VerifierOutcome::Fail);
    }

    #[tokio::test]
    async fn test_assert_element_broadened_retry() {
        let os = FakeOsAdapter::new();
        let web = FakeWebEngine::new();
        web.open("https://x.example.com", "default").await.unwrap();
        // Element text is a prefix of the requested text: the exact
        // search misses, the broadened one ("Subm") hits.
        web.add_element(SchemaElement::button("Submit"));

        let verifier = Verifier::new(&os, Some(&web)).with_config(fast_config());
        let result = verifier
            .run(&Action::AssertElement {
                text: Some("Submit now".into()),
                role: None,
                count_gte: 1,
            })
            .await;
        assert_eq!(result.outcome, VerifierOutcome::Retry);
    }

    #[tokio::test]
    async fn test_assert_file_and_pdf_pages() {
        let os = FakeOsAdapter::new();
        os.add_pdf("merged.pdf", 10);

        let verifier = Verifier::new(&os, None).with_config(fast_config());
        let exists = verifier
            .run(&Action::AssertFileExists {
                path: "merged.pdf".into(),
            })
            .await;
        assert_eq!(exists.outcome, VerifierOutcome::Pass);

        let pages = verifier
            .run(&Action::AssertPdfPages {
                path: "merged.pdf".into(),
                expected_pages: 10,
            })
            .await;
        assert_eq!(pages.outcome, VerifierOutcome::Pass);

        let wrong = verifier
            .run(&Action::AssertPdfPages {
                path: "merged.pdf".into(),
                expected_pages: 12,
            })
            .await;
        assert_eq!(wrong.outcome, VerifierOutcome::Fail);
    }

    #[test]
    fn test_broaden_halves_by_chars() {
        assert_eq!(broaden("Submit"), "Sub");
        assert_eq!(broaden("送信する操作"), "送信する".chars().take(3).collect::<String>());
        assert_eq!(broaden("OK"), "OK");
    }
}
