//! Screen / DOM schema shared by the verifier, monitor, and planner.

use serde::{Deserialize, Serialize};

/// One interactive element as reported by the OS accessibility tree or
/// the web engine's DOM capture.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaElement {
    pub role: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub aria_label: Option<String>,
}

impl SchemaElement {
    pub fn button(text: &str) -> Self {
        SchemaElement {
            role: "button".to_string(),
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn textbox(label: &str) -> Self {
        SchemaElement {
            role: "textbox".to_string(),
            label: Some(label.to_string()),
            ..Default::default()
        }
    }

    /// Every textual facet of the element, for broadened searches.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        [
            Some(self.text.as_str()),
            self.label.as_deref(),
            self.placeholder.as_deref(),
            self.aria_label.as_deref(),
        ]
        .into_iter()
        .flatten()
    }

    pub fn matches(&self, text: Option<&str>, role: Option<&str>) -> bool {
        if let Some(role) = role {
            if !self.role.eq_ignore_ascii_case(role) {
                return false;
            }
        }
        match text {
            Some(text) => self.texts().any(|t| t.contains(text)),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScreenSchema {
    /// What produced the capture: `frontmost`, `screen`, or a URL.
    pub source: String,
    pub elements: Vec<SchemaElement>,
}

impl ScreenSchema {
    pub fn find(&self, text: Option<&str>, role: Option<&str>) -> Vec<&SchemaElement> {
        self.elements
            .iter()
            .filter(|e| e.matches(text, role))
            .collect()
    }

    pub fn contains_text(&self, needle: &str) -> bool {
        self.elements.iter().any(|e| e.texts().any(|t| t.contains(needle)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_by_text_and_role() {
        let schema = ScreenSchema {
            source: "frontmost".into(),
            elements: vec![SchemaElement::button("送信"), SchemaElement::textbox("宛先")],
        };
        assert_eq!(schema.find(Some("送信"), Some("button")).len(), 1);
        assert_eq!(schema.find(Some("送信"), Some("textbox")).len(), 0);
        assert_eq!(schema.find(None, Some("textbox")).len(), 1);
    }

    #[test]
    fn test_matches_any_text_facet() {
        let element = SchemaElement {
            role: "textbox".into(),
            text: String::new(),
            label: None,
            placeholder: Some("メールアドレス".into()),
            aria_label: None,
        };
        assert!(element.matches(Some("メール"), None));
    }

    #[test]
    fn test_contains_text() {
        let schema = ScreenSchema {
            source: "web".into(),
            elements: vec![SchemaElement::button("Submit order")],
        };
        assert!(schema.contains_text("Submit"));
        assert!(!schema.contains_text("Cancel"));
    }
}
