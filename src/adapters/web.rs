//! Web engine contract.
//!
//! The core never touches the DOM itself: it issues operations as a
//! batch of JSON-RPC requests to an external engine (browser extension
//! over native messaging or WebSocket, or a Playwright sidecar; the
//! transport is a deployment choice behind [`RpcTransport`]). The host
//! allowlist is validated before any batch containing network-observable
//! operations is issued.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ErrorCode, StepError};
use crate::manifest::extract_domain;

use super::schema::ScreenSchema;

/// How an element is addressed: by label, selector, or visible text,
/// optionally scoped to a role and frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementTarget {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub frame: Option<String>,
}

impl ElementTarget {
    pub fn by_label(label: &str) -> Self {
        ElementTarget {
            label: Some(label.to_string()),
            ..Default::default()
        }
    }

    pub fn by_text(text: &str, role: Option<&str>) -> Self {
        ElementTarget {
            text: Some(text.to_string()),
            role: role.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn describe(&self) -> String {
        self.text
            .as_deref()
            .or(self.label.as_deref())
            .or(self.selector.as_deref())
            .unwrap_or("<unaddressed>")
            .to_string()
    }
}

#[async_trait]
pub trait WebEngine: Send + Sync {
    async fn open(&self, url: &str, context: &str) -> Result<(), StepError>;
    async fn fill(&self, target: &ElementTarget, text: &str) -> Result<(), StepError>;
    async fn click(&self, target: &ElementTarget) -> Result<(), StepError>;
    async fn upload(&self, target: &ElementTarget, path: &str) -> Result<(), StepError>;
    async fn download(&self, url: &str, to: &str) -> Result<(), StepError>;
    /// Wait for a download landing at `to`; returns the byte count.
    async fn wait_for_download(&self, to: &str, timeout_ms: u64) -> Result<u64, StepError>;
    async fn capture_dom_schema(&self, target: &str) -> Result<ScreenSchema, StepError>;
    /// URL of the page currently in focus, if any.
    async fn current_url(&self) -> Option<String>;

    /// Declared concurrency of this engine (capability singleton).
    fn concurrency(&self) -> u32 {
        1
    }

    async fn frame_select(&self, _frame: &str) -> Result<(), StepError> {
        Err(StepError::new(ErrorCode::Unsupported, "frame selection not supported"))
    }

    async fn frame_clear(&self) -> Result<(), StepError> {
        Ok(())
    }

    async fn pierce_shadow(&self, _enabled: bool) -> Result<(), StepError> {
        Err(StepError::new(ErrorCode::Unsupported, "shadow piercing not supported"))
    }

    async fn cookies_get(&self, _domain: &str) -> Result<Value, StepError> {
        Err(StepError::new(ErrorCode::Unsupported, "cookie access not supported"))
    }

    async fn storage_get(&self, _key: &str) -> Result<Value, StepError> {
        Err(StepError::new(ErrorCode::Unsupported, "storage access not supported"))
    }
}

// ---------------------------------------------------------------------
// Batch JSON-RPC encoding
// ---------------------------------------------------------------------

/// One operation in a batch, in wire order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum WebOp {
    Open { url: String, context: String },
    Fill { target: ElementTarget, text: String },
    Click { target: ElementTarget },
    Upload { target: ElementTarget, path: String },
    Download { url: String, to: String },
    WaitForDownload { to: String, timeout_ms: u64 },
    CaptureDomSchema { target: String },
    FrameSelect { frame: String },
    FrameClear,
    PierceShadow { enabled: bool },
}

impl WebOp {
    /// Operations that are observable on the network and therefore
    /// subject to the host allowlist.
    pub fn network_observable_host(&self) -> Option<String> {
        match self {
            WebOp::Open { url, .. } | WebOp::Download { url, .. } => extract_domain(url),
            _ => None,
        }
    }
}

/// Encode a batch as JSON-RPC 2.0 requests with sequential ids.
pub fn encode_batch(ops: &[WebOp]) -> Value {
    Value::Array(
        ops.iter()
            .enumerate()
            .map(|(id, op)| {
                let mut req = serde_json::to_value(op).expect("op serializes");
                let obj = req.as_object_mut().expect("op is an object");
                obj.insert("jsonrpc".to_string(), json!("2.0"));
                obj.insert("id".to_string(), json!(id + 1));
                req
            })
            .collect(),
    )
}

/// Reject any batch whose network-observable operations reach a host
/// outside the allowlist. An empty allowlist means "no restriction".
pub fn validate_batch_hosts(ops: &[WebOp], allowlist: &[String]) -> Result<(), StepError> {
    if allowlist.is_empty() {
        return Ok(());
    }
    for op in ops {
        if let Some(host) = op.network_observable_host() {
            let permitted = allowlist.iter().any(|allowed| {
                let allowed = allowed.strip_prefix("*.").unwrap_or(allowed);
                host == *allowed || host.ends_with(&format!(".{allowed}"))
            });
            if !permitted {
                return Err(StepError::new(
                    ErrorCode::PolicyBlocked,
                    format!("host '{host}' is outside the declared allowlist"),
                ));
            }
        }
    }
    Ok(())
}

/// Transport over which encoded batches travel. Native-messaging and
/// WebSocket bridges both implement this.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send_batch(&self, batch: Value) -> Result<Value, StepError>;
}

/// Web engine that encodes every operation as a JSON-RPC batch over a
/// pluggable transport. The host allowlist is validated before any
/// batch containing network-observable operations is issued.
pub struct BatchJsonRpcEngine<T: RpcTransport> {
    transport: T,
    allowlist: Vec<String>,
    current_url: parking_lot::Mutex<Option<String>>,
}

impl<T: RpcTransport> BatchJsonRpcEngine<T> {
    pub fn new(transport: T, allowlist: Vec<String>) -> Self {
        BatchJsonRpcEngine {
            transport,
            allowlist,
            current_url: parking_lot::Mutex::new(None),
        }
    }

    async fn issue(&self, ops: Vec<WebOp>) -> Result<Value, StepError> {
        validate_batch_hosts(&ops, &self.allowlist)?;
        self.transport.send_batch(encode_batch(&ops)).await
    }

    /// First result object out of a JSON-RPC batch response.
    fn first_result(response: &Value) -> Option<&Value> {
        response
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|entry| entry.get("result"))
    }
}

#[async_trait]
impl<T: RpcTransport> WebEngine for BatchJsonRpcEngine<T> {
    async fn open(&self, url: &str, context: &str) -> Result<(), StepError> {
        self.issue(vec![WebOp::Open {
            url: url.to_string(),
            context: context.to_string(),
        }])
        .await?;
        *self.current_url.lock() = Some(url.to_string());
        Ok(())
    }

    async fn fill(&self, target: &ElementTarget, text: &str) -> Result<(), StepError> {
        self.issue(vec![WebOp::Fill {
            target: target.clone(),
            text: text.to_string(),
        }])
        .await
        .map(|_| ())
    }

    async fn click(&self, target: &ElementTarget) -> Result<(), StepError> {
        self.issue(vec![WebOp::Click {
            target: target.clone(),
        }])
        .await
        .map(|_| ())
    }

    async fn upload(&self, target: &ElementTarget, path: &str) -> Result<(), StepError> {
        self.issue(vec![WebOp::Upload {
            target: target.clone(),
            path: path.to_string(),
        }])
        .await
        .map(|_| ())
    }

    async fn download(&self, url: &str, to: &str) -> Result<(), StepError> {
        self.issue(vec![WebOp::Download {
            url: url.to_string(),
            to: to.to_string(),
        }])
        .await
        .map(|_| ())
    }

    async fn wait_for_download(&self, to: &str, timeout_ms: u64) -> Result<u64, StepError> {
        let response = self
            .issue(vec![WebOp::WaitForDownload {
                to: to.to_string(),
                timeout_ms,
            }])
            .await?;
        Self::first_result(&response)
            .and_then(|r| r.get("bytes"))
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                StepError::new(ErrorCode::DownloadIncomplete, format!("no download result for {to}"))
            })
    }

    async fn capture_dom_schema(&self, target: &str) -> Result<ScreenSchema, StepError> {
        let response = self
            .issue(vec![WebOp::CaptureDomSchema {
                target: target.to_string(),
            }])
            .await?;
        let schema = Self::first_result(&response)
            .cloned()
            .and_then(|r| serde_json::from_value(r).ok())
            .unwrap_or_default();
        Ok(schema)
    }

    async fn current_url(&self) -> Option<String> {
        self.current_url.lock().clone()
    }

    async fn frame_select(&self, frame: &str) -> Result<(), StepError> {
        self.issue(vec![WebOp::FrameSelect {
            frame: frame.to_string(),
        }])
        .await
        .map(|_| ())
    }

    async fn frame_clear(&self) -> Result<(), StepError> {
        self.issue(vec![WebOp::FrameClear]).await.map(|_| ())
    }

    async fn pierce_shadow(&self, enabled: bool) -> Result<(), StepError> {
        self.issue(vec![WebOp::PierceShadow { enabled }])
            .await
            .map(|_| ())
    }
}
