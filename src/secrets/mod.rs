//! Secret resolution and masking.
//!
//! `{{secrets://[service/]key}}` references resolve through an ordered
//! backend chain. Resolved values are tagged [`Sensitive`]: they never
//! Display or Debug their contents, and every string the executor
//! persists or logs is passed through [`SecretVault::mask_value`] first.
//!
//! Concrete OS-keychain / encrypted-file backends are external adapters
//! behind [`SecretBackend`]; the crate ships the environment and
//! in-memory backends.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Stable placeholder written wherever a sensitive value appeared.
pub const MASK: &str = "***masked***";

/// Environment variable prefix for [`EnvironmentBackend`].
pub const ENV_SECRET_PREFIX: &str = "DESKTOP_AGENT_SECRET_";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret not found: {reference}")]
    NotFound { reference: String },
    #[error("secret backend error: {0}")]
    Backend(String),
}

/// A resolved secret value. Display and Debug show the mask, never the
/// value; only [`Sensitive::expose`] yields the contents.
#[derive(Clone, PartialEq, Eq)]
pub struct Sensitive(String);

impl Sensitive {
    pub fn new(value: impl Into<String>) -> Self {
        Sensitive(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Sensitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(MASK)
    }
}

impl std::fmt::Display for Sensitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(MASK)
    }
}

/// One secret storage backend in the resolver chain.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Look up `[service/]key`; `Ok(None)` means "not here, try the next
    /// backend".
    async fn retrieve(
        &self,
        service: Option<&str>,
        key: &str,
    ) -> Result<Option<String>, SecretError>;
}

/// Backend over process environment variables:
/// `DESKTOP_AGENT_SECRET_KEY` or `DESKTOP_AGENT_SECRET_SERVICE__KEY`.
pub struct EnvironmentBackend {
    prefix: String,
}

impl EnvironmentBackend {
    pub fn new() -> Self {
        EnvironmentBackend {
            prefix: ENV_SECRET_PREFIX.to_string(),
        }
    }

    fn var_name(&self, service: Option<&str>, key: &str) -> String {
        let key = key.to_ascii_uppercase().replace('-', "_");
        match service {
            Some(service) => format!(
                "{}{}__{}",
                self.prefix,
                service.to_ascii_uppercase().replace('-', "_"),
                key
            ),
            None => format!("{}{}", self.prefix, key),
        }
    }
}

impl Default for EnvironmentBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretBackend for EnvironmentBackend {
    fn name(&self) -> &'static str {
        "environment"
    }

    async fn retrieve(
        &self,
        service: Option<&str>,
        key: &str,
    ) -> Result<Option<String>, SecretError> {
        Ok(std::env::var(self.var_name(service, key)).ok())
    }
}

/// In-memory backend, used by tests and as a session-scoped cache.
#[derive(Default)]
pub struct InMemoryBackend {
    values: Mutex<HashMap<String, String>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, service: Option<&str>, key: &str, value: impl Into<String>) {
        self.values
            .lock()
            .insert(compose_reference(service, key), value.into());
    }
}

#[async_trait]
impl SecretBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn retrieve(
        &self,
        service: Option<&str>,
        key: &str,
    ) -> Result<Option<String>, SecretError> {
        Ok(self.values.lock().get(&compose_reference(service, key)).cloned())
    }
}

fn compose_reference(service: Option<&str>, key: &str) -> String {
    match service {
        Some(service) => format!("{service}/{key}"),
        None => key.to_string(),
    }
}

/// Record of one secret access, persisted to the audit log. The value is
/// never part of this record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SecretAccess {
    pub reference: String,
    pub backend: Option<String>,
    pub found: bool,
}

/// Ordered backend chain plus the per-run vault of values that must be
/// masked out of anything persisted.
pub struct SecretsResolver {
    backends: Vec<Arc<dyn SecretBackend>>,
}

impl SecretsResolver {
    pub fn new(backends: Vec<Arc<dyn SecretBackend>>) -> Self {
        SecretsResolver { backends }
    }

    /// Default chain: environment only. Keychain / encrypted-file
    /// backends are pushed in front by the embedding application.
    pub fn with_environment() -> Self {
        SecretsResolver::new(vec![Arc::new(EnvironmentBackend::new())])
    }

    pub async fn resolve(
        &self,
        service: Option<&str>,
        key: &str,
        vault: &SecretVault,
    ) -> (Result<Sensitive, SecretError>, SecretAccess) {
        let reference = compose_reference(service, key);
        for backend in &self.backends {
            match backend.retrieve(service, key).await {
                Ok(Some(value)) => {
                    let access = SecretAccess {
                        reference: reference.clone(),
                        backend: Some(backend.name().to_string()),
                        found: true,
                    };
                    let sensitive = Sensitive::new(value);
                    vault.register(&sensitive);
                    return (Ok(sensitive), access);
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(backend = backend.name(), %reference, error = %e, "secret backend error");
                    continue;
                }
            }
        }
        let access = SecretAccess {
            reference: reference.clone(),
            backend: None,
            found: false,
        };
        (Err(SecretError::NotFound { reference }), access)
    }
}

/// Accumulates every sensitive value seen during a run so outputs and
/// logs can be masked before persistence.
#[derive(Default)]
pub struct SecretVault {
    values: Mutex<Vec<String>>,
}

impl SecretVault {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, value: &Sensitive) {
        let mut values = self.values.lock();
        if !value.expose().is_empty() && !values.iter().any(|v| v == value.expose()) {
            values.push(value.expose().to_string());
        }
    }

    pub fn mask_str(&self, text: &str) -> String {
        let values = self.values.lock();
        let mut out = text.to_string();
        for value in values.iter() {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), MASK);
            }
        }
        out
    }

    /// Recursively mask every string in a JSON value.
    pub fn mask_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.mask_str(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.mask_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.mask_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}
