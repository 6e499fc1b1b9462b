//! Process-wide service bundle.
//!
//! Constructed once at startup and handed to workers; tests assemble it
//! from fakes instead of monkey-patching globals.

use std::sync::Arc;

use crate::adapters::{LocalOsAdapter, OsAdapter, WebEngine};
use crate::config::OrchestratorConfig;
use crate::exec::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use crate::metrics::MetricsHub;
use crate::planner::PlannerL2;
use crate::policy::{PolicyConfig, PolicyEngine};
use crate::secrets::SecretsResolver;
use crate::signing::TrustStore;
use crate::store::{AuditSink, MemoryRunStore, RunStore, TracingAuditSink};
use crate::verifier::VerifierConfig;

pub struct Services {
    pub store: Arc<dyn RunStore>,
    pub audit: Arc<dyn AuditSink>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub policy: Arc<PolicyEngine>,
    pub trust: Arc<TrustStore>,
    pub secrets: Arc<SecretsResolver>,
    pub metrics: Arc<MetricsHub>,
    pub os: Arc<dyn OsAdapter>,
    pub web: Option<Arc<dyn WebEngine>>,
    pub planner: Arc<PlannerL2>,
    pub orchestrator: OrchestratorConfig,
    pub verifier: VerifierConfig,
}

impl Services {
    pub fn builder() -> ServicesBuilder {
        ServicesBuilder::default()
    }
}

pub struct ServicesBuilder {
    store: Option<Arc<dyn RunStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    policy: Option<PolicyConfig>,
    trust: Option<TrustStore>,
    secrets: Option<Arc<SecretsResolver>>,
    os: Option<Arc<dyn OsAdapter>>,
    web: Option<Arc<dyn WebEngine>>,
    orchestrator: OrchestratorConfig,
    verifier: VerifierConfig,
}

impl Default for ServicesBuilder {
    fn default() -> Self {
        ServicesBuilder {
            store: None,
            audit: None,
            checkpoints: None,
            policy: None,
            trust: None,
            secrets: None,
            os: None,
            web: None,
            orchestrator: OrchestratorConfig::default(),
            verifier: VerifierConfig::default(),
        }
    }
}

impl ServicesBuilder {
    pub fn store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn trust(mut self, trust: TrustStore) -> Self {
        self.trust = Some(trust);
        self
    }

    pub fn secrets(mut self, secrets: Arc<SecretsResolver>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn os_adapter(mut self, os: Arc<dyn OsAdapter>) -> Self {
        self.os = Some(os);
        self
    }

    pub fn web_engine(mut self, web: Arc<dyn WebEngine>) -> Self {
        self.web = Some(web);
        self
    }

    pub fn orchestrator(mut self, config: OrchestratorConfig) -> Self {
        self.orchestrator = config;
        self
    }

    pub fn verifier(mut self, config: VerifierConfig) -> Self {
        self.verifier = config;
        self
    }

    pub fn build(self) -> Arc<Services> {
        Arc::new(Services {
            store: self.store.unwrap_or_else(|| Arc::new(MemoryRunStore::new())),
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
            checkpoints: self
                .checkpoints
                .unwrap_or_else(|| Arc::new(MemoryCheckpointStore::new())),
            policy: Arc::new(PolicyEngine::new(self.policy.unwrap_or_default())),
            trust: Arc::new(self.trust.unwrap_or_default()),
            secrets: self
                .secrets
                .unwrap_or_else(|| Arc::new(SecretsResolver::with_environment())),
            metrics: Arc::new(MetricsHub::new()),
            os: self.os.unwrap_or_else(|| Arc::new(LocalOsAdapter::new())),
            web: self.web,
            planner: Arc::new(PlannerL2::new()),
            orchestrator: self.orchestrator,
            verifier: self.verifier,
        })
    }
}
