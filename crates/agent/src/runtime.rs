use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use autopoliza_core::audit::{AuditEvent, AuditSink};
use autopoliza_core::config::{AppConfig, BackendConfig};
use autopoliza_db::SessionStore;

use crate::classifier::IntentClassifier;
use crate::collaborators::{
    CatalogPricingEngine, Collaborators, FaqRetrieval, HttpIssuanceBackend, HttpRetrievalBackend,
    IssuanceBackend, LocalIssuanceBackend, PricingEngine, RetrievalBackend,
};
use crate::handlers::HandlerRegistry;
use crate::llm::HttpLlmClient;
use crate::orchestrator::{Orchestrator, TurnRequest, TurnResponse};

/// Writes audit events to the `audit` tracing target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        info!(
            target: "audit",
            event_name = %event.event_type,
            event_id = %event.event_id,
            session_id = event.session_id.as_ref().map(|id| id.0.as_str()).unwrap_or(""),
            correlation_id = %event.correlation_id,
            category = ?event.category,
            outcome = ?event.outcome,
            actor = %event.actor,
            metadata = ?event.metadata,
            "audit event"
        );
    }
}

/// HTTP clients where URLs are configured, in-process implementations elsewhere.
pub fn build_collaborators(config: &BackendConfig) -> Result<Collaborators> {
    let timeout = Duration::from_secs(config.timeout_secs);

    let retrieval: Arc<dyn RetrievalBackend> = match &config.retrieval_url {
        Some(url) => Arc::new(
            HttpRetrievalBackend::new(url.clone(), timeout).context("failed to build retrieval client")?,
        ),
        None => Arc::new(FaqRetrieval::default()),
    };

    let pricing: Arc<dyn PricingEngine> = match &config.catalog_path {
        Some(path) => Arc::new(
            CatalogPricingEngine::from_path(path)
                .with_context(|| format!("failed to load vehicle catalog {}", path.display()))?,
        ),
        None => Arc::new(CatalogPricingEngine::bundled().context("bundled vehicle catalog is invalid")?),
    };

    let issuance: Arc<dyn IssuanceBackend> = match &config.issuance_url {
        Some(url) => Arc::new(
            HttpIssuanceBackend::new(url.clone(), config.issuance_api_key.clone(), timeout)
                .context("failed to build issuance client")?,
        ),
        None => Arc::new(LocalIssuanceBackend),
    };

    info!(
        retrieval = retrieval.name(),
        remote_retrieval = config.retrieval_url.is_some(),
        remote_issuance = config.issuance_url.is_some(),
        custom_catalog = config.catalog_path.is_some(),
        "collaborators configured"
    );
    Ok(Collaborators { retrieval, pricing, issuance, timeout })
}

/// Shared handle to a fully wired orchestrator.
pub struct AgentRuntime {
    orchestrator: Arc<Orchestrator>,
}

impl AgentRuntime {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator: Arc::new(orchestrator) }
    }

    /// Wires classifier, collaborators and handlers from `config` over `store`.
    pub fn from_config(config: &AppConfig, store: Arc<dyn SessionStore>) -> Result<Self> {
        Self::from_config_with_audit(config, store, Arc::new(TracingAuditSink))
    }

    pub fn from_config_with_audit(
        config: &AppConfig,
        store: Arc<dyn SessionStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let collaborators = build_collaborators(&config.backends)?;
        let classifier = match HttpLlmClient::from_config(&config.llm)? {
            Some(client) => IntentClassifier::with_llm(Arc::new(client)),
            None => IntentClassifier::rules_only(),
        };
        let handlers = HandlerRegistry::standard(
            &collaborators,
            &config.routing,
            &config.consultation,
            audit.clone(),
        );

        info!(
            handlers = handlers.len(),
            classifier = if classifier.uses_llm() { "llm" } else { "rules" },
            "agent runtime ready"
        );
        let orchestrator =
            Orchestrator::new(store, handlers, classifier, config.routing.clone(), audit)
                .with_collaborators(collaborators);
        Ok(Self::new(orchestrator))
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    pub async fn handle_turn(&self, request: TurnRequest) -> TurnResponse {
        self.orchestrator.process_turn(request).await
    }
}
