//! Contracts for the services handlers call out to.
//!
//! Retrieval answers consultation questions, the pricing engine validates and
//! prices vehicles, and the issuance backend turns a confirmed purchase into a
//! policy. Each has an in-process implementation for local runs and tests and an
//! HTTP client for deployed backends. Every call from a handler goes through
//! [`with_timeout`], so a stalled backend surfaces as [`CollaboratorError::Timeout`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use autopoliza_core::domain::policy::{PolicyNumber, Policyholder};
use autopoliza_core::domain::quotation::{PlanOffer, Quotation};
use autopoliza_core::domain::vehicle::VehicleDetails;

pub mod catalog;
pub mod faq;
pub mod http;
pub mod issuance;

pub use catalog::{CatalogEntry, CatalogError, CatalogPricingEngine};
pub use faq::FaqRetrieval;
pub use http::{HttpIssuanceBackend, HttpRetrievalBackend};
pub use issuance::LocalIssuanceBackend;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("{backend} timed out after {secs}s")]
    Timeout { backend: &'static str, secs: u64 },
    #[error("{backend} unavailable: {detail}")]
    Unavailable { backend: &'static str, detail: String },
    #[error("{backend} rejected the request: {detail}")]
    Rejected { backend: &'static str, detail: String },
    #[error("{backend} returned a malformed response: {detail}")]
    Malformed { backend: &'static str, detail: String },
}

impl CollaboratorError {
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Timeout { backend, .. }
            | Self::Unavailable { backend, .. }
            | Self::Rejected { backend, .. }
            | Self::Malformed { backend, .. } => backend,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievalAnswer {
    pub answer: String,
    pub confidence: f64,
    #[serde(default)]
    pub sources: Vec<String>,
}

#[async_trait]
pub trait RetrievalBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Answers `question`. `history` carries recent client utterances, oldest first.
    async fn query(
        &self,
        question: &str,
        history: &[String],
    ) -> Result<RetrievalAnswer, CollaboratorError>;

    async fn health(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[async_trait]
pub trait PricingEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the vehicle exists in the insurable catalog.
    async fn validate(&self, vehicle: &VehicleDetails) -> Result<bool, CollaboratorError>;

    /// Plan offers in presentation order.
    async fn quote(&self, vehicle: &VehicleDetails) -> Result<Vec<PlanOffer>, CollaboratorError>;

    /// Catalog-nearest insurable vehicles, best candidate first.
    async fn alternatives(
        &self,
        vehicle: &VehicleDetails,
        limit: usize,
    ) -> Result<Vec<VehicleDetails>, CollaboratorError>;

    async fn health(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Payload sent to the issuance backend. Field names follow the backend's wire format.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IssuanceRequest {
    #[serde(rename = "identificacion_tomador")]
    pub identification: String,
    #[serde(rename = "celular_tomador")]
    pub mobile: String,
    #[serde(rename = "email_tomador")]
    pub email: String,
    #[serde(rename = "marca")]
    pub brand: String,
    #[serde(rename = "modelo")]
    pub model_year: String,
    #[serde(rename = "linea")]
    pub line: String,
    #[serde(rename = "clase")]
    pub body_class: String,
    pub color: String,
    #[serde(rename = "plan_poliza")]
    pub plan_name: String,
    #[serde(rename = "valor_total_poliza")]
    pub annual_premium: Decimal,
    #[serde(rename = "valor_mensual")]
    pub monthly_premium: Decimal,
}

impl IssuanceRequest {
    pub fn new(holder: &Policyholder, quotation: &Quotation, plan: &PlanOffer) -> Self {
        let vehicle = &quotation.vehicle;
        Self {
            identification: holder.identification.clone(),
            mobile: holder.mobile.clone(),
            email: holder.email.clone(),
            brand: vehicle.brand.clone(),
            model_year: vehicle.model_year.map(|year| year.to_string()).unwrap_or_default(),
            line: vehicle.line.clone().unwrap_or_default(),
            body_class: vehicle.body_class.label().to_string(),
            color: vehicle.color.clone().unwrap_or_default(),
            plan_name: plan.name.clone(),
            annual_premium: plan.annual_premium,
            monthly_premium: plan.monthly_premium,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssuanceOutcome {
    Issued { policy_number: PolicyNumber },
    /// The backend answered but refused to issue.
    Rejected { error: String },
}

#[async_trait]
pub trait IssuanceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Submits one issuance. Never retried by callers.
    async fn issue(&self, request: &IssuanceRequest) -> Result<IssuanceOutcome, CollaboratorError>;

    async fn health(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Runs `call`, converting an elapsed `limit` into [`CollaboratorError::Timeout`].
pub async fn with_timeout<T, F>(
    backend: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                event_name = "collaborator.timeout",
                backend,
                timeout_ms = limit.as_millis() as u64,
                "collaborator call timed out"
            );
            Err(CollaboratorError::Timeout { backend, secs: limit.as_secs() })
        }
    }
}

/// The external services one orchestrator instance talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub retrieval: Arc<dyn RetrievalBackend>,
    pub pricing: Arc<dyn PricingEngine>,
    pub issuance: Arc<dyn IssuanceBackend>,
    pub timeout: Duration,
}

impl Collaborators {
    /// FAQ retrieval, the bundled vehicle catalog and local policy numbering.
    pub fn in_process() -> Result<Self, CatalogError> {
        Ok(Self {
            retrieval: Arc::new(FaqRetrieval::default()),
            pricing: Arc::new(CatalogPricingEngine::bundled()?),
            issuance: Arc::new(LocalIssuanceBackend),
            timeout: Duration::from_secs(10),
        })
    }

    /// Health of each backend, keyed by backend name.
    pub async fn health(&self) -> Vec<(&'static str, Result<(), CollaboratorError>)> {
        let retrieval =
            with_timeout(self.retrieval.name(), self.timeout, self.retrieval.health()).await;
        let pricing = with_timeout(self.pricing.name(), self.timeout, self.pricing.health()).await;
        let issuance =
            with_timeout(self.issuance.name(), self.timeout, self.issuance.health()).await;
        vec![
            (self.retrieval.name(), retrieval),
            (self.pricing.name(), pricing),
            (self.issuance.name(), issuance),
        ]
    }
}
