//! Task handlers and their registry.
//!
//! A handler owns one narrow task. `can_handle` is a pure routing heuristic;
//! `process` advances the handler's typed record in the turn context and must
//! leave visible progress behind: one assistant message, or an escalation
//! request the orchestrator turns into one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

use autopoliza_core::audit::{AuditContext, AuditSink};
use autopoliza_core::config::{ConsultationConfig, RoutingConfig};
use autopoliza_core::context::TurnState;
use autopoliza_core::domain::quotation::Quotation;
use autopoliza_core::domain::session::HandlerKind;
use autopoliza_core::errors::DomainError;
use autopoliza_core::flows::FlowTransitionError;
use autopoliza_db::RepositoryError;

use crate::collaborators::{CollaboratorError, Collaborators};

pub mod consultation;
pub mod escalation;
pub mod issuance;
pub mod quotation;

pub use consultation::ConsultationHandler;
pub use escalation::EscalationHandler;
pub use issuance::IssuanceHandler;
pub use quotation::QuotationHandler;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("session store failure: {0}")]
    Store(#[from] RepositoryError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("handler fault: {0}")]
    Internal(String),
}

impl From<FlowTransitionError> for HandlerError {
    fn from(value: FlowTransitionError) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<DomainError> for HandlerError {
    fn from(value: DomainError) -> Self {
        Self::Internal(value.to_string())
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    fn kind(&self) -> HandlerKind;

    /// Routing heuristic. Must not mutate anything.
    fn can_handle(&self, input: &str, state: &TurnState) -> bool;

    async fn process(&self, state: &mut TurnState) -> Result<(), HandlerError>;
}

/// Handlers available to one orchestrator, keyed by kind. Built once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKind, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// The four production handlers wired to `collaborators`.
    pub fn standard(
        collaborators: &Collaborators,
        routing: &RoutingConfig,
        consultation: &ConsultationConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let mut registry = Self::default();
        registry.register(ConsultationHandler::new(
            collaborators.retrieval.clone(),
            collaborators.timeout,
            consultation.clone(),
        ));
        registry.register(QuotationHandler::new(
            collaborators.pricing.clone(),
            collaborators.timeout,
            routing.max_detail_rounds,
            audit.clone(),
        ));
        registry.register(IssuanceHandler::new(
            collaborators.issuance.clone(),
            collaborators.timeout,
            routing.max_quotation_handoffs,
            audit,
        ));
        registry.register(EscalationHandler::new(routing));
        registry
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: Handler + 'static,
    {
        self.register_arc(Arc::new(handler));
    }

    /// Replaces any handler already registered for the same kind.
    pub fn register_arc(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: HandlerKind) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: HandlerKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

pub(crate) fn audit_context(state: &TurnState, handler: HandlerKind) -> AuditContext {
    AuditContext::new(Some(state.session_id.clone()), state.correlation_id.clone(), handler.as_str())
}

/// Numbered plan lines in presentation order.
pub(crate) fn plan_list(quotation: &Quotation) -> String {
    quotation
        .plans
        .iter()
        .enumerate()
        .map(|(index, plan)| {
            format!(
                "{}. {}: {} al año ({} al mes)",
                index + 1,
                plan.name,
                format_money(plan.annual_premium),
                format_money(plan.monthly_premium)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Peso amounts with dot thousands separators and no decimals: `$1.200.000`.
pub fn format_money(amount: Decimal) -> String {
    let rounded = amount.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    let digits = rounded.abs().trunc().to_string();

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(digit);
    }

    if rounded.is_sign_negative() && !rounded.is_zero() {
        format!("-${grouped}")
    } else {
        format!("${grouped}")
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::format_money;

    #[test]
    fn money_uses_dot_grouping_without_decimals() {
        assert_eq!(format_money(Decimal::new(1_200_000, 0)), "$1.200.000");
        assert_eq!(format_money(Decimal::new(7_083_333, 2)), "$70.833");
        assert_eq!(format_money(Decimal::new(2_083_350, 2)), "$20.834");
        assert_eq!(format_money(Decimal::new(850, 0)), "$850");
        assert_eq!(format_money(Decimal::ZERO), "$0");
    }
}
