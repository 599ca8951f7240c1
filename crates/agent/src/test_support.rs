//! Scripted collaborators and turn fixtures for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use autopoliza_core::context::{ConversationContext, TurnState};
use autopoliza_core::domain::policy::PolicyNumber;
use autopoliza_core::domain::quotation::{PlanOffer, Quotation};
use autopoliza_core::domain::session::{Message, ParticipantKind, Session, SessionId};
use autopoliza_core::domain::vehicle::{BodyClass, VehicleDetails};
use rust_decimal::Decimal;

use crate::collaborators::catalog::plan_offers;
use crate::collaborators::{
    CollaboratorError, IssuanceBackend, IssuanceOutcome, IssuanceRequest, PricingEngine,
    RetrievalAnswer, RetrievalBackend,
};

pub fn session() -> Session {
    Session::new(SessionId("S-test".to_string()), ParticipantKind::Client)
}

/// Fresh turn state with `input` already pushed as the client's utterance.
pub fn turn_state(input: &str) -> TurnState {
    turn_state_with(input, Vec::new(), ConversationContext::default())
}

pub fn turn_state_with(input: &str, history: Vec<Message>, context: ConversationContext) -> TurnState {
    let mut state = TurnState::new(&session(), "turn-test", history, context);
    state.push_user_input(input);
    state
}

pub fn last_reply(state: &TurnState) -> String {
    state.produced_messages().last().map(|message| message.content.clone()).unwrap_or_default()
}

pub fn toyota() -> VehicleDetails {
    VehicleDetails {
        brand: "TOYOTA".to_string(),
        body_class: BodyClass::Automovil,
        model_year: Some(2020),
        line: Some("COROLLA".to_string()),
        color: None,
    }
}

pub fn quotation(plans: Vec<PlanOffer>) -> Quotation {
    Quotation::new(SessionId("S-test".to_string()), toyota(), plans, false)
}

pub fn three_plan_quotation() -> Quotation {
    quotation(plan_offers(Decimal::new(78_000_000, 0), false))
}

pub struct ScriptedRetrieval {
    answer: Result<RetrievalAnswer, CollaboratorError>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedRetrieval {
    pub fn new(answer: Result<RetrievalAnswer, CollaboratorError>) -> Self {
        Self { answer, calls: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl RetrievalBackend for ScriptedRetrieval {
    fn name(&self) -> &'static str {
        "retrieval"
    }

    async fn query(
        &self,
        _question: &str,
        _history: &[String],
    ) -> Result<RetrievalAnswer, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }
}

/// Pricing engine that fails every call.
pub struct UnavailablePricing;

#[async_trait]
impl PricingEngine for UnavailablePricing {
    fn name(&self) -> &'static str {
        "pricing"
    }

    async fn validate(&self, _vehicle: &VehicleDetails) -> Result<bool, CollaboratorError> {
        Err(CollaboratorError::Unavailable { backend: "pricing", detail: "down".to_string() })
    }

    async fn quote(&self, _vehicle: &VehicleDetails) -> Result<Vec<PlanOffer>, CollaboratorError> {
        Err(CollaboratorError::Unavailable { backend: "pricing", detail: "down".to_string() })
    }

    async fn alternatives(
        &self,
        _vehicle: &VehicleDetails,
        _limit: usize,
    ) -> Result<Vec<VehicleDetails>, CollaboratorError> {
        Err(CollaboratorError::Unavailable { backend: "pricing", detail: "down".to_string() })
    }
}

pub struct ScriptedIssuance {
    outcome: Result<IssuanceOutcome, CollaboratorError>,
    requests: Arc<Mutex<Vec<IssuanceRequest>>>,
}

impl ScriptedIssuance {
    pub fn issued(number: &str) -> Self {
        Self::new(Ok(IssuanceOutcome::Issued { policy_number: PolicyNumber(number.to_string()) }))
    }

    pub fn new(outcome: Result<IssuanceOutcome, CollaboratorError>) -> Self {
        Self { outcome, requests: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn requests(&self) -> Arc<Mutex<Vec<IssuanceRequest>>> {
        self.requests.clone()
    }
}

#[async_trait]
impl IssuanceBackend for ScriptedIssuance {
    fn name(&self) -> &'static str {
        "issuance"
    }

    async fn issue(&self, request: &IssuanceRequest) -> Result<IssuanceOutcome, CollaboratorError> {
        self.requests.lock().expect("requests lock").push(request.clone());
        self.outcome.clone()
    }
}
