use std::fmt::Debug;

use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::flows::states::{
    FlowAction, FlowContext, FlowType, IssuanceEvent, IssuanceStage, QuotationEvent,
    QuotationStage, TransitionOutcome,
};

pub trait FlowDefinition {
    type State: Clone + Debug;
    type Event: Clone + Debug;

    fn flow_type(&self) -> FlowType;
    fn initial_state(&self) -> Self::State;
    fn transition(
        &self,
        current: &Self::State,
        event: &Self::Event,
        context: &FlowContext,
    ) -> Result<TransitionOutcome<Self::State, Self::Event>, FlowTransitionError>;
}

/// Vehicle quotation: collect details, price, then stay in `QuoteReady`.
#[derive(Clone, Debug, Default)]
pub struct QuotationFlow;

impl FlowDefinition for QuotationFlow {
    type State = QuotationStage;
    type Event = QuotationEvent;

    fn flow_type(&self) -> FlowType {
        FlowType::Quotation
    }

    fn initial_state(&self) -> QuotationStage {
        QuotationStage::AwaitingDetails
    }

    fn transition(
        &self,
        current: &QuotationStage,
        event: &QuotationEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome<QuotationStage, QuotationEvent>, FlowTransitionError> {
        transition_quotation(current, event, context)
    }
}

/// Policy issuance: locate quotation, collect policyholder data, confirm, submit once.
#[derive(Clone, Debug, Default)]
pub struct IssuanceFlow;

impl FlowDefinition for IssuanceFlow {
    type State = IssuanceStage;
    type Event = IssuanceEvent;

    fn flow_type(&self) -> FlowType {
        FlowType::Issuance
    }

    fn initial_state(&self) -> IssuanceStage {
        IssuanceStage::NeedsQuotation
    }

    fn transition(
        &self,
        current: &IssuanceStage,
        event: &IssuanceEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome<IssuanceStage, IssuanceEvent>, FlowTransitionError> {
        transition_issuance(current, event, context)
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn flow_type(&self) -> FlowType {
        self.flow.flow_type()
    }

    pub fn initial_state(&self) -> F::State {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: &F::State,
        event: &F::Event,
        context: &FlowContext,
    ) -> Result<TransitionOutcome<F::State, F::Event>, FlowTransitionError> {
        self.flow.transition(current, event, context)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: &F::State,
        event: &F::Event,
        context: &FlowContext,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome<F::State, F::Event>, FlowTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, event, context);
        let flow = format!("{:?}", self.flow_type());
        match &result {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::new(
                        audit,
                        "flow.transition_applied",
                        AuditCategory::Flow,
                        AuditOutcome::Success,
                    )
                    .with_metadata("flow", flow)
                    .with_metadata("from", format!("{:?}", outcome.from))
                    .with_metadata("to", format!("{:?}", outcome.to))
                    .with_metadata("event", format!("{:?}", outcome.event)),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::new(
                        audit,
                        "flow.transition_rejected",
                        AuditCategory::Flow,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("flow", flow)
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

impl Default for FlowEngine<QuotationFlow> {
    fn default() -> Self {
        Self::new(QuotationFlow)
    }
}

impl Default for FlowEngine<IssuanceFlow> {
    fn default() -> Self {
        Self::new(IssuanceFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("missing required fields before leaving {state} in {flow:?} flow: {missing_fields:?}")]
    MissingRequiredFields { flow: FlowType, state: String, missing_fields: Vec<String> },
    #[error("invalid {flow:?} transition from {state} using event {event}")]
    InvalidTransition { flow: FlowType, state: String, event: String },
}

fn invalid<S: Debug, E: Debug>(flow: FlowType, state: &S, event: &E) -> FlowTransitionError {
    FlowTransitionError::InvalidTransition {
        flow,
        state: format!("{state:?}"),
        event: format!("{event:?}"),
    }
}

fn transition_quotation(
    current: &QuotationStage,
    event: &QuotationEvent,
    context: &FlowContext,
) -> Result<TransitionOutcome<QuotationStage, QuotationEvent>, FlowTransitionError> {
    use FlowAction::{
        AnswerInline, EscalateToHuman, HandOffToIssuance, PresentOptions, PresentQuote,
        PriceVehicle, PromptForDetails, TryAlternatives,
    };
    use QuotationEvent::{
        AlternativesExhausted, ChangeRequested, DetailsMissing, DetailsResolved, FollowUp,
        InputReceived, PurchaseRequested, QuoteGenerated, VehicleRejected,
    };
    use QuotationStage::{AnalyzingInput, AwaitingDetails, GeneratingQuote, QuoteReady};

    let (to, actions) = match (current, event) {
        (AwaitingDetails, InputReceived) | (AnalyzingInput, InputReceived) => {
            (AnalyzingInput, Vec::new())
        }
        (AnalyzingInput, DetailsMissing) => (AwaitingDetails, vec![PromptForDetails]),
        (AwaitingDetails, DetailsResolved)
        | (AnalyzingInput, DetailsResolved)
        | (GeneratingQuote, DetailsResolved) => {
            if !context.missing_required_fields.is_empty() {
                return Err(FlowTransitionError::MissingRequiredFields {
                    flow: FlowType::Quotation,
                    state: format!("{current:?}"),
                    missing_fields: context.missing_required_fields.clone(),
                });
            }
            (GeneratingQuote, vec![PriceVehicle])
        }
        (GeneratingQuote, QuoteGenerated) => (QuoteReady, vec![PresentQuote]),
        (GeneratingQuote, VehicleRejected) => (GeneratingQuote, vec![TryAlternatives]),
        (GeneratingQuote, AlternativesExhausted) => (GeneratingQuote, vec![EscalateToHuman]),
        (QuoteReady, PurchaseRequested) => (QuoteReady, vec![HandOffToIssuance]),
        (QuoteReady, ChangeRequested) => (QuoteReady, vec![AnswerInline]),
        (QuoteReady, QuoteGenerated) => (QuoteReady, vec![PresentQuote]),
        (QuoteReady, FollowUp) => (QuoteReady, vec![PresentOptions]),
        _ => return Err(invalid(FlowType::Quotation, current, event)),
    };

    Ok(TransitionOutcome { from: *current, to, event: event.clone(), actions })
}

fn transition_issuance(
    current: &IssuanceStage,
    event: &IssuanceEvent,
    context: &FlowContext,
) -> Result<TransitionOutcome<IssuanceStage, IssuanceEvent>, FlowTransitionError> {
    use FlowAction::{
        AnswerFollowUp, EscalateToHuman, HandOffToQuotation, PresentSummary, PromptPlanSelection,
        RecordPolicy, RequestClientData, SubmitIssuance,
    };
    use IssuanceEvent::{
        Ambiguous, ClientDataComplete, ClientDataIncomplete, Confirmed, Declined, FollowUp,
        HandoffLimitReached, IssuanceFailed, IssuanceSucceeded, PlanSelected, PlanUnresolved,
        QuotationLocated, QuotationMissing,
    };
    use IssuanceStage::{
        Completed, ConfirmingPurchase, NeedsQuotation, Processing, RequestingClientData,
    };

    let (to, actions) = match (current, event) {
        (NeedsQuotation, QuotationLocated) => (RequestingClientData, vec![RequestClientData]),
        (NeedsQuotation, QuotationMissing) => (NeedsQuotation, vec![HandOffToQuotation]),
        (NeedsQuotation, HandoffLimitReached) => (NeedsQuotation, vec![EscalateToHuman]),
        (RequestingClientData, PlanUnresolved) => {
            (RequestingClientData, vec![PromptPlanSelection])
        }
        (RequestingClientData, PlanSelected) | (RequestingClientData, ClientDataIncomplete) => {
            (RequestingClientData, vec![RequestClientData])
        }
        (RequestingClientData, ClientDataComplete) => {
            if !context.missing_required_fields.is_empty() {
                return Err(FlowTransitionError::MissingRequiredFields {
                    flow: FlowType::Issuance,
                    state: format!("{current:?}"),
                    missing_fields: context.missing_required_fields.clone(),
                });
            }
            (ConfirmingPurchase, vec![PresentSummary])
        }
        (ConfirmingPurchase, Confirmed) => (Processing, vec![SubmitIssuance]),
        (ConfirmingPurchase, Declined) => (RequestingClientData, vec![RequestClientData]),
        (ConfirmingPurchase, Ambiguous) => (ConfirmingPurchase, vec![PresentSummary]),
        (Processing, IssuanceSucceeded) => (Completed, vec![RecordPolicy]),
        (Processing, IssuanceFailed) => (Processing, vec![EscalateToHuman]),
        (Completed, FollowUp) => (Completed, vec![AnswerFollowUp]),
        _ => return Err(invalid(FlowType::Issuance, current, event)),
    };

    Ok(TransitionOutcome { from: *current, to, event: event.clone(), actions })
}

#[cfg(test)]
mod tests {
    use crate::audit::{AuditContext, InMemoryAuditSink};
    use crate::domain::session::SessionId;
    use crate::flows::engine::{FlowEngine, FlowTransitionError, IssuanceFlow, QuotationFlow};
    use crate::flows::states::{
        FlowAction, FlowContext, FlowType, IssuanceEvent, IssuanceStage, QuotationEvent,
        QuotationStage,
    };

    #[test]
    fn quotation_happy_path_reaches_quote_ready() {
        let engine = FlowEngine::new(QuotationFlow);
        let context = FlowContext::default();
        let mut state = engine.initial_state();

        state = engine
            .apply(&state, &QuotationEvent::InputReceived, &context)
            .expect("awaiting -> analyzing")
            .to;
        assert_eq!(state, QuotationStage::AnalyzingInput);
        state = engine
            .apply(&state, &QuotationEvent::DetailsResolved, &context)
            .expect("analyzing -> generating")
            .to;
        let ready = engine
            .apply(&state, &QuotationEvent::QuoteGenerated, &context)
            .expect("generating -> ready");

        assert_eq!(ready.to, QuotationStage::QuoteReady);
        assert!(ready.requires(&FlowAction::PresentQuote));
    }

    #[test]
    fn quotation_resolution_rejects_missing_required_fields() {
        let engine = FlowEngine::<QuotationFlow>::default();
        let error = engine
            .apply(
                &QuotationStage::AnalyzingInput,
                &QuotationEvent::DetailsResolved,
                &FlowContext::missing(vec!["body_class".to_owned()]),
            )
            .expect_err("must reject unresolved body class");

        assert!(matches!(
            error,
            FlowTransitionError::MissingRequiredFields { flow: FlowType::Quotation, .. }
        ));
    }

    #[test]
    fn quote_ready_never_regresses_to_detail_collection() {
        let engine = FlowEngine::<QuotationFlow>::default();
        for event in [QuotationEvent::InputReceived, QuotationEvent::DetailsMissing] {
            let error = engine
                .apply(&QuotationStage::QuoteReady, &event, &FlowContext::default())
                .expect_err("quote ready is re-entrant only");
            assert!(matches!(error, FlowTransitionError::InvalidTransition { .. }));
        }

        for event in [
            QuotationEvent::PurchaseRequested,
            QuotationEvent::ChangeRequested,
            QuotationEvent::FollowUp,
        ] {
            let outcome = engine
                .apply(&QuotationStage::QuoteReady, &event, &FlowContext::default())
                .expect("re-entrant event");
            assert_eq!(outcome.to, QuotationStage::QuoteReady);
        }
    }

    #[test]
    fn rejected_vehicle_escalates_instead_of_collecting_again() {
        let engine = FlowEngine::<QuotationFlow>::default();
        let retry = engine
            .apply(
                &QuotationStage::GeneratingQuote,
                &QuotationEvent::VehicleRejected,
                &FlowContext::default(),
            )
            .expect("rejection tries alternatives");
        assert_eq!(retry.actions, vec![FlowAction::TryAlternatives]);

        let exhausted = engine
            .apply(&retry.to, &QuotationEvent::AlternativesExhausted, &FlowContext::default())
            .expect("exhausted alternatives escalate");
        assert_eq!(exhausted.to, QuotationStage::GeneratingQuote);
        assert_eq!(exhausted.actions, vec![FlowAction::EscalateToHuman]);
    }

    #[test]
    fn issuance_happy_path_reaches_completed() {
        let engine = FlowEngine::new(IssuanceFlow);
        let context = FlowContext::default();
        let events = [
            IssuanceEvent::QuotationLocated,
            IssuanceEvent::PlanSelected,
            IssuanceEvent::ClientDataComplete,
            IssuanceEvent::Confirmed,
            IssuanceEvent::IssuanceSucceeded,
        ];

        let mut state = engine.initial_state();
        for event in &events {
            state = engine.apply(&state, event, &context).expect("happy path").to;
        }

        assert_eq!(state, IssuanceStage::Completed);
        let follow_up = engine
            .apply(&state, &IssuanceEvent::FollowUp, &context)
            .expect("completed is re-entrant");
        assert_eq!(follow_up.to, IssuanceStage::Completed);
    }

    #[test]
    fn declined_confirmation_returns_to_client_data_only() {
        let engine = FlowEngine::<IssuanceFlow>::default();
        let outcome = engine
            .apply(
                &IssuanceStage::ConfirmingPurchase,
                &IssuanceEvent::Declined,
                &FlowContext::default(),
            )
            .expect("declined");
        assert_eq!(outcome.to, IssuanceStage::RequestingClientData);

        let error = engine
            .apply(
                &IssuanceStage::ConfirmingPurchase,
                &IssuanceEvent::QuotationMissing,
                &FlowContext::default(),
            )
            .expect_err("confirming never falls back to needs quotation");
        assert!(matches!(
            error,
            FlowTransitionError::InvalidTransition { flow: FlowType::Issuance, .. }
        ));
    }

    #[test]
    fn failed_submission_does_not_advance() {
        let engine = FlowEngine::<IssuanceFlow>::default();
        let outcome = engine
            .apply(
                &IssuanceStage::Processing,
                &IssuanceEvent::IssuanceFailed,
                &FlowContext::default(),
            )
            .expect("failure is a valid event");

        assert_eq!(outcome.to, IssuanceStage::Processing);
        assert_eq!(outcome.actions, vec![FlowAction::EscalateToHuman]);
    }

    #[test]
    fn completed_rejects_earlier_stage_events() {
        let engine = FlowEngine::<IssuanceFlow>::default();
        for event in [
            IssuanceEvent::QuotationMissing,
            IssuanceEvent::ClientDataIncomplete,
            IssuanceEvent::Confirmed,
        ] {
            assert!(engine
                .apply(&IssuanceStage::Completed, &event, &FlowContext::default())
                .is_err());
        }
    }

    #[test]
    fn transition_emits_audit_event() {
        let engine = FlowEngine::<IssuanceFlow>::default();
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new(Some(SessionId("S-7".to_owned())), "turn-42", "issuance");

        engine
            .apply_with_audit(
                &IssuanceStage::NeedsQuotation,
                &IssuanceEvent::QuotationLocated,
                &FlowContext::default(),
                &sink,
                &audit,
            )
            .expect("transition should succeed");
        let _ = engine.apply_with_audit(
            &IssuanceStage::Completed,
            &IssuanceEvent::Confirmed,
            &FlowContext::default(),
            &sink,
            &audit,
        );

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "flow.transition_applied");
        assert_eq!(events[0].correlation_id, "turn-42");
        assert_eq!(events[1].event_type, "flow.transition_rejected");
    }
}
