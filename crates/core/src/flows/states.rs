use std::fmt::Debug;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowType {
    Quotation,
    Issuance,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotationStage {
    AwaitingDetails,
    AnalyzingInput,
    GeneratingQuote,
    QuoteReady,
}

impl QuotationStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingDetails => "awaiting_details",
            Self::AnalyzingInput => "analyzing_input",
            Self::GeneratingQuote => "generating_quote",
            Self::QuoteReady => "quote_ready",
        }
    }

    /// Detail collection in progress.
    pub fn is_collecting(self) -> bool {
        matches!(self, Self::AwaitingDetails | Self::AnalyzingInput)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotationEvent {
    InputReceived,
    DetailsMissing,
    DetailsResolved,
    QuoteGenerated,
    VehicleRejected,
    AlternativesExhausted,
    PurchaseRequested,
    ChangeRequested,
    FollowUp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuanceStage {
    NeedsQuotation,
    RequestingClientData,
    ConfirmingPurchase,
    Processing,
    Completed,
}

impl IssuanceStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeedsQuotation => "needs_quotation",
            Self::RequestingClientData => "requesting_client_data",
            Self::ConfirmingPurchase => "confirming_purchase",
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssuanceEvent {
    QuotationLocated,
    QuotationMissing,
    HandoffLimitReached,
    PlanSelected,
    PlanUnresolved,
    ClientDataIncomplete,
    ClientDataComplete,
    Confirmed,
    Declined,
    Ambiguous,
    IssuanceSucceeded,
    IssuanceFailed,
    FollowUp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FlowContext {
    pub missing_required_fields: Vec<String>,
}

impl FlowContext {
    pub fn missing(fields: Vec<String>) -> Self {
        Self { missing_required_fields: fields }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    PromptForDetails,
    PriceVehicle,
    TryAlternatives,
    PresentQuote,
    HandOffToIssuance,
    AnswerInline,
    PresentOptions,
    HandOffToQuotation,
    PromptPlanSelection,
    RequestClientData,
    PresentSummary,
    SubmitIssuance,
    RecordPolicy,
    AnswerFollowUp,
    EscalateToHuman,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome<S, E> {
    pub from: S,
    pub to: S,
    pub event: E,
    pub actions: Vec<FlowAction>,
}

impl<S, E> TransitionOutcome<S, E>
where
    S: Clone + Debug,
    E: Clone + Debug,
{
    pub fn requires(&self, action: &FlowAction) -> bool {
        self.actions.contains(action)
    }
}
