use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::session::HandlerKind;

/// Why a session was handed to a human advisor.
///
/// Variants inferred from the client's words are listed in the order they are
/// checked; the remaining variants are raised by handlers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    ExplicitRequest,
    Confusion,
    TechnicalProblem,
    Cancellation,
    ProlongedConversation,
    Generic,
    VehicleNotInsurable,
    QuotationUnrecoverable,
    IssuanceFailed { detail: String },
    HandlerFault { handler: HandlerKind },
}

impl EscalationReason {
    pub fn priority(&self) -> CasePriority {
        match self {
            Self::TechnicalProblem
            | Self::Cancellation
            | Self::IssuanceFailed { .. }
            | Self::HandlerFault { .. } => CasePriority::High,
            Self::ExplicitRequest
            | Self::Confusion
            | Self::VehicleNotInsurable
            | Self::QuotationUnrecoverable => CasePriority::Medium,
            Self::ProlongedConversation | Self::Generic => CasePriority::Low,
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExplicitRequest => f.write_str("explicit request for a human advisor"),
            Self::Confusion => f.write_str("client needs additional clarification"),
            Self::TechnicalProblem => f.write_str("technical or functional problem reported"),
            Self::Cancellation => f.write_str("client wants to cancel or change a decision"),
            Self::ProlongedConversation => f.write_str("prolonged conversation without resolution"),
            Self::Generic => f.write_str("automatic escalation from detected patterns"),
            Self::VehicleNotInsurable => f.write_str("vehicle not insurable"),
            Self::QuotationUnrecoverable => f.write_str("quotation unrecoverable"),
            Self::IssuanceFailed { detail } => write!(f, "issuance backend failure: {detail}"),
            Self::HandlerFault { handler } => write!(f, "unexpected fault in {handler} handler"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CasePriority {
    Low,
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseComplexity {
    Low,
    Medium,
    High,
}

impl CaseComplexity {
    pub fn estimate(handlers_involved: usize, pending_actions: usize) -> Self {
        if handlers_involved >= 3 || pending_actions >= 3 {
            Self::High
        } else if handlers_involved >= 2 || pending_actions >= 2 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Structured hand-off note for the advisor channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSummary {
    pub reason: EscalationReason,
    pub total_messages: usize,
    pub handlers_involved: Vec<HandlerKind>,
    pub inferred_intent: String,
    pub pending_actions: Vec<String>,
    pub priority: CasePriority,
    pub complexity: CaseComplexity,
    pub quick_context: String,
    pub escalated_at: DateTime<Utc>,
}
