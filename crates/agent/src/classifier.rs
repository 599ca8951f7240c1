//! Intent classification for routing.
//!
//! The classifier is advisory: the orchestrator decides whether to accept its
//! recommendation. With an LLM configured the model is asked first; any failure
//! or malformed reply falls back to keyword rules, which are deterministic for a
//! given input and context.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use autopoliza_core::context::TurnState;
use autopoliza_core::domain::session::HandlerKind;
use autopoliza_core::flows::{IssuanceStage, QuotationStage};

use crate::extraction::{extract_vehicle, is_greeting, mentions_any, tokenize};
use crate::llm::LlmClient;

pub(crate) const QUOTATION_KEYWORDS: &[&str] = &[
    "cotizar",
    "cotizacion",
    "cotiza",
    "cotizame",
    "cuanto cuesta",
    "cuanto vale",
    "precio del seguro",
    "asegurar mi",
];

pub(crate) const PURCHASE_KEYWORDS: &[&str] = &[
    "comprar",
    "comprarlo",
    "comprarla",
    "compra",
    "acepto",
    "proceder",
    "adquirir",
    "contratar",
    "expedir",
    "lo quiero",
    "la quiero",
    "tomarlo",
];

const HUMAN_KEYWORDS: &[&str] = &["asesor", "humano", "persona", "agente"];
const COMPLAINT_KEYWORDS: &[&str] = &["queja", "reclamo", "mal servicio", "pesimo"];
const VEHICLE_HINTS: &[&str] = &["toyota", "ford", "chevrolet", "2020", "2019", "sedan", "suv"];
const ACCEPTANCE_HINTS: &[&str] =
    &["acepto", "comprar", "comprarlo", "proceder", "lo quiero", "la quiero", "contratar"];
const CLIENT_DATA_HINTS: &[&str] = &["cedula", "telefono", "celular", "nombre", "correo"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    Consultation,
    QuotationRequest,
    QuotationDetails,
    PurchaseIntent,
    ClientData,
    HumanRequest,
    Complaint,
}

impl Intent {
    pub const ALL: [Intent; 8] = [
        Intent::Greeting,
        Intent::Consultation,
        Intent::QuotationRequest,
        Intent::QuotationDetails,
        Intent::PurchaseIntent,
        Intent::ClientData,
        Intent::HumanRequest,
        Intent::Complaint,
    ];

    /// Every intent is bound to exactly one handler.
    pub fn handler(self) -> HandlerKind {
        match self {
            Self::Greeting | Self::Consultation => HandlerKind::Consultation,
            Self::QuotationRequest | Self::QuotationDetails => HandlerKind::Quotation,
            Self::PurchaseIntent | Self::ClientData => HandlerKind::Issuance,
            Self::HumanRequest | Self::Complaint => HandlerKind::Escalation,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::Consultation => "consultation",
            Self::QuotationRequest => "quotation_request",
            Self::QuotationDetails => "quotation_details",
            Self::PurchaseIntent => "purchase_intent",
            Self::ClientData => "client_data",
            Self::HumanRequest => "human_request",
            Self::Complaint => "complaint",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intent {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|intent| intent.as_str() == wanted)
            .ok_or_else(|| format!("unknown intent `{value}`"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Llm,
    Rules,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub handler: HandlerKind,
    pub confidence: f64,
    pub reasoning: String,
    pub source: ClassificationSource,
}

impl Classification {
    fn new(intent: Intent, confidence: f64, reasoning: impl Into<String>, source: ClassificationSource) -> Self {
        Self { intent, handler: intent.handler(), confidence, reasoning: reasoning.into(), source }
    }

    fn retarget(&mut self, intent: Intent, reasoning: &str) {
        self.intent = intent;
        self.handler = intent.handler();
        self.confidence = (self.confidence + 0.2).min(0.9);
        self.reasoning = format!("{}; {reasoning}", self.reasoning);
    }
}

/// Conversation facts that bias classification toward continuing a flow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextSignals {
    pub awaiting_details: bool,
    pub quote_ready: bool,
    pub requesting_client_data: bool,
}

impl ContextSignals {
    pub fn from_state(state: &TurnState) -> Self {
        let quotation = &state.context.quotation;
        Self {
            awaiting_details: quotation.is_collecting(),
            quote_ready: quotation.stage == Some(QuotationStage::QuoteReady),
            requesting_client_data: state.context.issuance.stage
                == Some(IssuanceStage::RequestingClientData),
        }
    }

    fn describe(&self) -> String {
        let mut facts = Vec::new();
        if self.awaiting_details {
            facts.push("a quotation is waiting for vehicle details");
        }
        if self.quote_ready {
            facts.push("a quotation is ready and awaiting the client's decision");
        }
        if self.requesting_client_data {
            facts.push("issuance is collecting policyholder data");
        }
        if facts.is_empty() {
            "no active flow".to_string()
        } else {
            facts.join("; ")
        }
    }
}

/// Keyword-priority classification: quotation, purchase, human request,
/// complaint, greeting, then consultation. Flow context is left to the
/// orchestrator's active-flow rule, so `_signals` never changes the result.
pub fn classify_with_rules(input: &str, _signals: &ContextSignals) -> Classification {
    use ClassificationSource::Rules;

    let tokens = tokenize(input);
    if mentions_any(&tokens, QUOTATION_KEYWORDS) {
        Classification::new(Intent::QuotationRequest, 0.7, "quotation keywords", Rules)
    } else if mentions_any(&tokens, PURCHASE_KEYWORDS) {
        Classification::new(Intent::PurchaseIntent, 0.7, "purchase keywords", Rules)
    } else if mentions_any(&tokens, HUMAN_KEYWORDS) {
        Classification::new(Intent::HumanRequest, 0.8, "human request keywords", Rules)
    } else if mentions_any(&tokens, COMPLAINT_KEYWORDS) {
        Classification::new(Intent::Complaint, 0.7, "complaint keywords", Rules)
    } else if is_greeting(input) {
        Classification::new(Intent::Greeting, 0.6, "greeting vocabulary", Rules)
    } else {
        Classification::new(Intent::Consultation, 0.6, "default to consultation", Rules)
    }
}

/// Biases a model classification toward the flow in progress. A message that
/// asks for a quotation is never turned into a purchase.
fn apply_context(
    mut classification: Classification,
    input: &str,
    tokens: &[String],
    signals: &ContextSignals,
) -> Classification {
    if classification.handler == HandlerKind::Escalation {
        return classification;
    }

    if signals.awaiting_details
        && (mentions_any(tokens, VEHICLE_HINTS) || !extract_vehicle(input).is_empty())
    {
        classification.retarget(Intent::QuotationDetails, "vehicle details while collecting");
    } else if signals.quote_ready
        && mentions_any(tokens, ACCEPTANCE_HINTS)
        && !mentions_any(tokens, QUOTATION_KEYWORDS)
    {
        classification.retarget(Intent::PurchaseIntent, "acceptance while quote is ready");
    } else if signals.requesting_client_data
        && (input.contains('@') || mentions_any(tokens, CLIENT_DATA_HINTS))
    {
        classification.retarget(Intent::ClientData, "policyholder data while collecting");
    }
    classification
}

#[derive(Deserialize)]
struct LlmReply {
    intent: String,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

/// Parses `{intent, confidence, reasoning}`, tolerating a fenced code block.
pub fn parse_llm_reply(reply: &str) -> Result<Classification, String> {
    let trimmed = reply.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    let parsed: LlmReply =
        serde_json::from_str(body).map_err(|error| format!("invalid classifier json: {error}"))?;
    let intent = parsed.intent.parse::<Intent>()?;
    if !(0.0..=1.0).contains(&parsed.confidence) {
        return Err(format!("confidence {} outside [0, 1]", parsed.confidence));
    }
    Ok(Classification::new(intent, parsed.confidence, parsed.reasoning, ClassificationSource::Llm))
}

fn classification_prompt(input: &str, signals: &ContextSignals) -> String {
    let intents = Intent::ALL.iter().map(|intent| intent.as_str()).collect::<Vec<_>>().join(", ");
    format!(
        "Classify the client's message for a vehicle insurance assistant.\n\
         Intents: {intents}.\n\
         Conversation context: {}.\n\
         Message: \"{input}\"\n\
         Reply with only a JSON object: {{\"intent\": \"<intent>\", \"confidence\": <0..1>, \"reasoning\": \"<short>\"}}",
        signals.describe()
    )
}

#[derive(Clone, Default)]
pub struct IntentClassifier {
    llm: Option<Arc<dyn LlmClient>>,
}

impl IntentClassifier {
    pub fn rules_only() -> Self {
        Self { llm: None }
    }

    pub fn with_llm(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm: Some(llm) }
    }

    pub fn uses_llm(&self) -> bool {
        self.llm.is_some()
    }

    pub async fn classify(&self, input: &str, state: &TurnState) -> Classification {
        let signals = ContextSignals::from_state(state);

        if let Some(llm) = &self.llm {
            match llm.complete(&classification_prompt(input, &signals)).await {
                Ok(reply) => match parse_llm_reply(&reply) {
                    Ok(classification) => {
                        let tokens = tokenize(input);
                        return apply_context(classification, input, &tokens, &signals);
                    }
                    Err(reason) => debug!(
                        session_id = %state.session_id,
                        correlation_id = %state.correlation_id,
                        reason = %reason,
                        "classifier reply unusable, using rules"
                    ),
                },
                Err(error) => warn!(
                    session_id = %state.session_id,
                    correlation_id = %state.correlation_id,
                    error = %error,
                    "classifier llm call failed, using rules"
                ),
            }
        }

        classify_with_rules(input, &signals)
    }
}
