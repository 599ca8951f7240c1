//! Per-session conversational state.
//!
//! Each handler owns one typed record inside [`ConversationContext`] and persists
//! it as its own state blob. On load the blobs are merged in
//! [`STATE_MERGE_ORDER`]; when two blobs carry the same top-level key the one
//! merged later wins.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::escalation::{CaseSummary, EscalationReason};
use crate::domain::policy::{ClientData, Policy};
use crate::domain::quotation::Quotation;
use crate::domain::session::{
    ControlMode, HandlerKind, Message, ParticipantKind, Session, SessionId, ROUTER,
};
use crate::domain::vehicle::{VehicleDetails, VehicleDraft};
use crate::flows::{IssuanceStage, QuotationStage};

/// Owners of persisted state blobs, in merge order.
pub const STATE_MERGE_ORDER: [&str; 5] = [ROUTER, "consultation", "quotation", "issuance", "escalation"];

/// Key under which callers pass an external image-classification result.
pub const IMAGE_ANALYSIS_KEY: &str = "image_analysis";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnFlags {
    /// Hand-off request. Consumed by whichever routing step acts on it.
    pub transfer_to: Option<HandlerKind>,
    /// Ends the turn after the current handler.
    #[serde(default)]
    pub force_end: bool,
}

impl TurnFlags {
    /// Hands the next turn to `target` and ends the current one.
    pub fn defer_to(&mut self, target: HandlerKind) {
        self.transfer_to = Some(target);
        self.force_end = true;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotationRecord {
    pub stage: Option<QuotationStage>,
    #[serde(default)]
    pub draft: VehicleDraft,
    #[serde(default)]
    pub detail_rounds: u8,
    pub quotation: Option<Quotation>,
    pub rejected_vehicle: Option<VehicleDetails>,
}

impl QuotationRecord {
    pub fn is_collecting(&self) -> bool {
        self.stage.map(QuotationStage::is_collecting).unwrap_or(false)
    }

    pub fn ready_quotation(&self) -> Option<&Quotation> {
        self.quotation.as_ref()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceRecord {
    pub stage: Option<IssuanceStage>,
    pub selected_plan: Option<String>,
    #[serde(default)]
    pub client: ClientData,
    #[serde(default)]
    pub quotation_handoffs: u8,
    pub policy: Option<Policy>,
    pub last_error: Option<String>,
}

impl IssuanceRecord {
    /// A purchase is underway and must not be abandoned by a misrouted turn.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self.stage,
            Some(
                IssuanceStage::RequestingClientData
                    | IssuanceStage::ConfirmingPurchase
                    | IssuanceStage::Processing
            )
        )
    }

    /// Any stage at all, including a finished purchase. Such sessions stay
    /// with the issuance handler until it passes the turn on.
    pub fn is_active(&self) -> bool {
        self.stage.is_some()
    }

    pub fn is_waiting_for_quotation(&self) -> bool {
        self.stage == Some(IssuanceStage::NeedsQuotation)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRecord {
    #[serde(default)]
    pub active: bool,
    pub reason: Option<EscalationReason>,
    pub summary: Option<CaseSummary>,
    #[serde(default)]
    pub escalation_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    #[serde(default)]
    pub flags: TurnFlags,
    #[serde(default)]
    pub quotation: QuotationRecord,
    #[serde(default)]
    pub issuance: IssuanceRecord,
    #[serde(default)]
    pub escalation: EscalationRecord,
    /// Caller-supplied values for the current turn only. Never persisted.
    #[serde(default, skip_serializing)]
    pub extra: BTreeMap<String, Value>,
}

impl ConversationContext {
    /// Rebuilds the context from persisted `(owner, blob)` pairs.
    pub fn from_state_blobs<I>(blobs: I) -> Result<Self, serde_json::Error>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let merged = merge_state_blobs(blobs);
        serde_json::from_value(Value::Object(merged))
    }

    /// The blob `owner` persists, or `None` when the owner keeps no state.
    pub fn state_blob(&self, owner: &str) -> Result<Option<Value>, serde_json::Error> {
        let (key, value) = match owner {
            ROUTER => ("flags", serde_json::to_value(&self.flags)?),
            "quotation" => ("quotation", serde_json::to_value(&self.quotation)?),
            "issuance" => ("issuance", serde_json::to_value(&self.issuance)?),
            "escalation" => ("escalation", serde_json::to_value(&self.escalation)?),
            _ => return Ok(None),
        };
        let mut blob = Map::new();
        blob.insert(key.to_string(), value);
        Ok(Some(Value::Object(blob)))
    }

    /// Vehicle attributes supplied by an external image classifier for this turn.
    pub fn image_analysis(&self) -> Option<VehicleDraft> {
        self.extra
            .get(IMAGE_ANALYSIS_KEY)
            .and_then(|value| serde_json::from_value::<VehicleDraft>(value.clone()).ok())
            .filter(|draft| !draft.is_empty())
    }
}

/// Shallow-merges blobs by top-level key in [`STATE_MERGE_ORDER`].
/// Owners outside that order are merged last, in the order given.
pub fn merge_state_blobs<I>(blobs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (String, Value)>,
{
    let mut ordered: Vec<(usize, usize, Value)> = blobs
        .into_iter()
        .enumerate()
        .map(|(arrival, (owner, blob))| {
            let rank = STATE_MERGE_ORDER
                .iter()
                .position(|known| *known == owner)
                .unwrap_or(STATE_MERGE_ORDER.len());
            (rank, arrival, blob)
        })
        .collect();
    ordered.sort_by_key(|(rank, arrival, _)| (*rank, *arrival));

    let mut merged = Map::new();
    for (_, _, blob) in ordered {
        if let Value::Object(entries) = blob {
            merged.extend(entries);
        }
    }
    merged
}

/// Records a handler produced during a turn that outlive the turn itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnArtifact {
    Quotation(Quotation),
    Policy(Policy),
}

/// Working object passed through one turn's routing and handler pipeline.
#[derive(Clone, Debug)]
pub struct TurnState {
    pub session_id: SessionId,
    pub correlation_id: String,
    pub participant_kind: ParticipantKind,
    pub control_mode: ControlMode,
    pub last_user_input: String,
    pub conversation_history: Vec<Message>,
    pub context: ConversationContext,
    pub current_handler: Option<HandlerKind>,
    pub needs_human_intervention: bool,
    pub escalation_reason: Option<EscalationReason>,
    persisted_messages: usize,
    produced: usize,
    artifacts: Vec<TurnArtifact>,
    touched: BTreeSet<HandlerKind>,
}

impl TurnState {
    pub fn new(
        session: &Session,
        correlation_id: impl Into<String>,
        conversation_history: Vec<Message>,
        context: ConversationContext,
    ) -> Self {
        let persisted_messages = conversation_history.len();
        Self {
            session_id: session.id.clone(),
            correlation_id: correlation_id.into(),
            participant_kind: session.participant_kind,
            control_mode: session.control_mode,
            last_user_input: String::new(),
            conversation_history,
            context,
            current_handler: session.current_handler,
            needs_human_intervention: false,
            escalation_reason: None,
            persisted_messages,
            produced: 0,
            artifacts: Vec::new(),
            touched: BTreeSet::new(),
        }
    }

    /// Records the client's utterance for this turn.
    pub fn push_user_input(&mut self, input: impl Into<String>) {
        let input = input.into();
        self.conversation_history.push(Message::user(self.session_id.clone(), input.clone()));
        self.last_user_input = input;
    }

    /// Appends an assistant message attributed to `handler`.
    pub fn reply(&mut self, handler: HandlerKind, content: impl Into<String>) {
        self.reply_as(handler.as_str(), content);
    }

    pub fn reply_as(&mut self, producer: &str, content: impl Into<String>) {
        self.conversation_history.push(Message::assistant(
            self.session_id.clone(),
            producer,
            content,
        ));
        self.produced += 1;
    }

    /// Number of assistant messages appended during this turn.
    pub fn produced_count(&self) -> usize {
        self.produced
    }

    /// Assistant messages appended during this turn, in order.
    pub fn produced_messages(&self) -> impl Iterator<Item = &Message> {
        self.unsaved_messages().iter().filter(|message| !message.is_user())
    }

    /// Messages appended since the history was loaded.
    pub fn unsaved_messages(&self) -> &[Message] {
        &self.conversation_history[self.persisted_messages.min(self.conversation_history.len())..]
    }

    /// Messages that existed before this turn began.
    pub fn prior_messages(&self) -> &[Message] {
        &self.conversation_history[..self.persisted_messages.min(self.conversation_history.len())]
    }

    pub fn request_escalation(&mut self, reason: EscalationReason) {
        self.needs_human_intervention = true;
        self.escalation_reason = Some(reason);
    }

    pub fn record_artifact(&mut self, artifact: TurnArtifact) {
        self.artifacts.push(artifact);
    }

    pub fn artifacts(&self) -> &[TurnArtifact] {
        &self.artifacts
    }

    /// Marks `handler` as having run so its record gets persisted.
    pub fn touch(&mut self, handler: HandlerKind) {
        self.touched.insert(handler);
    }

    pub fn touched_handlers(&self) -> impl Iterator<Item = HandlerKind> + '_ {
        self.touched.iter().copied()
    }

    /// Handlers that produced any message in the conversation so far.
    pub fn handlers_involved(&self) -> Vec<HandlerKind> {
        let mut involved: BTreeSet<HandlerKind> = self
            .conversation_history
            .iter()
            .filter_map(|message| message.producing_handler.parse::<HandlerKind>().ok())
            .collect();
        involved.extend(self.touched.iter().copied());
        involved.into_iter().collect()
    }
}
