use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use autopoliza_core::config::RoutingConfig;
use autopoliza_core::context::TurnState;
use autopoliza_core::domain::escalation::{CaseComplexity, CaseSummary, EscalationReason};
use autopoliza_core::domain::session::{ControlMode, HandlerKind};
use autopoliza_core::flows::IssuanceStage;

use super::{Handler, HandlerError};
use crate::extraction::{jaccard, mentions_any, token_set, tokenize};

/// Phrases that hand the conversation to a person on their own.
const ESCALATION_TRIGGERS: &[&str] = &[
    "asesor",
    "humano",
    "persona real",
    "hablar con una persona",
    "hablar con alguien",
    "agente",
    "representante",
    "no entiendo",
    "esto no funciona",
    "no me sirve",
    "quiero cancelar",
    "mal servicio",
    "confundido",
    "confundida",
];

const FRUSTRATION: &[&str] = &[
    "frustrado",
    "frustrada",
    "molesto",
    "molesta",
    "enojado",
    "enojada",
    "cansado",
    "cansada",
    "harto",
    "harta",
    "perdiendo tiempo",
    "no entiende nada",
];

const URGENT_MARKERS: &[&str] = &["AYUDA", "URGENTE", "!!!", "???"];

const EXPLICIT_REQUEST: &[&str] = &[
    "asesor",
    "humano",
    "persona",
    "hablar con alguien",
    "agente",
    "representante",
];
const CONFUSION: &[&str] =
    &["no entiendo", "confundido", "confundida", "no me queda claro", "no comprendo"];
const TECHNICAL: &[&str] = &["no funciona", "no me sirve", "error", "falla", "fallando", "se cayo"];
const CANCELLATION: &[&str] = &["cancelar", "mal servicio", "no quiero continuar", "desistir"];

fn client_message(reason: &EscalationReason) -> &'static str {
    match reason {
        EscalationReason::ExplicitRequest => {
            "Con gusto te comunico con un asesor. Ya le compartí el resumen de nuestra \
             conversación y te escribirá en este mismo chat en breve."
        }
        EscalationReason::Confusion => {
            "Entiendo que algo no quedó claro. Un asesor revisará tu caso y te lo explicará en \
             este mismo chat en breve."
        }
        EscalationReason::TechnicalProblem => {
            "Lamento el inconveniente. Un asesor revisará lo ocurrido y te contactará en este \
             mismo chat en breve."
        }
        EscalationReason::Cancellation => {
            "Entendido. Un asesor te ayudará con tu solicitud en este mismo chat en breve."
        }
        EscalationReason::VehicleNotInsurable => {
            "No encontré tu vehículo ni una alternativa similar en nuestro catálogo asegurable. \
             Un asesor revisará tu caso y te escribirá en este mismo chat en breve."
        }
        EscalationReason::QuotationUnrecoverable => {
            "No logré recuperar la cotización para tu compra. Un asesor continuará el proceso \
             contigo en este mismo chat en breve."
        }
        EscalationReason::IssuanceFailed { .. } => {
            "Tuvimos un problema al expedir tu póliza. Para evitar cobros o pólizas duplicadas, \
             un asesor verificará el estado de tu solicitud y te contactará en este mismo chat \
             en breve."
        }
        EscalationReason::HandlerFault { .. } => {
            "Tuvimos un problema procesando tu solicitud. Un asesor continuará contigo en este \
             mismo chat en breve."
        }
        EscalationReason::ProlongedConversation | EscalationReason::Generic => {
            "Voy a pedirle a un asesor que continúe contigo para darte una mejor atención. Te \
             escribirá en este mismo chat en breve."
        }
    }
}

/// Hands the session to a human advisor with a case summary for the advisor channel.
pub struct EscalationHandler {
    stagnation_min_messages: usize,
    stagnation_window: usize,
    stagnation_similarity: f64,
}

impl EscalationHandler {
    pub fn new(routing: &RoutingConfig) -> Self {
        Self {
            stagnation_min_messages: routing.stagnation_min_messages,
            stagnation_window: routing.stagnation_window,
            stagnation_similarity: routing.stagnation_similarity,
        }
    }

    /// Long conversation whose recent client messages keep repeating themselves.
    fn stagnating(&self, state: &TurnState) -> bool {
        if state.prior_messages().len() < self.stagnation_min_messages {
            return false;
        }

        let history = &state.conversation_history;
        let window = &history[history.len().saturating_sub(self.stagnation_window)..];
        let questions: Vec<BTreeSet<String>> = window
            .iter()
            .filter(|message| message.is_user())
            .map(|message| token_set(&message.content))
            .filter(|tokens| !tokens.is_empty())
            .collect();

        let mut repeated = 0;
        for (index, left) in questions.iter().enumerate() {
            for right in &questions[index + 1..] {
                if jaccard(left, right) > self.stagnation_similarity {
                    repeated += 1;
                }
            }
        }
        repeated >= 2
    }

    fn infer_reason(&self, state: &TurnState) -> EscalationReason {
        let tokens = tokenize(&state.last_user_input);
        if mentions_any(&tokens, EXPLICIT_REQUEST) {
            EscalationReason::ExplicitRequest
        } else if mentions_any(&tokens, CONFUSION) {
            EscalationReason::Confusion
        } else if mentions_any(&tokens, TECHNICAL) {
            EscalationReason::TechnicalProblem
        } else if mentions_any(&tokens, CANCELLATION) {
            EscalationReason::Cancellation
        } else if state.conversation_history.len() > self.stagnation_window {
            EscalationReason::ProlongedConversation
        } else {
            EscalationReason::Generic
        }
    }

    fn summarize(&self, state: &TurnState, reason: &EscalationReason) -> CaseSummary {
        let context = &state.context;
        let inferred_intent = match context.issuance.stage {
            Some(IssuanceStage::Completed) => "Consulta sobre póliza expedida",
            Some(_) => "Compra de póliza",
            None if context.quotation.stage.is_some() => "Cotización de seguro",
            None => "Consulta general",
        };

        let mut pending_actions = Vec::new();
        match context.issuance.stage {
            Some(IssuanceStage::ConfirmingPurchase) | Some(IssuanceStage::Processing) => {
                pending_actions.push("Confirmar y completar la expedición de la póliza".to_string())
            }
            Some(IssuanceStage::RequestingClientData) => {
                pending_actions.push("Completar datos del tomador".to_string())
            }
            _ => {}
        }
        if context.quotation.is_collecting() {
            pending_actions.push("Completar información para la cotización".to_string());
        }
        if context.quotation.rejected_vehicle.is_some()
            || *reason == EscalationReason::VehicleNotInsurable
        {
            pending_actions.push("Revisar asegurabilidad del vehículo".to_string());
        }
        if state.last_user_input.contains('?') {
            pending_actions.push("Responder pregunta específica del cliente".to_string());
        }
        if pending_actions.is_empty() {
            pending_actions.push("Retomar conversación desde el punto de escalamiento".to_string());
        }

        let handlers_involved: Vec<HandlerKind> = state
            .handlers_involved()
            .into_iter()
            .filter(|handler| *handler != HandlerKind::Escalation)
            .collect();
        let vehicle = context
            .quotation
            .quotation
            .as_ref()
            .map(|quotation| quotation.vehicle.describe())
            .or_else(|| context.quotation.rejected_vehicle.as_ref().map(|vehicle| vehicle.describe()))
            .unwrap_or_else(|| "sin datos".to_string());
        let quick_context = format!(
            "Intención: {inferred_intent} | Vehículo: {vehicle} | Pendiente: {}",
            pending_actions[0]
        );

        CaseSummary {
            reason: reason.clone(),
            total_messages: state.conversation_history.len(),
            complexity: CaseComplexity::estimate(handlers_involved.len(), pending_actions.len()),
            handlers_involved,
            inferred_intent: inferred_intent.to_string(),
            pending_actions,
            priority: reason.priority(),
            quick_context,
            escalated_at: Utc::now(),
        }
    }
}

#[async_trait]
impl Handler for EscalationHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Escalation
    }

    fn can_handle(&self, input: &str, state: &TurnState) -> bool {
        if state.needs_human_intervention {
            return true;
        }
        let tokens = tokenize(input);
        mentions_any(&tokens, ESCALATION_TRIGGERS)
            || mentions_any(&tokens, FRUSTRATION)
            || URGENT_MARKERS.iter().any(|marker| input.contains(marker))
            || self.stagnating(state)
    }

    async fn process(&self, state: &mut TurnState) -> Result<(), HandlerError> {
        state.touch(HandlerKind::Escalation);

        if state.context.escalation.active && state.control_mode == ControlMode::Transferred {
            state.needs_human_intervention = true;
            state.reply(
                HandlerKind::Escalation,
                "Tu caso ya está con un asesor. Te responderá en este mismo chat en breve.",
            );
            return Ok(());
        }

        let reason = state.escalation_reason.clone().unwrap_or_else(|| self.infer_reason(state));
        let summary = self.summarize(state, &reason);

        match state.control_mode.transition_to(ControlMode::Transferred) {
            Ok(mode) => state.control_mode = mode,
            Err(error) => warn!(
                session_id = %state.session_id,
                handler = "escalation",
                error = %error,
                "control mode not changed on escalation"
            ),
        }

        info!(
            event_name = "handler.escalated",
            session_id = %state.session_id,
            correlation_id = %state.correlation_id,
            handler = "escalation",
            reason = %reason,
            priority = ?summary.priority,
            complexity = ?summary.complexity,
            pending = summary.pending_actions.len(),
            "session handed to a human advisor"
        );

        let record = &mut state.context.escalation;
        record.active = true;
        record.reason = Some(reason.clone());
        record.summary = Some(summary);
        record.escalation_count += 1;

        state.needs_human_intervention = true;
        state.escalation_reason = Some(reason.clone());
        state.reply(HandlerKind::Escalation, client_message(&reason));
        Ok(())
    }
}
