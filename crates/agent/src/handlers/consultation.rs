use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use autopoliza_core::config::ConsultationConfig;
use autopoliza_core::context::TurnState;
use autopoliza_core::domain::session::HandlerKind;
use autopoliza_core::flows::IssuanceStage;

use super::{Handler, HandlerError};
use crate::collaborators::{with_timeout, RetrievalAnswer, RetrievalBackend};
use crate::extraction::{is_greeting, mentions_any, tokenize};

const CONSULTATION_KEYWORDS: &[&str] = &[
    "que cubre",
    "cobertura",
    "coberturas",
    "deducible",
    "requisitos",
    "siniestro",
    "como funciona",
    "que es",
    "diferencia",
    "vigencia",
    "pago",
    "pagar",
];

const ACKNOWLEDGMENTS: &[&str] = &["gracias", "ok", "vale", "listo", "perfecto"];
const FAREWELLS: &[&str] = &["chao", "adios"];

/// Answers insurance questions through the retrieval backend. Keeps no state.
pub struct ConsultationHandler {
    retrieval: Arc<dyn RetrievalBackend>,
    timeout: Duration,
    config: ConsultationConfig,
}

impl ConsultationHandler {
    pub fn new(
        retrieval: Arc<dyn RetrievalBackend>,
        timeout: Duration,
        config: ConsultationConfig,
    ) -> Self {
        Self { retrieval, timeout, config }
    }

    fn greeting_reply(&self, state: &TurnState) -> String {
        let tokens = tokenize(&state.last_user_input);
        if mentions_any(&tokens, FAREWELLS) {
            return "¡Hasta pronto! Aquí estaré si necesitas algo más sobre tu seguro.".to_string();
        }
        if mentions_any(&tokens, ACKNOWLEDGMENTS) {
            return "¡Con gusto! ¿Hay algo más en lo que te pueda ayudar?".to_string();
        }

        let context = &state.context;
        if context.issuance.stage == Some(IssuanceStage::Completed) {
            if let Some(policy) = &context.issuance.policy {
                return format!(
                    "¡Hola de nuevo! Tu póliza {} ya está expedida. ¿Tienes alguna pregunta sobre ella?",
                    policy.policy_number.0
                );
            }
        }
        if let Some(quotation) = context.quotation.ready_quotation() {
            return format!(
                "¡Hola de nuevo! Tienes una cotización para tu {}. ¿Quieres continuar con la compra o tienes alguna pregunta?",
                quotation.vehicle.describe()
            );
        }

        "¡Hola! Soy tu asistente de seguros para autos. Puedo resolver tus dudas sobre coberturas, \
         cotizar tu vehículo y ayudarte a expedir tu póliza. ¿En qué te puedo ayudar?"
            .to_string()
    }

    fn answer_reply(&self, answer: RetrievalAnswer) -> String {
        if answer.confidence >= self.config.answer_threshold {
            if answer.sources.is_empty() {
                answer.answer
            } else {
                format!("{}\n\nFuente: {}", answer.answer, answer.sources.join(", "))
            }
        } else if answer.confidence >= self.config.answer_floor {
            format!(
                "No estoy completamente seguro, pero esto es lo que encontré: {}\n\n\
                 Si necesitas certeza, escribe 'asesor' y te comunico con una persona de nuestro equipo.",
                answer.answer
            )
        } else {
            "No encontré información confiable para responder esa pregunta. Si quieres, escribe \
             'asesor' y un asesor de nuestro equipo te ayudará."
                .to_string()
        }
    }

    /// Recent client utterances before this turn, oldest first.
    fn recent_questions(&self, state: &TurnState) -> Vec<String> {
        let mut questions: Vec<String> = state
            .prior_messages()
            .iter()
            .rev()
            .filter(|message| message.is_user())
            .take(self.config.history_limit)
            .map(|message| message.content.clone())
            .collect();
        questions.reverse();
        questions
    }
}

#[async_trait]
impl Handler for ConsultationHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Consultation
    }

    fn can_handle(&self, input: &str, _state: &TurnState) -> bool {
        is_greeting(input) || input.contains('?') || mentions_any(&tokenize(input), CONSULTATION_KEYWORDS)
    }

    async fn process(&self, state: &mut TurnState) -> Result<(), HandlerError> {
        state.touch(HandlerKind::Consultation);
        let input = state.last_user_input.clone();

        if is_greeting(&input) {
            let reply = self.greeting_reply(state);
            state.reply(HandlerKind::Consultation, reply);
            return Ok(());
        }

        let history = self.recent_questions(state);
        let backend = self.retrieval.name();
        match with_timeout(backend, self.timeout, self.retrieval.query(&input, &history)).await {
            Ok(answer) => {
                debug!(
                    session_id = %state.session_id,
                    correlation_id = %state.correlation_id,
                    handler = "consultation",
                    confidence = answer.confidence,
                    sources = answer.sources.len(),
                    "retrieval answered"
                );
                let reply = self.answer_reply(answer);
                state.reply(HandlerKind::Consultation, reply);
            }
            Err(error) => {
                warn!(
                    session_id = %state.session_id,
                    correlation_id = %state.correlation_id,
                    handler = "consultation",
                    backend = error.backend(),
                    error = %error,
                    "retrieval failed, answering with apology"
                );
                state.reply(
                    HandlerKind::Consultation,
                    "Lo siento, en este momento no pude consultar esa información. Intenta de nuevo \
                     en unos minutos o escribe 'asesor' para hablar con una persona.",
                );
            }
        }
        Ok(())
    }
}
