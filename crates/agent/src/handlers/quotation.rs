use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{info, warn};

use autopoliza_core::audit::AuditSink;
use autopoliza_core::context::{TurnArtifact, TurnState};
use autopoliza_core::domain::escalation::EscalationReason;
use autopoliza_core::domain::quotation::{PlanOffer, Quotation};
use autopoliza_core::domain::session::HandlerKind;
use autopoliza_core::domain::vehicle::{BodyClass, VehicleDetails, VehicleDraft};
use autopoliza_core::flows::{
    FlowContext, FlowEngine, QuotationEvent, QuotationFlow, QuotationStage, TransitionOutcome,
};

use super::{audit_context, plan_list, Handler, HandlerError};
use crate::classifier::{PURCHASE_KEYWORDS, QUOTATION_KEYWORDS};
use crate::collaborators::{with_timeout, PricingEngine};
use crate::extraction::{detect_dont_know, extract_vehicle, mentions_any, tokenize};

const MAX_ALTERNATIVES: usize = 3;

const DEFAULT_BRAND: &str = "CHEVROLET";
const DEFAULT_BODY_CLASS: BodyClass = BodyClass::Automovil;
const DEFAULT_COLOR: &str = "BLANCO";
const DEFAULT_MODEL_YEAR: u16 = 2015;

const CHANGE_KEYWORDS: &[&str] = &[
    "cambiar",
    "cambio",
    "modificar",
    "otro vehiculo",
    "otro carro",
    "otra moto",
    "diferente",
    "y si fuera",
    "recotizar",
];

const FOLLOW_UP_KEYWORDS: &[&str] =
    &["plan", "planes", "precio", "opciones", "mensual", "anual", "valor", "cuota"];

/// Fills every missing required attribute, and year and color, with catalog defaults.
fn with_defaults(draft: &VehicleDraft) -> VehicleDetails {
    VehicleDetails {
        brand: draft.brand.clone().unwrap_or_else(|| DEFAULT_BRAND.to_string()),
        body_class: draft.body_class.unwrap_or(DEFAULT_BODY_CLASS),
        model_year: Some(draft.model_year.unwrap_or(DEFAULT_MODEL_YEAR)),
        line: draft.line.clone(),
        color: Some(draft.color.clone().unwrap_or_else(|| DEFAULT_COLOR.to_string())),
    }
}

/// Premiums quoted when the pricing engine cannot be reached.
fn fallback_plans() -> Vec<PlanOffer> {
    vec![
        PlanOffer {
            name: "Plan Basico".to_string(),
            annual_premium: Decimal::new(850_000, 0),
            monthly_premium: Decimal::new(70_833, 0),
        },
        PlanOffer {
            name: "Plan Autos Clasico".to_string(),
            annual_premium: Decimal::new(1_200_000, 0),
            monthly_premium: Decimal::new(100_000, 0),
        },
    ]
}

/// A new brand starts a fresh draft that only keeps the body class.
fn revised_draft(base: &VehicleDraft, update: VehicleDraft) -> VehicleDraft {
    let mut draft = match (&update.brand, &base.brand) {
        (Some(new), Some(old)) if new != old => {
            VehicleDraft { body_class: base.body_class, ..VehicleDraft::default() }
        }
        _ => base.clone(),
    };
    draft.absorb(update);
    draft
}

fn details_prompt(draft: &VehicleDraft, missing: &[String]) -> String {
    let mut wanted: Vec<&str> = missing
        .iter()
        .map(|field| match field.as_str() {
            "brand" => "la marca",
            _ => "el tipo de vehículo (automóvil, camioneta, campero, moto...)",
        })
        .collect();
    if draft.model_year.is_none() {
        wanted.push("el modelo (año)");
    }

    let mut prompt = String::new();
    if !draft.is_empty() {
        let known: Vec<String> = [
            draft.brand.clone(),
            draft.line.clone(),
            draft.model_year.map(|year| year.to_string()),
            draft.body_class.map(|class| class.label().to_string()),
        ]
        .into_iter()
        .flatten()
        .collect();
        prompt.push_str(&format!("Ya tengo: {}. ", known.join(" ")));
    }
    prompt.push_str(&format!(
        "Para cotizar tu seguro necesito {}. Por ejemplo: \"Toyota Corolla 2020 sedán\". \
         Si no conoces algún dato, escribe \"no sé\" y te daré una cotización estimada.",
        wanted.join(", ")
    ));
    prompt
}

fn quotation_message(quotation: &Quotation) -> String {
    let mut message = format!(
        "Esta es tu cotización para {}:\n\n{}",
        quotation.vehicle.describe(),
        plan_list(quotation)
    );
    if quotation.estimated {
        message.push_str(
            "\n\nEsta cotización es estimada: usé valores de referencia para los datos que no tenía. \
             Si me das la marca, línea y modelo exactos, la ajusto.",
        );
    }
    message.push_str("\n\n¿Quieres comprar alguno de estos planes?");
    message
}

struct PricedVehicle {
    vehicle: VehicleDetails,
    plans: Vec<PlanOffer>,
    estimated: bool,
    /// The requested vehicle, when a catalog alternative was priced instead.
    replaced: Option<VehicleDetails>,
}

enum Pricing {
    Priced(PricedVehicle),
    NotInsurable,
}

/// Collects vehicle details, prices them and answers follow-ups on the quote.
pub struct QuotationHandler {
    pricing: Arc<dyn PricingEngine>,
    timeout: Duration,
    max_detail_rounds: u8,
    flow: FlowEngine<QuotationFlow>,
    audit: Arc<dyn AuditSink>,
}

impl QuotationHandler {
    pub fn new(
        pricing: Arc<dyn PricingEngine>,
        timeout: Duration,
        max_detail_rounds: u8,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { pricing, timeout, max_detail_rounds, flow: FlowEngine::default(), audit }
    }

    fn transition(
        &self,
        state: &mut TurnState,
        event: QuotationEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome<QuotationStage, QuotationEvent>, HandlerError> {
        let current = state.context.quotation.stage.unwrap_or(QuotationStage::AwaitingDetails);
        let audit = audit_context(state, HandlerKind::Quotation);
        let outcome =
            self.flow.apply_with_audit(&current, &event, context, self.audit.as_ref(), &audit)?;
        state.context.quotation.stage = Some(outcome.to);
        Ok(outcome)
    }

    fn apply(&self, state: &mut TurnState, event: QuotationEvent) -> Result<(), HandlerError> {
        self.transition(state, event, &FlowContext::default()).map(|_| ())
    }

    /// Vehicle attributes offered this turn: image analysis first, then text.
    fn offered_details(state: &TurnState) -> VehicleDraft {
        let mut update = state.context.image_analysis().unwrap_or_default();
        update.absorb(extract_vehicle(&state.last_user_input));
        update
    }

    async fn collect(&self, state: &mut TurnState) -> Result<(), HandlerError> {
        self.apply(state, QuotationEvent::InputReceived)?;

        let update = Self::offered_details(state);
        state.context.quotation.draft.absorb(update);

        if let Some(vehicle) = state.context.quotation.draft.resolve() {
            return self.generate(state, vehicle, false).await;
        }

        let record = &state.context.quotation;
        if detect_dont_know(&state.last_user_input) || record.detail_rounds >= self.max_detail_rounds {
            let vehicle = with_defaults(&record.draft);
            info!(
                session_id = %state.session_id,
                correlation_id = %state.correlation_id,
                handler = "quotation",
                detail_rounds = record.detail_rounds,
                vehicle = %vehicle.describe(),
                "quoting with default vehicle details"
            );
            return self.generate(state, vehicle, true).await;
        }

        state.context.quotation.detail_rounds += 1;
        let missing = state.context.quotation.draft.missing_required();
        self.transition(state, QuotationEvent::DetailsMissing, &FlowContext::missing(missing.clone()))?;
        let prompt = details_prompt(&state.context.quotation.draft, &missing);
        state.reply(HandlerKind::Quotation, prompt);
        Ok(())
    }

    /// Re-entry after a vehicle was found not insurable.
    async fn resume(&self, state: &mut TurnState) -> Result<(), HandlerError> {
        let update = Self::offered_details(state);
        if !update.is_empty() {
            let draft = revised_draft(&state.context.quotation.draft, update);
            if let Some(vehicle) = draft.resolve() {
                state.context.quotation.draft = draft;
                return self.generate(state, vehicle, false).await;
            }
        }

        let rejected = state
            .context
            .quotation
            .rejected_vehicle
            .as_ref()
            .map(VehicleDetails::describe)
            .unwrap_or_else(|| "tu vehículo".to_string());
        state.reply(
            HandlerKind::Quotation,
            format!(
                "No pude cotizar {rejected} porque no está en nuestro catálogo asegurable. \
                 Cuéntame la marca, línea y modelo de otro vehículo, o escribe \"asesor\" para \
                 que una persona revise tu caso."
            ),
        );
        Ok(())
    }

    async fn generate(
        &self,
        state: &mut TurnState,
        vehicle: VehicleDetails,
        estimated: bool,
    ) -> Result<(), HandlerError> {
        self.apply(state, QuotationEvent::DetailsResolved)?;

        match self.price(state, vehicle.clone(), estimated).await {
            Pricing::Priced(priced) => {
                if priced.replaced.is_some() {
                    self.apply(state, QuotationEvent::VehicleRejected)?;
                }
                self.finalize(state, priced)
            }
            Pricing::NotInsurable => {
                self.apply(state, QuotationEvent::VehicleRejected)?;
                self.apply(state, QuotationEvent::AlternativesExhausted)?;
                warn!(
                    session_id = %state.session_id,
                    correlation_id = %state.correlation_id,
                    handler = "quotation",
                    vehicle = %vehicle.describe(),
                    "vehicle not insurable and no alternative validated"
                );
                state.context.quotation.rejected_vehicle = Some(vehicle);
                state.request_escalation(EscalationReason::VehicleNotInsurable);
                Ok(())
            }
        }
    }

    /// Validates and prices `vehicle`, falling back to catalog alternatives when
    /// it is rejected and to fixed estimated plans when the engine is unreachable.
    async fn price(&self, state: &TurnState, vehicle: VehicleDetails, estimated: bool) -> Pricing {
        let backend = self.pricing.name();
        match with_timeout(backend, self.timeout, self.pricing.validate(&vehicle)).await {
            Ok(true) => {}
            Ok(false) => return self.price_alternative(state, vehicle, estimated).await,
            Err(error) => {
                warn!(
                    session_id = %state.session_id,
                    handler = "quotation",
                    backend = error.backend(),
                    error = %error,
                    "pricing validation failed, quoting fallback plans"
                );
                return Pricing::Priced(PricedVehicle {
                    vehicle,
                    plans: fallback_plans(),
                    estimated: true,
                    replaced: None,
                });
            }
        }

        match with_timeout(backend, self.timeout, self.pricing.quote(&vehicle)).await {
            Ok(plans) if !plans.is_empty() => {
                Pricing::Priced(PricedVehicle { vehicle, plans, estimated, replaced: None })
            }
            Ok(_) => Pricing::Priced(PricedVehicle {
                vehicle,
                plans: fallback_plans(),
                estimated: true,
                replaced: None,
            }),
            Err(error) => {
                warn!(
                    session_id = %state.session_id,
                    handler = "quotation",
                    backend = error.backend(),
                    error = %error,
                    "pricing quote failed, quoting fallback plans"
                );
                Pricing::Priced(PricedVehicle {
                    vehicle,
                    plans: fallback_plans(),
                    estimated: true,
                    replaced: None,
                })
            }
        }
    }

    async fn price_alternative(
        &self,
        state: &TurnState,
        vehicle: VehicleDetails,
        estimated: bool,
    ) -> Pricing {
        let backend = self.pricing.name();
        let candidates = match with_timeout(
            backend,
            self.timeout,
            self.pricing.alternatives(&vehicle, MAX_ALTERNATIVES),
        )
        .await
        {
            Ok(candidates) => candidates,
            Err(error) => {
                warn!(
                    session_id = %state.session_id,
                    handler = "quotation",
                    error = %error,
                    "alternative lookup failed"
                );
                Vec::new()
            }
        };

        for mut candidate in candidates.into_iter().take(MAX_ALTERNATIVES) {
            if candidate.color.is_none() {
                candidate.color = vehicle.color.clone();
            }
            let valid = with_timeout(backend, self.timeout, self.pricing.validate(&candidate)).await;
            if !matches!(valid, Ok(true)) {
                continue;
            }
            if let Ok(plans) = with_timeout(backend, self.timeout, self.pricing.quote(&candidate)).await {
                if !plans.is_empty() {
                    return Pricing::Priced(PricedVehicle {
                        vehicle: candidate,
                        plans,
                        estimated,
                        replaced: Some(vehicle),
                    });
                }
            }
        }
        Pricing::NotInsurable
    }

    fn finalize(&self, state: &mut TurnState, priced: PricedVehicle) -> Result<(), HandlerError> {
        self.apply(state, QuotationEvent::QuoteGenerated)?;

        let quotation =
            Quotation::new(state.session_id.clone(), priced.vehicle, priced.plans, priced.estimated);
        let mut message = String::new();
        if let Some(replaced) = &priced.replaced {
            message.push_str(&format!(
                "No encontré {} en nuestro catálogo asegurable, así que coticé el vehículo más \
                 parecido.\n\n",
                replaced.describe()
            ));
        }
        message.push_str(&quotation_message(&quotation));

        let record = &mut state.context.quotation;
        record.draft = VehicleDraft::from(&quotation.vehicle);
        record.detail_rounds = 0;
        record.rejected_vehicle = None;
        record.quotation = Some(quotation.clone());

        info!(
            session_id = %state.session_id,
            correlation_id = %state.correlation_id,
            handler = "quotation",
            quotation_id = %quotation.id.0,
            plans = quotation.plans.len(),
            estimated = quotation.estimated,
            "quotation generated"
        );
        state.record_artifact(TurnArtifact::Quotation(quotation));

        if state.context.issuance.is_waiting_for_quotation() {
            state.context.flags.defer_to(HandlerKind::Issuance);
            info!(
                event_name = "handler.handoff",
                session_id = %state.session_id,
                correlation_id = %state.correlation_id,
                handler = "quotation",
                target = "issuance",
                "quotation located for pending issuance"
            );
            message.push_str(" Con esta cotización seguimos con la expedición de tu póliza.");
        }

        state.reply(HandlerKind::Quotation, message);
        Ok(())
    }

    async fn handle_ready(&self, state: &mut TurnState) -> Result<(), HandlerError> {
        let Some(current) = state.context.quotation.quotation.clone() else {
            state.context.quotation.stage = Some(QuotationStage::AwaitingDetails);
            return self.collect(state).await;
        };

        let tokens = tokenize(&state.last_user_input);
        let wants_change = mentions_any(&tokens, CHANGE_KEYWORDS);

        if mentions_any(&tokens, PURCHASE_KEYWORDS) && !wants_change {
            self.apply(state, QuotationEvent::PurchaseRequested)?;
            state.context.flags.defer_to(HandlerKind::Issuance);
            info!(
                event_name = "handler.handoff",
                session_id = %state.session_id,
                correlation_id = %state.correlation_id,
                handler = "quotation",
                target = "issuance",
                "purchase requested on ready quotation"
            );
            let reply = if current.has_single_plan() {
                "¡Excelente decisión! Para expedir tu póliza necesito tu número de identificación, \
                 tu celular y tu correo electrónico."
                    .to_string()
            } else {
                format!(
                    "¡Excelente decisión! ¿Cuál plan quieres contratar?\n\n{}\n\n\
                     Puedes responder con el número o el nombre del plan.",
                    plan_list(&current)
                )
            };
            state.reply(HandlerKind::Quotation, reply);
            return Ok(());
        }

        let update = Self::offered_details(state);
        if !update.is_empty() {
            let base = VehicleDraft::from(&current.vehicle);
            let draft = revised_draft(&base, update);
            if draft != base {
                if let Some(vehicle) = draft.resolve() {
                    return self.requote(state, &current, vehicle).await;
                }
            }
        }

        if wants_change {
            self.apply(state, QuotationEvent::ChangeRequested)?;
            state.reply(
                HandlerKind::Quotation,
                "Claro, puedo recotizar. Cuéntame qué quieres cambiar: marca, línea, modelo o color \
                 del vehículo.",
            );
            return Ok(());
        }

        self.apply(state, QuotationEvent::FollowUp)?;
        state.reply(
            HandlerKind::Quotation,
            format!(
                "Tu cotización para {}:\n\n{}\n\n¿Quieres comprar alguno de estos planes, cotizar \
                 otro vehículo o tienes alguna pregunta?",
                current.vehicle.describe(),
                plan_list(&current)
            ),
        );
        Ok(())
    }

    async fn requote(
        &self,
        state: &mut TurnState,
        current: &Quotation,
        vehicle: VehicleDetails,
    ) -> Result<(), HandlerError> {
        match self.price(state, vehicle.clone(), false).await {
            Pricing::Priced(priced) => self.finalize(state, priced),
            Pricing::NotInsurable => {
                self.apply(state, QuotationEvent::ChangeRequested)?;
                state.reply(
                    HandlerKind::Quotation,
                    format!(
                        "No encontré {} en nuestro catálogo asegurable. Tu cotización para {} \
                         sigue vigente.",
                        vehicle.describe(),
                        current.vehicle.describe()
                    ),
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Handler for QuotationHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Quotation
    }

    fn can_handle(&self, input: &str, state: &TurnState) -> bool {
        let record = &state.context.quotation;
        let tokens = tokenize(input);
        if record.is_collecting() || mentions_any(&tokens, QUOTATION_KEYWORDS) {
            return true;
        }

        let offers_vehicle = !extract_vehicle(input).is_empty();
        match record.stage {
            Some(QuotationStage::QuoteReady) => {
                offers_vehicle
                    || mentions_any(&tokens, PURCHASE_KEYWORDS)
                    || mentions_any(&tokens, CHANGE_KEYWORDS)
                    || mentions_any(&tokens, FOLLOW_UP_KEYWORDS)
            }
            Some(QuotationStage::GeneratingQuote) => offers_vehicle,
            _ => state.context.image_analysis().is_some() || extract_vehicle(input).brand.is_some(),
        }
    }

    async fn process(&self, state: &mut TurnState) -> Result<(), HandlerError> {
        state.touch(HandlerKind::Quotation);
        match state.context.quotation.stage {
            None | Some(QuotationStage::AwaitingDetails) | Some(QuotationStage::AnalyzingInput) => {
                self.collect(state).await
            }
            Some(QuotationStage::GeneratingQuote) => self.resume(state).await,
            Some(QuotationStage::QuoteReady) => self.handle_ready(state).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use rust_decimal::Decimal;
    use serde_json::json;

    use autopoliza_core::audit::{InMemoryAuditSink, NoopAuditSink};
    use autopoliza_core::context::{ConversationContext, TurnArtifact, IMAGE_ANALYSIS_KEY};
    use autopoliza_core::domain::escalation::EscalationReason;
    use autopoliza_core::domain::session::HandlerKind;
    use autopoliza_core::domain::vehicle::BodyClass;
    use autopoliza_core::flows::{IssuanceStage, QuotationStage};

    use super::QuotationHandler;
    use crate::collaborators::{CatalogPricingEngine, PricingEngine};
    use crate::handlers::Handler;
    use crate::test_support::{
        last_reply, three_plan_quotation, turn_state_with, UnavailablePricing,
    };

    fn handler_with(pricing: Arc<dyn PricingEngine>) -> QuotationHandler {
        QuotationHandler::new(pricing, Duration::from_secs(1), 2, Arc::new(NoopAuditSink))
    }

    fn handler() -> QuotationHandler {
        handler_with(Arc::new(CatalogPricingEngine::bundled().expect("catalog")))
    }

    fn stage_context(stage: QuotationStage) -> ConversationContext {
        let mut context = ConversationContext::default();
        context.quotation.stage = Some(stage);
        context
    }

    async fn run(handler: &QuotationHandler, input: &str, context: ConversationContext) -> autopoliza_core::context::TurnState {
        let mut state = turn_state_with(input, Vec::new(), context);
        handler.process(&mut state).await.expect("process");
        state
    }

    #[tokio::test]
    async fn quote_request_without_details_prompts_for_them() {
        let state = run(&handler(), "quiero cotizar", ConversationContext::default()).await;

        assert_eq!(state.context.quotation.stage, Some(QuotationStage::AwaitingDetails));
        assert_eq!(state.context.quotation.detail_rounds, 1);
        let reply = last_reply(&state);
        assert!(reply.contains("la marca"));
        assert!(reply.contains("no sé"));
    }

    #[tokio::test]
    async fn resolved_details_reach_quote_ready_in_one_turn() {
        let sink = InMemoryAuditSink::default();
        let handler = QuotationHandler::new(
            Arc::new(CatalogPricingEngine::bundled().expect("catalog")),
            Duration::from_secs(1),
            2,
            Arc::new(sink.clone()),
        );
        let state =
            run(&handler, "Toyota 2020 sedán", stage_context(QuotationStage::AwaitingDetails)).await;

        assert_eq!(state.context.quotation.stage, Some(QuotationStage::QuoteReady));
        let quotation = state.context.quotation.quotation.as_ref().expect("quotation");
        assert_eq!(quotation.vehicle.brand, "TOYOTA");
        assert_eq!(quotation.plans.len(), 3);
        assert!(!quotation.estimated);
        assert!(matches!(state.artifacts(), [TurnArtifact::Quotation(_)]));
        assert!(last_reply(&state).contains("$1.950.000"));

        let targets: Vec<String> = sink
            .events_of_type("flow.transition_applied")
            .into_iter()
            .filter_map(|event| event.metadata.get("to").cloned())
            .collect();
        assert_eq!(targets, vec!["AnalyzingInput", "GeneratingQuote", "QuoteReady"]);
    }

    #[tokio::test]
    async fn dont_know_applies_defaults_and_marks_estimate() {
        let state = run(&handler(), "no sé", stage_context(QuotationStage::AwaitingDetails)).await;

        let quotation = state.context.quotation.quotation.as_ref().expect("quotation");
        assert_eq!(quotation.vehicle.brand, "CHEVROLET");
        assert_eq!(quotation.vehicle.body_class, BodyClass::Automovil);
        assert_eq!(quotation.vehicle.model_year, Some(2015));
        assert_eq!(quotation.vehicle.color.as_deref(), Some("BLANCO"));
        assert!(quotation.estimated);
        assert!(last_reply(&state).contains("estimada"));
    }

    #[tokio::test]
    async fn detail_collection_gives_up_after_two_rounds() {
        let handler = handler();
        let state = run(&handler, "quiero cotizar", ConversationContext::default()).await;
        let state = run(&handler, "mmm déjame ver", state.context).await;
        assert_eq!(state.context.quotation.detail_rounds, 2);
        assert!(state.context.quotation.quotation.is_none());

        let state = run(&handler, "todavía lo estoy pensando", state.context).await;
        assert_eq!(state.context.quotation.stage, Some(QuotationStage::QuoteReady));
        assert!(state.context.quotation.quotation.as_ref().expect("quotation").estimated);
    }

    #[tokio::test]
    async fn image_analysis_is_preferred_over_defaults() {
        let mut context = stage_context(QuotationStage::AwaitingDetails);
        context.extra.insert(
            IMAGE_ANALYSIS_KEY.to_string(),
            json!({ "brand": "MAZDA", "body_class": "AUTOMOVIL", "color": "ROJO" }),
        );
        let state = run(&handler(), "esta es la foto", context).await;

        let quotation = state.context.quotation.quotation.as_ref().expect("quotation");
        assert_eq!(quotation.vehicle.brand, "MAZDA");
        assert_eq!(quotation.vehicle.color.as_deref(), Some("ROJO"));
    }

    #[tokio::test]
    async fn pricing_outage_quotes_estimated_fallback_plans() {
        let handler = handler_with(Arc::new(UnavailablePricing));
        let state =
            run(&handler, "Toyota 2020 sedán", stage_context(QuotationStage::AwaitingDetails)).await;

        let quotation = state.context.quotation.quotation.as_ref().expect("quotation");
        assert!(quotation.estimated);
        assert_eq!(quotation.plans.len(), 2);
        assert_eq!(quotation.plans[0].annual_premium, Decimal::new(850_000, 0));
        assert!(!state.needs_human_intervention);
    }

    #[tokio::test]
    async fn rejected_vehicle_uses_nearest_alternative() {
        let state =
            run(&handler(), "Toyota Corolla 2016", stage_context(QuotationStage::AwaitingDetails)).await;

        let quotation = state.context.quotation.quotation.as_ref().expect("quotation");
        assert_eq!(quotation.vehicle.brand, "TOYOTA");
        assert_ne!(quotation.vehicle.model_year, Some(2016));
        assert!(last_reply(&state).starts_with("No encontré"));
    }

    #[tokio::test]
    async fn uninsurable_vehicle_escalates_without_reply() {
        let state =
            run(&handler(), "BMW 2022 automóvil", stage_context(QuotationStage::AwaitingDetails)).await;

        assert!(state.needs_human_intervention);
        assert_eq!(state.escalation_reason, Some(EscalationReason::VehicleNotInsurable));
        assert_eq!(state.context.quotation.stage, Some(QuotationStage::GeneratingQuote));
        assert!(state.context.quotation.rejected_vehicle.is_some());
        assert_eq!(state.produced_count(), 0);
    }

    #[tokio::test]
    async fn purchase_intent_on_ready_quote_defers_to_issuance() {
        let mut context = stage_context(QuotationStage::QuoteReady);
        context.quotation.quotation = Some(three_plan_quotation());
        let state = run(&handler(), "quiero comprarlo", context).await;

        assert_eq!(state.context.quotation.stage, Some(QuotationStage::QuoteReady));
        assert_eq!(state.context.flags.transfer_to, Some(HandlerKind::Issuance));
        assert!(state.context.flags.force_end);
        assert!(last_reply(&state).contains("¿Cuál plan"));
    }

    #[tokio::test]
    async fn ready_quote_never_regresses_and_requotes_new_vehicle() {
        let mut context = stage_context(QuotationStage::QuoteReady);
        context.quotation.quotation = Some(three_plan_quotation());
        let first_id = context.quotation.quotation.as_ref().map(|q| q.id.clone());

        let state = run(&handler(), "¿y si fuera un Mazda 3 2019?", context).await;

        assert_eq!(state.context.quotation.stage, Some(QuotationStage::QuoteReady));
        let quotation = state.context.quotation.quotation.as_ref().expect("quotation");
        assert_eq!(quotation.vehicle.brand, "MAZDA");
        assert_ne!(Some(quotation.id.clone()), first_id);

        let state = run(&handler(), "¿qué más me ofreces?", state.context).await;
        assert_eq!(state.context.quotation.stage, Some(QuotationStage::QuoteReady));
        assert!(last_reply(&state).contains("¿Quieres comprar"));
    }

    #[tokio::test]
    async fn quote_for_waiting_issuance_hands_back() {
        let mut context = stage_context(QuotationStage::AwaitingDetails);
        context.issuance.stage = Some(IssuanceStage::NeedsQuotation);
        let state = run(&handler(), "Toyota 2020 sedán", context).await;

        assert_eq!(state.context.flags.transfer_to, Some(HandlerKind::Issuance));
        assert!(state.context.flags.force_end);
    }

    #[test]
    fn can_handle_tracks_stage() {
        let handler = handler();
        let fresh = turn_state_with("hola", Vec::new(), ConversationContext::default());
        assert!(!handler.can_handle("hola", &fresh));
        assert!(handler.can_handle("quiero cotizar", &fresh));

        let collecting =
            turn_state_with("azul", Vec::new(), stage_context(QuotationStage::AwaitingDetails));
        assert!(handler.can_handle("azul", &collecting));

        let ready = turn_state_with("x", Vec::new(), stage_context(QuotationStage::QuoteReady));
        assert!(handler.can_handle("quiero comprarlo", &ready));
        assert!(!handler.can_handle("gracias", &ready));
    }
}
