use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use autopoliza_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use autopoliza_core::context::{IssuanceRecord, TurnArtifact, TurnState};
use autopoliza_core::domain::escalation::EscalationReason;
use autopoliza_core::domain::policy::{Policy, Policyholder};
use autopoliza_core::domain::quotation::Quotation;
use autopoliza_core::domain::session::HandlerKind;
use autopoliza_core::flows::{FlowContext, FlowEngine, IssuanceEvent, IssuanceFlow, IssuanceStage};

use super::{audit_context, format_money, plan_list, Handler, HandlerError};
use crate::classifier::{PURCHASE_KEYWORDS, QUOTATION_KEYWORDS};
use crate::collaborators::{with_timeout, IssuanceBackend, IssuanceOutcome, IssuanceRequest};
use crate::extraction::{
    extract_client_data, extract_vehicle, mentions_any, parse_confirmation, select_plan, tokenize,
    Confirmation,
};

const POLICY_FOLLOW_UP_KEYWORDS: &[&str] =
    &["poliza", "estado", "expedida", "certificado", "documentos", "numero de poliza"];
const PAYMENT_KEYWORDS: &[&str] = &["pago", "pagar", "pagos", "factura", "cuota", "cuotas"];
const NEXT_STEP_KEYWORDS: &[&str] =
    &["que sigue", "siguiente paso", "proximo paso", "que hago ahora", "y ahora"];

fn field_label(field: &str) -> &'static str {
    match field {
        "identification" => "tu número de identificación (cédula)",
        "mobile" => "tu número de celular",
        _ => "tu correo electrónico",
    }
}

fn format_hint(field: &str) -> &'static str {
    match field {
        "identification" => "La identificación debe tener entre 6 y 12 dígitos.",
        "mobile" => "El celular debe tener exactamente 10 dígitos.",
        _ => "El correo debe tener la forma nombre@dominio.com.",
    }
}

fn data_request(missing: &[String], rejected: &[&'static str]) -> String {
    let mut message = String::new();
    for field in rejected {
        message.push_str(format_hint(field));
        message.push(' ');
    }
    let wanted: Vec<&str> = missing.iter().map(|field| field_label(field)).collect();
    message.push_str(&format!("Para expedir tu póliza necesito {}.", wanted.join(", ")));
    message
}

fn purchase_summary(quotation: &Quotation, plan_name: &str, holder: &Policyholder) -> String {
    let plan = quotation.plan(plan_name);
    let annual = plan.map(|plan| format_money(plan.annual_premium)).unwrap_or_default();
    let monthly = plan.map(|plan| format_money(plan.monthly_premium)).unwrap_or_default();
    format!(
        "Antes de expedir tu póliza, confirma que los datos son correctos:\n\n\
         Vehículo: {}\n\
         Plan: {plan_name}\n\
         Valor anual: {annual}\n\
         Valor mensual: {monthly}\n\
         Identificación: {}\n\
         Celular: {}\n\
         Correo: {}\n\n\
         ¿Confirmas la compra? Responde \"sí\" para expedir o \"no\" para corregir algún dato.",
        quotation.vehicle.describe(),
        holder.identification,
        holder.mobile,
        holder.email,
    )
}

#[derive(Clone, Copy)]
enum FollowUp {
    Status,
    Payment,
}

/// Turns a ready quotation into an issued policy: plan, policyholder data,
/// explicit confirmation and a single backend submission.
pub struct IssuanceHandler {
    issuance: Arc<dyn IssuanceBackend>,
    timeout: Duration,
    max_quotation_handoffs: u8,
    flow: FlowEngine<IssuanceFlow>,
    audit: Arc<dyn AuditSink>,
}

impl IssuanceHandler {
    pub fn new(
        issuance: Arc<dyn IssuanceBackend>,
        timeout: Duration,
        max_quotation_handoffs: u8,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { issuance, timeout, max_quotation_handoffs, flow: FlowEngine::default(), audit }
    }

    fn transition(
        &self,
        state: &mut TurnState,
        event: IssuanceEvent,
        context: &FlowContext,
    ) -> Result<(), HandlerError> {
        let current = state.context.issuance.stage.unwrap_or(IssuanceStage::NeedsQuotation);
        let audit = audit_context(state, HandlerKind::Issuance);
        let outcome =
            self.flow.apply_with_audit(&current, &event, context, self.audit.as_ref(), &audit)?;
        state.context.issuance.stage = Some(outcome.to);
        Ok(())
    }

    fn apply(&self, state: &mut TurnState, event: IssuanceEvent) -> Result<(), HandlerError> {
        self.transition(state, event, &FlowContext::default())
    }

    async fn locate(&self, state: &mut TurnState) -> Result<(), HandlerError> {
        if state.context.quotation.quotation.is_some() {
            self.apply(state, IssuanceEvent::QuotationLocated)?;
            state.context.issuance.quotation_handoffs = 0;
            return self.collect(state).await;
        }

        if state.context.quotation.is_collecting() {
            // Vehicle details are still coming in; quotation owns the rest of this turn.
            self.pass_turn(state, HandlerKind::Quotation);
            return Ok(());
        }

        if state.context.issuance.quotation_handoffs >= self.max_quotation_handoffs {
            self.apply(state, IssuanceEvent::HandoffLimitReached)?;
            warn!(
                session_id = %state.session_id,
                correlation_id = %state.correlation_id,
                handler = "issuance",
                handoffs = state.context.issuance.quotation_handoffs,
                "no quotation after repeated hand-offs"
            );
            state.request_escalation(EscalationReason::QuotationUnrecoverable);
            return Ok(());
        }

        state.context.issuance.quotation_handoffs += 1;
        self.apply(state, IssuanceEvent::QuotationMissing)?;
        state.context.flags.defer_to(HandlerKind::Quotation);
        info!(
            event_name = "handler.handoff",
            session_id = %state.session_id,
            correlation_id = %state.correlation_id,
            handler = "issuance",
            target = "quotation",
            handoffs = state.context.issuance.quotation_handoffs,
            "issuance needs a quotation"
        );
        state.reply(
            HandlerKind::Issuance,
            "Para expedir tu póliza primero necesito cotizar tu vehículo. Cuéntame la marca, la \
             línea y el modelo, por ejemplo: \"Toyota Corolla 2020\".",
        );
        Ok(())
    }

    async fn collect(&self, state: &mut TurnState) -> Result<(), HandlerError> {
        let Some(quotation) = state.context.quotation.quotation.clone() else {
            warn!(
                session_id = %state.session_id,
                handler = "issuance",
                "collecting client data without a quotation"
            );
            state.request_escalation(EscalationReason::QuotationUnrecoverable);
            return Ok(());
        };
        let input = state.last_user_input.clone();

        let stale = state
            .context
            .issuance
            .selected_plan
            .as_deref()
            .map(|name| quotation.plan(name).is_none())
            .unwrap_or(false);
        if stale {
            state.context.issuance.selected_plan = None;
        }

        let chosen = if quotation.has_single_plan() {
            quotation.plans.first().map(|plan| plan.name.clone())
        } else {
            select_plan(&input, &quotation.plans)
        };
        if let Some(name) = chosen {
            if state.context.issuance.selected_plan.as_deref() != Some(name.as_str()) {
                state.context.issuance.selected_plan = Some(name);
                self.apply(state, IssuanceEvent::PlanSelected)?;
            }
        }

        let extracted = extract_client_data(&input);
        state.context.issuance.client.absorb(extracted.data);

        let Some(plan_name) = state.context.issuance.selected_plan.clone() else {
            self.apply(state, IssuanceEvent::PlanUnresolved)?;
            state.reply(
                HandlerKind::Issuance,
                format!(
                    "¿Cuál plan quieres contratar?\n\n{}\n\nPuedes responder con el número o el \
                     nombre del plan.",
                    plan_list(&quotation)
                ),
            );
            return Ok(());
        };

        let missing = state.context.issuance.client.missing_fields();
        if !missing.is_empty() {
            self.transition(state, IssuanceEvent::ClientDataIncomplete, &FlowContext::missing(missing.clone()))?;
            state.reply(HandlerKind::Issuance, data_request(&missing, &extracted.rejected));
            return Ok(());
        }

        let holder = state.context.issuance.client.complete()?;
        self.transition(state, IssuanceEvent::ClientDataComplete, &FlowContext::missing(Vec::new()))?;
        state.reply(HandlerKind::Issuance, purchase_summary(&quotation, &plan_name, &holder));
        Ok(())
    }

    async fn confirm(&self, state: &mut TurnState) -> Result<(), HandlerError> {
        match parse_confirmation(&state.last_user_input) {
            Confirmation::Affirmative => {
                self.apply(state, IssuanceEvent::Confirmed)?;
                self.submit(state).await
            }
            Confirmation::Negative => {
                self.apply(state, IssuanceEvent::Declined)?;
                let before = state.context.issuance.client.clone();
                let extracted = extract_client_data(&state.last_user_input);
                state.context.issuance.client.absorb(extracted.data);
                if state.context.issuance.client != before {
                    return self.collect(state).await;
                }
                state.reply(
                    HandlerKind::Issuance,
                    "Claro. Dime qué dato quieres corregir: tu identificación, tu celular, tu \
                     correo o el plan.",
                );
                Ok(())
            }
            Confirmation::Ambiguous => {
                self.apply(state, IssuanceEvent::Ambiguous)?;
                let summary = self.current_summary(state)?;
                state.reply(
                    HandlerKind::Issuance,
                    format!("No entendí tu respuesta. {summary}"),
                );
                Ok(())
            }
        }
    }

    fn current_summary(&self, state: &TurnState) -> Result<String, HandlerError> {
        let (quotation, plan_name, holder) = self.purchase(state)?;
        Ok(purchase_summary(&quotation, &plan_name, &holder))
    }

    fn purchase(&self, state: &TurnState) -> Result<(Quotation, String, Policyholder), HandlerError> {
        let quotation = state
            .context
            .quotation
            .quotation
            .clone()
            .ok_or_else(|| HandlerError::Internal("purchase has no quotation".to_string()))?;
        let plan_name = state
            .context
            .issuance
            .selected_plan
            .clone()
            .ok_or_else(|| HandlerError::Internal("purchase has no selected plan".to_string()))?;
        let holder = state.context.issuance.client.complete()?;
        Ok((quotation, plan_name, holder))
    }

    /// Submits exactly once. Any failure leaves the stage at `Processing` and escalates.
    async fn submit(&self, state: &mut TurnState) -> Result<(), HandlerError> {
        let (quotation, plan_name, holder) = self.purchase(state)?;
        let plan = quotation
            .plan(&plan_name)
            .cloned()
            .ok_or_else(|| HandlerError::Internal(format!("plan `{plan_name}` not in quotation")))?;
        let request = IssuanceRequest::new(&holder, &quotation, &plan);

        info!(
            session_id = %state.session_id,
            correlation_id = %state.correlation_id,
            handler = "issuance",
            backend = self.issuance.name(),
            quotation_id = %quotation.id.0,
            plan = %plan.name,
            "submitting policy issuance"
        );
        let result =
            with_timeout(self.issuance.name(), self.timeout, self.issuance.issue(&request)).await;
        let audit = audit_context(state, HandlerKind::Issuance);

        let policy_number = match result {
            Ok(IssuanceOutcome::Issued { policy_number }) => policy_number,
            Ok(IssuanceOutcome::Rejected { error }) => return self.fail(state, error),
            Err(error) => return self.fail(state, error.to_string()),
        };

        let policy = Policy {
            policy_number,
            session_id: state.session_id.clone(),
            client: holder,
            quotation_ref: quotation.id.clone(),
            plan_name: plan.name.clone(),
            annual_premium: plan.annual_premium,
            monthly_premium: plan.monthly_premium,
            issued_at: Utc::now(),
        };
        self.apply(state, IssuanceEvent::IssuanceSucceeded)?;
        self.audit.emit(
            AuditEvent::new(&audit, "issuance.succeeded", AuditCategory::Issuance, AuditOutcome::Success)
                .with_metadata("policy_number", policy.policy_number.0.clone()),
        );

        let record = &mut state.context.issuance;
        record.policy = Some(policy.clone());
        record.last_error = None;
        state.reply(
            HandlerKind::Issuance,
            format!(
                "¡Listo! Tu póliza quedó expedida con el número {}. Plan {} para tu {}: {} al año \
                 ({} al mes). Te enviaremos los documentos a {}.",
                policy.policy_number.0,
                policy.plan_name,
                quotation.vehicle.describe(),
                format_money(policy.annual_premium),
                format_money(policy.monthly_premium),
                policy.client.email
            ),
        );
        state.record_artifact(TurnArtifact::Policy(policy));
        Ok(())
    }

    fn fail(&self, state: &mut TurnState, detail: String) -> Result<(), HandlerError> {
        self.apply(state, IssuanceEvent::IssuanceFailed)?;
        warn!(
            session_id = %state.session_id,
            correlation_id = %state.correlation_id,
            handler = "issuance",
            backend = self.issuance.name(),
            error = %detail,
            "policy issuance failed"
        );
        self.audit.emit(
            AuditEvent::new(
                &audit_context(state, HandlerKind::Issuance),
                "issuance.failed",
                AuditCategory::Issuance,
                AuditOutcome::Failed,
            )
            .with_metadata("error", detail.clone()),
        );
        state.context.issuance.last_error = Some(detail.clone());
        state.request_escalation(EscalationReason::IssuanceFailed { detail });
        Ok(())
    }

    /// Hands the rest of the turn to `target` without replying.
    fn pass_turn(&self, state: &mut TurnState, target: HandlerKind) {
        state.context.flags.transfer_to = Some(target);
        info!(
            event_name = "handler.handoff",
            session_id = %state.session_id,
            correlation_id = %state.correlation_id,
            handler = "issuance",
            target = %target,
            stage = ?state.context.issuance.stage,
            "issuance passes the turn on"
        );
    }

    /// Turns after the policy was issued. Requotes go to quotation, a purchase
    /// of a newer quotation restarts issuance, and open questions that are not
    /// about the policy go to consultation.
    async fn after_completion(&self, state: &mut TurnState) -> Result<(), HandlerError> {
        let input = state.last_user_input.clone();
        let tokens = tokenize(&input);

        if mentions_any(&tokens, QUOTATION_KEYWORDS) || !extract_vehicle(&input).is_empty() {
            self.pass_turn(state, HandlerKind::Quotation);
            return Ok(());
        }

        let issued_from = state.context.issuance.policy.as_ref().map(|policy| &policy.quotation_ref);
        let newer_quotation = state
            .context
            .quotation
            .quotation
            .as_ref()
            .map(|quotation| Some(&quotation.id) != issued_from)
            .unwrap_or(false);
        if newer_quotation && mentions_any(&tokens, PURCHASE_KEYWORDS) {
            info!(
                session_id = %state.session_id,
                correlation_id = %state.correlation_id,
                handler = "issuance",
                "new purchase after an issued policy"
            );
            let client = state.context.issuance.client.clone();
            state.context.issuance = IssuanceRecord {
                stage: Some(IssuanceStage::NeedsQuotation),
                client,
                ..IssuanceRecord::default()
            };
            return self.locate(state).await;
        }

        if mentions_any(&tokens, PAYMENT_KEYWORDS) {
            return self.follow_up(state, FollowUp::Payment);
        }
        let about_policy = mentions_any(&tokens, POLICY_FOLLOW_UP_KEYWORDS)
            || mentions_any(&tokens, NEXT_STEP_KEYWORDS);
        if input.contains('?') && !about_policy {
            self.pass_turn(state, HandlerKind::Consultation);
            return Ok(());
        }
        self.follow_up(state, FollowUp::Status)
    }

    fn follow_up(&self, state: &mut TurnState, kind: FollowUp) -> Result<(), HandlerError> {
        self.apply(state, IssuanceEvent::FollowUp)?;
        let policy = state
            .context
            .issuance
            .policy
            .clone()
            .ok_or_else(|| HandlerError::Internal("completed issuance without policy".to_string()))?;
        let reply = match kind {
            FollowUp::Status => format!(
                "Tu póliza {} ({}) está expedida y vigente. Los documentos llegan a {}. Si \
                 necesitas cambiar algo o tienes un inconveniente, escribe \"asesor\" y una \
                 persona de nuestro equipo te ayudará.",
                policy.policy_number.0, policy.plan_name, policy.client.email
            ),
            FollowUp::Payment => format!(
                "Tu póliza {} se paga en {} al año o en cuotas de {} al mes. Las instrucciones \
                 de pago llegan a {} junto con tus documentos.",
                policy.policy_number.0,
                format_money(policy.annual_premium),
                format_money(policy.monthly_premium),
                policy.client.email
            ),
        };
        state.reply(HandlerKind::Issuance, reply);
        Ok(())
    }
}

#[async_trait]
impl Handler for IssuanceHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Issuance
    }

    fn can_handle(&self, input: &str, state: &TurnState) -> bool {
        let record = &state.context.issuance;
        if record.is_in_progress() {
            return true;
        }
        let tokens = tokenize(input);
        match record.stage {
            Some(IssuanceStage::Completed) => mentions_any(&tokens, POLICY_FOLLOW_UP_KEYWORDS),
            _ => {
                state.context.quotation.quotation.is_some() && mentions_any(&tokens, PURCHASE_KEYWORDS)
            }
        }
    }

    async fn process(&self, state: &mut TurnState) -> Result<(), HandlerError> {
        state.touch(HandlerKind::Issuance);
        match state.context.issuance.stage {
            None | Some(IssuanceStage::NeedsQuotation) => {
                state.context.issuance.stage = Some(IssuanceStage::NeedsQuotation);
                self.locate(state).await
            }
            Some(IssuanceStage::RequestingClientData) => self.collect(state).await,
            Some(IssuanceStage::ConfirmingPurchase) => self.confirm(state).await,
            Some(IssuanceStage::Processing) => {
                let detail = state
                    .context
                    .issuance
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "submission outcome unknown".to_string());
                warn!(
                    session_id = %state.session_id,
                    handler = "issuance",
                    error = %detail,
                    "issuance still processing, not resubmitting"
                );
                state.request_escalation(EscalationReason::IssuanceFailed { detail });
                Ok(())
            }
            Some(IssuanceStage::Completed) => self.after_completion(state).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    use autopoliza_core::audit::NoopAuditSink;
    use autopoliza_core::context::{ConversationContext, TurnArtifact, TurnState};
    use autopoliza_core::domain::escalation::EscalationReason;
    use autopoliza_core::domain::session::HandlerKind;
    use autopoliza_core::flows::{IssuanceStage, QuotationStage};

    use super::IssuanceHandler;
    use crate::collaborators::{CollaboratorError, IssuanceOutcome};
    use crate::handlers::Handler;
    use crate::test_support::{
        last_reply, quotation, three_plan_quotation, turn_state_with, ScriptedIssuance,
    };

    fn handler(backend: ScriptedIssuance) -> IssuanceHandler {
        IssuanceHandler::new(Arc::new(backend), Duration::from_secs(1), 3, Arc::new(NoopAuditSink))
    }

    fn quoted_context() -> ConversationContext {
        let mut context = ConversationContext::default();
        context.quotation.stage = Some(QuotationStage::QuoteReady);
        context.quotation.quotation = Some(three_plan_quotation());
        context
    }

    fn confirming_context() -> ConversationContext {
        let mut context = quoted_context();
        context.issuance.stage = Some(IssuanceStage::ConfirmingPurchase);
        context.issuance.selected_plan = Some("Plan Basico".to_string());
        context.issuance.client.identification = Some("1020304050".to_string());
        context.issuance.client.mobile = Some("3001234567".to_string());
        context.issuance.client.email = Some("ana@correo.co".to_string());
        context
    }

    async fn run(handler: &IssuanceHandler, input: &str, context: ConversationContext) -> TurnState {
        let mut state = turn_state_with(input, Vec::new(), context);
        handler.process(&mut state).await.expect("process");
        state
    }

    #[tokio::test]
    async fn multiple_plans_are_resolved_before_personal_data() {
        let handler = handler(ScriptedIssuance::issued("1234567890"));
        let state = run(&handler, "quiero comprar", quoted_context()).await;

        assert_eq!(state.context.issuance.stage, Some(IssuanceStage::RequestingClientData));
        assert!(state.context.issuance.selected_plan.is_none());
        assert!(last_reply(&state).contains("¿Cuál plan"));

        let state = run(&handler, "el segundo", state.context).await;
        assert_eq!(state.context.issuance.selected_plan.as_deref(), Some("Plan Autos Clasico"));
        assert!(last_reply(&state).contains("tu número de identificación"));
    }

    #[tokio::test]
    async fn single_plan_is_selected_automatically() {
        let mut context = ConversationContext::default();
        let mut single = three_plan_quotation();
        single.plans.truncate(1);
        context.quotation.quotation = Some(quotation(single.plans));

        let state = run(&handler(ScriptedIssuance::issued("1")), "quiero comprar", context).await;
        assert_eq!(state.context.issuance.selected_plan.as_deref(), Some("Plan Basico"));
    }

    #[tokio::test]
    async fn client_data_accumulates_across_turns() {
        let handler = handler(ScriptedIssuance::issued("1234567890"));
        let mut context = quoted_context();
        context.issuance.stage = Some(IssuanceStage::RequestingClientData);
        context.issuance.selected_plan = Some("Plan Basico".to_string());

        let mut known: BTreeSet<&'static str> = BTreeSet::new();
        let mut state_context = context;
        for input in ["mi cédula es 1020304050", "celular 3001234567", "ana@correo.co"] {
            let state = run(&handler, input, state_context).await;
            let now: BTreeSet<&'static str> =
                state.context.issuance.client.known_fields().into_iter().collect();
            assert!(now.is_superset(&known), "lost fields after `{input}`");
            known = now;
            state_context = state.context;
        }

        assert_eq!(state_context.issuance.stage, Some(IssuanceStage::ConfirmingPurchase));
        assert_eq!(known.len(), 3);
    }

    #[tokio::test]
    async fn invalid_values_get_format_hints() {
        let mut context = quoted_context();
        context.issuance.stage = Some(IssuanceStage::RequestingClientData);
        context.issuance.selected_plan = Some("Plan Basico".to_string());

        let state = run(&handler(ScriptedIssuance::issued("1")), "celular 12345", context).await;
        assert!(state.context.issuance.client.mobile.is_none());
        assert!(last_reply(&state).contains("10 dígitos"));
        assert_eq!(state.context.issuance.stage, Some(IssuanceStage::RequestingClientData));
    }

    #[tokio::test]
    async fn affirmative_confirmation_issues_policy_once() {
        let backend = ScriptedIssuance::issued("4455667788");
        let requests = backend.requests();
        let handler = handler(backend);

        let state = run(&handler, "sí, confirmo", confirming_context()).await;

        assert_eq!(state.context.issuance.stage, Some(IssuanceStage::Completed));
        let policy = state.context.issuance.policy.as_ref().expect("policy");
        assert_eq!(policy.policy_number.0, "4455667788");
        assert!(matches!(state.artifacts(), [TurnArtifact::Policy(_)]));
        assert!(last_reply(&state).contains("4455667788"));
        assert_eq!(requests.lock().expect("lock").len(), 1);
        assert_eq!(requests.lock().expect("lock")[0].plan_name, "Plan Basico");
    }

    #[tokio::test]
    async fn negative_confirmation_returns_to_data_collection() {
        let state = run(&handler(ScriptedIssuance::issued("1")), "no", confirming_context()).await;

        assert_eq!(state.context.issuance.stage, Some(IssuanceStage::RequestingClientData));
        assert!(last_reply(&state).contains("corregir"));
        assert_eq!(state.context.issuance.client.known_fields().len(), 3);
    }

    #[tokio::test]
    async fn ambiguous_confirmation_represents_summary() {
        let state =
            run(&handler(ScriptedIssuance::issued("1")), "mmm no estoy seguro, sí", confirming_context())
                .await;

        assert_eq!(state.context.issuance.stage, Some(IssuanceStage::ConfirmingPurchase));
        assert!(last_reply(&state).starts_with("No entendí"));
    }

    #[tokio::test]
    async fn backend_failure_escalates_with_reason_and_never_retries() {
        let backend =
            ScriptedIssuance::new(Ok(IssuanceOutcome::Rejected { error: "placa bloqueada".to_string() }));
        let requests = backend.requests();
        let handler = handler(backend);

        let state = run(&handler, "sí", confirming_context()).await;
        assert_eq!(state.context.issuance.stage, Some(IssuanceStage::Processing));
        assert!(state.needs_human_intervention);
        assert_eq!(
            state.escalation_reason,
            Some(EscalationReason::IssuanceFailed { detail: "placa bloqueada".to_string() })
        );
        assert_eq!(state.produced_count(), 0);

        let state = run(&handler, "¿ya quedó?", state.context).await;
        assert!(state.needs_human_intervention);
        assert_eq!(requests.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn unreachable_backend_escalates() {
        let backend = ScriptedIssuance::new(Err(CollaboratorError::Timeout { backend: "issuance", secs: 10 }));
        let state = run(&handler(backend), "sí", confirming_context()).await;

        assert!(matches!(
            state.escalation_reason,
            Some(EscalationReason::IssuanceFailed { ref detail }) if detail.contains("timed out")
        ));
        assert!(state.context.issuance.policy.is_none());
    }

    #[tokio::test]
    async fn missing_quotation_hands_off_then_escalates_at_cap() {
        let handler = handler(ScriptedIssuance::issued("1"));
        let mut context = ConversationContext::default();
        for attempt in 1..=3u8 {
            let state = run(&handler, "quiero comprar", context).await;
            assert_eq!(state.context.issuance.quotation_handoffs, attempt);
            assert_eq!(state.context.flags.transfer_to, Some(HandlerKind::Quotation));
            context = state.context;
            context.flags = Default::default();
        }

        let state = run(&handler, "quiero comprar", context).await;
        assert!(state.needs_human_intervention);
        assert_eq!(state.escalation_reason, Some(EscalationReason::QuotationUnrecoverable));
        assert_eq!(state.context.issuance.stage, Some(IssuanceStage::NeedsQuotation));
    }

    #[tokio::test]
    async fn completed_issuance_answers_follow_up() {
        let handler = handler(ScriptedIssuance::issued("9988776655"));
        let state = run(&handler, "sí", confirming_context()).await;
        let state = run(&handler, "¿cuál es mi número de póliza?", state.context).await;

        assert_eq!(state.context.issuance.stage, Some(IssuanceStage::Completed));
        assert!(last_reply(&state).contains("9988776655"));
        assert!(handler.can_handle("mi poliza", &state));
    }

    #[tokio::test]
    async fn completed_issuance_passes_requotes_and_open_questions_on() {
        let handler = handler(ScriptedIssuance::issued("9988776655"));
        let issued = run(&handler, "sí", confirming_context()).await.context;

        let state = run(&handler, "quiero cotizar una moto Yamaha", issued.clone()).await;
        assert_eq!(state.context.flags.transfer_to, Some(HandlerKind::Quotation));
        assert!(!state.context.flags.force_end);
        assert_eq!(state.produced_count(), 0);
        assert_eq!(state.context.issuance.stage, Some(IssuanceStage::Completed));

        let state = run(&handler, "¿qué cubre el deducible?", issued.clone()).await;
        assert_eq!(state.context.flags.transfer_to, Some(HandlerKind::Consultation));
        assert_eq!(state.produced_count(), 0);

        let state = run(&handler, "¿cómo pago?", issued.clone()).await;
        assert!(state.context.flags.transfer_to.is_none());
        assert!(last_reply(&state).contains("instrucciones de pago"));

        let state = run(&handler, "muchas gracias, ¿y qué sigue ahora?", issued).await;
        assert!(state.context.flags.transfer_to.is_none());
        assert!(last_reply(&state).contains("9988776655"));
    }

    #[tokio::test]
    async fn buying_a_newer_quotation_restarts_issuance() {
        let backend = ScriptedIssuance::issued("9988776655");
        let requests = backend.requests();
        let handler = handler(backend);
        let mut context = run(&handler, "sí", confirming_context()).await.context;

        let state = run(&handler, "quiero comprarlo", context.clone()).await;
        assert_eq!(state.context.issuance.stage, Some(IssuanceStage::Completed));

        context.quotation.quotation = Some(three_plan_quotation());
        let state = run(&handler, "quiero comprarlo", context).await;
        assert_eq!(state.context.issuance.stage, Some(IssuanceStage::RequestingClientData));
        assert!(state.context.issuance.policy.is_none());
        assert_eq!(state.context.issuance.client.known_fields().len(), 3);
        assert!(last_reply(&state).contains("¿Cuál plan"));
        assert_eq!(requests.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn waiting_issuance_lets_quotation_finish_collecting() {
        let handler = handler(ScriptedIssuance::issued("1"));
        let mut context = ConversationContext::default();
        context.issuance.stage = Some(IssuanceStage::NeedsQuotation);
        context.issuance.quotation_handoffs = 1;
        context.quotation.stage = Some(QuotationStage::AwaitingDetails);

        let state = run(&handler, "es un Mazda", context).await;
        assert_eq!(state.context.flags.transfer_to, Some(HandlerKind::Quotation));
        assert!(!state.context.flags.force_end);
        assert_eq!(state.context.issuance.quotation_handoffs, 1);
        assert_eq!(state.produced_count(), 0);
    }
}
