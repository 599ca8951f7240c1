//! Turn orchestration.
//!
//! One call to [`Orchestrator::process_turn`] loads the session, rebuilds its
//! typed context from the persisted handler blobs, routes the client's input to
//! a handler, follows any same-turn hand-offs the handler requests, and writes
//! the whole turn back in a single store commit. Turns for the same session are
//! serialized by [`SessionLocks`]; different sessions never contend.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info, warn};
use uuid::Uuid;

use autopoliza_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use autopoliza_core::config::RoutingConfig;
use autopoliza_core::context::{ConversationContext, TurnArtifact, TurnFlags, TurnState};
use autopoliza_core::domain::escalation::EscalationReason;
use autopoliza_core::domain::session::{
    ControlMode, HandlerKind, Message, ParticipantKind, Session, SessionId, ADVISOR, ROUTER,
};
use autopoliza_core::errors::{DomainError, InterfaceError};
use autopoliza_core::flows::{IssuanceStage, QuotationStage};
use autopoliza_db::{RepositoryError, SessionStore, TurnCommit};

use crate::classifier::IntentClassifier;
use crate::collaborators::Collaborators;
use crate::handlers::{format_money, HandlerError, HandlerRegistry};

const FALLBACK_REPLY: &str =
    "Lo siento, no logré procesar tu mensaje. ¿Podrías reformularlo o escribir 'asesor' para hablar con una persona?";
const RECENT_MESSAGES: usize = 10;
const FALLBACK_ORDER: [HandlerKind; 3] =
    [HandlerKind::Issuance, HandlerKind::Quotation, HandlerKind::Consultation];

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] RepositoryError),
    #[error("handler state could not be decoded: {0}")]
    State(#[from] serde_json::Error),
    #[error("session `{0}` not found")]
    SessionNotFound(SessionId),
    #[error("empty user input")]
    EmptyInput,
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl OrchestratorError {
    /// Machine-readable class reported in failed turn envelopes.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Store(_) => "store_unavailable",
            Self::SessionNotFound(_) => "not_found",
            Self::EmptyInput | Self::Domain(_) => "bad_request",
            Self::State(_) => "internal",
        }
    }

    pub fn to_interface(&self, correlation_id: &str) -> InterfaceError {
        let message = self.to_string();
        let correlation_id = correlation_id.to_string();
        match self {
            Self::Store(_) => InterfaceError::ServiceUnavailable { message, correlation_id },
            Self::SessionNotFound(_) | Self::EmptyInput | Self::Domain(_) => {
                InterfaceError::BadRequest { message, correlation_id }
            }
            Self::State(_) => InterfaceError::Internal { message, correlation_id },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnRequest {
    pub session_id: String,
    pub user_input: String,
    #[serde(default = "client_participant")]
    pub participant_kind: ParticipantKind,
    /// Per-turn values such as an image-analysis result. Never persisted.
    #[serde(default)]
    pub extra_context: BTreeMap<String, Value>,
}

fn client_participant() -> ParticipantKind {
    ParticipantKind::Client
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, user_input: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_input: user_input.into(),
            participant_kind: ParticipantKind::Client,
            extra_context: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_context.insert(key.into(), value);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuotationSummary {
    pub vehicle: String,
    pub plans: Vec<String>,
    pub estimated: bool,
    pub stage: Option<QuotationStage>,
}

/// Redacted view of the session context returned to callers. Carries no client data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub turn_count: usize,
    pub message_count: usize,
    pub quotation: Option<QuotationSummary>,
    pub issuance_stage: Option<IssuanceStage>,
    pub selected_plan: Option<String>,
    pub policy_number: Option<String>,
    pub escalated: bool,
    pub control_mode: ControlMode,
}

impl ContextSummary {
    pub fn from_state(state: &TurnState) -> Self {
        let context = &state.context;
        let quotation = context.quotation.quotation.as_ref().map(|quotation| QuotationSummary {
            vehicle: quotation.vehicle.describe(),
            plans: quotation
                .plans
                .iter()
                .map(|plan| format!("{} ({} al año)", plan.name, format_money(plan.annual_premium)))
                .collect(),
            estimated: quotation.estimated,
            stage: context.quotation.stage,
        });

        Self {
            turn_count: state.conversation_history.iter().filter(|message| message.is_user()).count(),
            message_count: state.conversation_history.len(),
            quotation,
            issuance_stage: context.issuance.stage,
            selected_plan: context.issuance.selected_plan.clone(),
            policy_number: context
                .issuance
                .policy
                .as_ref()
                .map(|policy| policy.policy_number.0.clone()),
            escalated: context.escalation.active || state.needs_human_intervention,
            control_mode: state.control_mode,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnResponse {
    pub success: bool,
    pub content: String,
    pub handler: String,
    pub session_id: String,
    pub context_summary: Option<ContextSummary>,
    pub error: Option<String>,
}

impl TurnResponse {
    fn failure(session_id: &SessionId, content: &str, error_class: &str) -> Self {
        Self {
            success: false,
            content: content.to_string(),
            handler: ROUTER.to_string(),
            session_id: session_id.0.clone(),
            context_summary: None,
            error: Some(error_class.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub exists: bool,
    pub session_id: String,
    pub control_mode: Option<ControlMode>,
    pub current_handler: Option<HandlerKind>,
    pub handler_states: BTreeMap<String, Value>,
    pub recent_messages: Vec<Message>,
    pub message_count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub orchestrator: String,
    pub handlers: BTreeMap<String, String>,
    pub dependencies: BTreeMap<String, String>,
}

/// One async mutex per session id.
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    /// Waits for the session's lock. The guard releases it on drop, on every exit path.
    pub async fn acquire(&self, session_id: &SessionId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(session_id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Everything needed to process turns, wired once at startup.
pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    handlers: HandlerRegistry,
    classifier: IntentClassifier,
    collaborators: Option<Collaborators>,
    routing: RoutingConfig,
    audit: Arc<dyn AuditSink>,
    locks: SessionLocks,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        handlers: HandlerRegistry,
        classifier: IntentClassifier,
        routing: RoutingConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            handlers,
            classifier,
            collaborators: None,
            routing,
            audit,
            locks: SessionLocks::default(),
        }
    }

    /// Collaborators reported by [`Orchestrator::get_system_health`].
    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        self.store.clone()
    }

    /// Processes one client turn. Never fails: errors become a `success=false` envelope.
    pub async fn process_turn(&self, request: TurnRequest) -> TurnResponse {
        let correlation_id = Uuid::new_v4().to_string();
        let session_id = SessionId(request.session_id.clone());
        info!(
            event_name = "turn.started",
            session_id = %session_id,
            correlation_id = %correlation_id,
            participant = request.participant_kind.as_str(),
            "turn started"
        );

        match self.run_turn(&request, &session_id, &correlation_id).await {
            Ok(response) => response,
            Err(failure) => {
                error!(
                    event_name = "turn.failed",
                    session_id = %session_id,
                    correlation_id = %correlation_id,
                    error_class = failure.error_class(),
                    error = %failure,
                    "turn failed; session left unchanged"
                );
                let interface = failure.to_interface(&correlation_id);
                TurnResponse::failure(&session_id, interface.user_message(), failure.error_class())
            }
        }
    }

    async fn run_turn(
        &self,
        request: &TurnRequest,
        session_id: &SessionId,
        correlation_id: &str,
    ) -> Result<TurnResponse, OrchestratorError> {
        if request.user_input.trim().is_empty() {
            return Err(OrchestratorError::EmptyInput);
        }

        let _guard = self.locks.acquire(session_id).await;

        let session = match self.store.get_session(session_id).await? {
            Some(session) => session,
            None => Session::new(session_id.clone(), request.participant_kind),
        };
        let mut state = self.rehydrate(&session, correlation_id).await?;
        let flags_at_load = state.context.flags.clone();
        state.context.extra = request.extra_context.clone();
        state.push_user_input(request.user_input.trim());

        if session.control_mode == ControlMode::HumanActive {
            info!(
                session_id = %session_id,
                correlation_id = %correlation_id,
                "client message recorded for the active advisor"
            );
            self.commit(session, &state, &flags_at_load).await?;
            return Ok(TurnResponse {
                success: true,
                content: String::new(),
                handler: ADVISOR.to_string(),
                session_id: session_id.0.clone(),
                context_summary: Some(ContextSummary::from_state(&state)),
                error: None,
            });
        }

        if state.context.escalation.active && state.control_mode != ControlMode::Automated {
            state.needs_human_intervention = true;
            state.escalation_reason = state.context.escalation.reason.clone();
        }

        let first = self.route(&mut state).await;
        let outcome = self.dispatch(&mut state, first).await;

        let content = state
            .produced_messages()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let summary = ContextSummary::from_state(&state);
        if let Err(failure) = self.commit(session, &state, &flags_at_load).await {
            self.keep_issued_policies(&state).await;
            return Err(failure);
        }

        info!(
            event_name = "turn.completed",
            session_id = %session_id,
            correlation_id = %correlation_id,
            handler = %outcome.last,
            hops = outcome.hops,
            produced = state.produced_count(),
            escalated = summary.escalated,
            "turn completed"
        );

        Ok(TurnResponse {
            success: true,
            content,
            handler: outcome.last.as_str().to_string(),
            session_id: session_id.0.clone(),
            context_summary: Some(summary),
            error: outcome.fault.then(|| "handler_fault".to_string()),
        })
    }

    /// Loads history and handler blobs into a fresh turn state.
    async fn rehydrate(
        &self,
        session: &Session,
        correlation_id: &str,
    ) -> Result<TurnState, OrchestratorError> {
        let history = self.store.get_history(&session.id, None).await?;
        let blobs = self.store.get_handler_states(&session.id).await?;
        let mut context = ConversationContext::from_state_blobs(blobs)?;
        if context.quotation.quotation.is_none() {
            context.quotation.quotation = self.store.latest_quotation(&session.id).await?;
        }
        Ok(TurnState::new(session, correlation_id, history, context))
    }

    fn can_handle(&self, kind: HandlerKind, input: &str, state: &TurnState) -> bool {
        self.handlers.get(kind).map(|handler| handler.can_handle(input, state)).unwrap_or(false)
    }

    async fn route(&self, state: &mut TurnState) -> HandlerKind {
        let input = state.last_user_input.clone();
        let (handler, reason) = self.select_handler(state, &input).await;

        info!(
            event_name = "turn.routed",
            session_id = %state.session_id,
            correlation_id = %state.correlation_id,
            handler = %handler,
            reason,
            "turn routed"
        );
        let context = AuditContext::new(
            Some(state.session_id.clone()),
            state.correlation_id.clone(),
            ROUTER,
        );
        self.audit.emit(
            AuditEvent::new(&context, "routing.decided", AuditCategory::Routing, AuditOutcome::Success)
                .with_metadata("handler", handler.as_str())
                .with_metadata("reason", reason),
        );
        handler
    }

    async fn select_handler(&self, state: &mut TurnState, input: &str) -> (HandlerKind, &'static str) {
        if state.needs_human_intervention || self.can_handle(HandlerKind::Escalation, input, state) {
            if let Some(dropped) = state.context.flags.transfer_to.take() {
                info!(
                    session_id = %state.session_id,
                    handler = %dropped,
                    "pending transfer dropped by escalation"
                );
            }
            return (HandlerKind::Escalation, "escalation_override");
        }

        if let Some(target) = state.context.flags.transfer_to.take() {
            if self.handlers.contains(target) {
                return (target, "transfer_flag");
            }
            warn!(session_id = %state.session_id, handler = %target, "transfer to unregistered handler dropped");
        }

        if state.context.issuance.is_active() {
            return (HandlerKind::Issuance, "active_issuance");
        }
        if state.context.quotation.is_collecting() {
            return (HandlerKind::Quotation, "active_quotation");
        }
        if let Some(current) = state.current_handler {
            if current != HandlerKind::Escalation && self.can_handle(current, input, state) {
                return (current, "current_handler");
            }
        }

        let classification = self.classifier.classify(input, state).await;
        if self.handlers.contains(classification.handler)
            && (classification.confidence > self.routing.classifier_confidence_threshold
                || self.can_handle(classification.handler, input, state))
        {
            return (classification.handler, "classifier");
        }

        for kind in FALLBACK_ORDER {
            if self.can_handle(kind, input, state) {
                return (kind, "fallback");
            }
        }
        (HandlerKind::Consultation, "default")
    }

    async fn dispatch(&self, state: &mut TurnState, first: HandlerKind) -> DispatchOutcome {
        let mut outcome = DispatchOutcome { last: first, hops: 0, fault: false };
        let mut visited = BTreeSet::new();
        let mut next = Some(first);

        while let Some(kind) = next.take() {
            let Some(handler) = self.handlers.get(kind) else {
                warn!(session_id = %state.session_id, handler = %kind, "no handler registered");
                break;
            };
            visited.insert(kind);
            outcome.last = kind;
            state.current_handler = Some(kind);

            let produced_before = state.produced_count();
            if let Err(failure) = handler.process(state).await {
                outcome.fault = true;
                self.handler_fault(state, kind, &failure);
                if kind != HandlerKind::Issuance {
                    break;
                }
            }
            let passed_on = state.context.flags.transfer_to.is_some() && !state.context.flags.force_end;
            if state.produced_count() == produced_before && !state.needs_human_intervention && !passed_on {
                warn!(
                    session_id = %state.session_id,
                    handler = %kind,
                    "handler produced no reply; sending fallback"
                );
                state.reply(kind, FALLBACK_REPLY);
            }

            next = self.next_handler(state, kind, &mut outcome.hops, &visited);
        }

        if state.produced_count() == 0 {
            state.reply_as(ROUTER, FALLBACK_REPLY);
        }
        outcome
    }

    fn handler_fault(&self, state: &mut TurnState, kind: HandlerKind, failure: &HandlerError) {
        error!(
            session_id = %state.session_id,
            correlation_id = %state.correlation_id,
            handler = %kind,
            error = %failure,
            "handler failed"
        );
        let apology = InterfaceError::Internal {
            message: failure.to_string(),
            correlation_id: state.correlation_id.clone(),
        };
        state.reply(kind, apology.user_message());
        if kind == HandlerKind::Issuance {
            state.request_escalation(EscalationReason::HandlerFault { handler: kind });
        }
    }

    /// Post-handler routing. `None` ends the turn.
    fn next_handler(
        &self,
        state: &mut TurnState,
        ran: HandlerKind,
        hops: &mut u8,
        visited: &BTreeSet<HandlerKind>,
    ) -> Option<HandlerKind> {
        if state.needs_human_intervention {
            if ran == HandlerKind::Escalation {
                return None;
            }
            self.log_handoff(state, ran, HandlerKind::Escalation);
            return Some(HandlerKind::Escalation);
        }

        let flags = &mut state.context.flags;
        if flags.force_end {
            flags.force_end = false;
            return None;
        }

        let target = flags.transfer_to.take()?;
        if !target.is_continuable() {
            return None;
        }
        *hops += 1;
        if *hops > self.routing.max_hops_per_turn || visited.contains(&target) {
            warn!(
                session_id = %state.session_id,
                from = %ran,
                to = %target,
                hops = *hops,
                "hand-off chain cut; ending turn"
            );
            return None;
        }
        self.log_handoff(state, ran, target);
        Some(target)
    }

    fn log_handoff(&self, state: &TurnState, from: HandlerKind, to: HandlerKind) {
        info!(
            event_name = "handler.handoff",
            session_id = %state.session_id,
            correlation_id = %state.correlation_id,
            from = %from,
            to = %to,
            "same-turn hand-off"
        );
        let context = AuditContext::new(
            Some(state.session_id.clone()),
            state.correlation_id.clone(),
            from.as_str(),
        );
        self.audit.emit(
            AuditEvent::new(&context, "handler.handoff", AuditCategory::Handoff, AuditOutcome::Success)
                .with_metadata("to", to.as_str()),
        );
    }

    /// Writes the turn's messages, touched handler records and artifacts in one commit.
    async fn commit(
        &self,
        mut session: Session,
        state: &TurnState,
        flags_at_load: &TurnFlags,
    ) -> Result<(), OrchestratorError> {
        session.control_mode = state.control_mode;
        session.current_handler = state.current_handler;
        session.updated_at = Utc::now();

        let mut commit = TurnCommit::new(session);
        commit.messages = state.unsaved_messages().to_vec();

        let mut owners = Vec::new();
        if state.context.flags != *flags_at_load {
            owners.push(ROUTER);
        }
        owners.extend(state.touched_handlers().map(HandlerKind::as_str));
        for owner in owners {
            if let Some(blob) = state.context.state_blob(owner)? {
                commit.handler_states.push((owner.to_string(), blob));
            }
        }

        for artifact in state.artifacts() {
            match artifact {
                TurnArtifact::Quotation(quotation) => commit.quotations.push(quotation.clone()),
                TurnArtifact::Policy(policy) => commit.policies.push(policy.clone()),
            }
        }

        self.store.commit_turn(commit).await?;
        Ok(())
    }

    /// Writes issued policies and the issuance record outside a failed turn
    /// commit, so the next confirmation finds a completed purchase instead of
    /// submitting it again.
    async fn keep_issued_policies(&self, state: &TurnState) {
        let policies: Vec<_> = state
            .artifacts()
            .iter()
            .filter_map(|artifact| match artifact {
                TurnArtifact::Policy(policy) => Some(policy.clone()),
                TurnArtifact::Quotation(_) => None,
            })
            .collect();
        if policies.is_empty() {
            return;
        }

        for policy in policies {
            let number = policy.policy_number.0.clone();
            match self.store.save_policy(policy).await {
                Ok(()) => warn!(
                    session_id = %state.session_id,
                    correlation_id = %state.correlation_id,
                    policy_number = %number,
                    "turn commit failed; issued policy saved on its own"
                ),
                Err(failure) => error!(
                    session_id = %state.session_id,
                    correlation_id = %state.correlation_id,
                    policy_number = %number,
                    error = %failure,
                    "issued policy could not be saved"
                ),
            }
        }

        let owner = HandlerKind::Issuance.as_str();
        let saved = match state.context.state_blob(owner) {
            Ok(Some(blob)) => self
                .store
                .save_handler_state(&state.session_id, owner, blob)
                .await
                .map_err(|failure| failure.to_string()),
            Ok(None) => Ok(()),
            Err(failure) => Err(failure.to_string()),
        };
        if let Err(failure) = saved {
            error!(
                session_id = %state.session_id,
                correlation_id = %state.correlation_id,
                error = %failure,
                "completed issuance record could not be saved"
            );
        }
    }

    pub async fn get_session_status(
        &self,
        session_id: &SessionId,
    ) -> Result<SessionStatus, OrchestratorError> {
        let Some(session) = self.store.get_session(session_id).await? else {
            return Ok(SessionStatus {
                exists: false,
                session_id: session_id.0.clone(),
                control_mode: None,
                current_handler: None,
                handler_states: BTreeMap::new(),
                recent_messages: Vec::new(),
                message_count: 0,
            });
        };

        Ok(SessionStatus {
            exists: true,
            session_id: session_id.0.clone(),
            control_mode: Some(session.control_mode),
            current_handler: session.current_handler,
            handler_states: self.store.get_handler_states(session_id).await?.into_iter().collect(),
            recent_messages: self.store.get_history(session_id, Some(RECENT_MESSAGES)).await?,
            message_count: self.store.count_messages(session_id).await?,
        })
    }

    pub async fn list_sessions(
        &self,
        control_mode: Option<ControlMode>,
    ) -> Result<Vec<Session>, OrchestratorError> {
        Ok(self.store.list_sessions(control_mode).await?)
    }

    /// Posts an advisor reply into the session and marks it as human-handled.
    pub async fn post_advisor_message(
        &self,
        session_id: &SessionId,
        content: &str,
    ) -> Result<Message, OrchestratorError> {
        if content.trim().is_empty() {
            return Err(OrchestratorError::EmptyInput);
        }
        let _guard = self.locks.acquire(session_id).await;
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.clone()))?;

        session.control_mode = session.control_mode.transition_to(ControlMode::HumanActive)?;
        session.updated_at = Utc::now();
        let message = Message::assistant(session_id.clone(), ADVISOR, content.trim());

        let mut commit = TurnCommit::new(session);
        commit.messages.push(message.clone());
        self.store.commit_turn(commit).await?;

        info!(session_id = %session_id, "advisor message posted");
        self.emit_advisor_event(session_id, "advisor.message_posted");
        Ok(message)
    }

    /// Hands the session back to automated handling and closes the escalation case.
    pub async fn release_session(&self, session_id: &SessionId) -> Result<Session, OrchestratorError> {
        let _guard = self.locks.acquire(session_id).await;
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::SessionNotFound(session_id.clone()))?;
        let blobs = self.store.get_handler_states(session_id).await?;
        let mut context = ConversationContext::from_state_blobs(blobs)?;

        session.control_mode = session.control_mode.transition_to(ControlMode::Automated)?;
        session.updated_at = Utc::now();
        context.escalation = Default::default();
        context.flags = TurnFlags::default();

        let mut commit = TurnCommit::new(session.clone());
        let mut owners = vec![ROUTER, HandlerKind::Escalation.as_str()];
        if context.issuance.stage == Some(IssuanceStage::Processing) {
            context.issuance = Default::default();
            owners.push(HandlerKind::Issuance.as_str());
        }
        for owner in owners {
            if let Some(blob) = context.state_blob(owner)? {
                commit.handler_states.push((owner.to_string(), blob));
            }
        }
        self.store.commit_turn(commit).await?;

        info!(session_id = %session_id, "session released to automated handling");
        self.emit_advisor_event(session_id, "advisor.session_released");
        Ok(session)
    }

    fn emit_advisor_event(&self, session_id: &SessionId, event_type: &str) {
        let context = AuditContext::new(Some(session_id.clone()), Uuid::new_v4().to_string(), ADVISOR);
        self.audit.emit(AuditEvent::new(
            &context,
            event_type,
            AuditCategory::Escalation,
            AuditOutcome::Success,
        ));
    }

    pub async fn get_system_health(&self) -> SystemHealth {
        let mut healthy = true;

        let handlers = HandlerKind::ALL
            .iter()
            .map(|kind| {
                let registered = self.handlers.contains(*kind);
                healthy &= registered;
                (kind.as_str().to_string(), if registered { "registered" } else { "missing" }.to_string())
            })
            .collect();

        let mut dependencies = BTreeMap::new();
        let store = match self.store.ping().await {
            Ok(()) => "healthy".to_string(),
            Err(failure) => {
                healthy = false;
                format!("unavailable: {failure}")
            }
        };
        dependencies.insert("session_store".to_string(), store);

        if let Some(collaborators) = &self.collaborators {
            for (name, status) in collaborators.health().await {
                let status = match status {
                    Ok(()) => "healthy".to_string(),
                    Err(failure) => {
                        healthy = false;
                        format!("unavailable: {failure}")
                    }
                };
                dependencies.insert(name.to_string(), status);
            }
        }
        let classifier = if self.classifier.uses_llm() { "llm" } else { "rules" };
        dependencies.insert("classifier".to_string(), classifier.to_string());

        SystemHealth {
            orchestrator: if healthy { "healthy" } else { "degraded" }.to_string(),
            handlers,
            dependencies,
        }
    }
}

struct DispatchOutcome {
    last: HandlerKind,
    hops: u8,
    fault: bool,
}
