//! Conversational runtime for motor-insurance sales.
//!
//! This crate turns a client's message into the next step of a conversation:
//! - Classifies intent (LLM when configured, keyword rules otherwise)
//! - Routes the turn to one of four handlers: consultation, quotation,
//!   issuance and escalation to a human advisor
//! - Calls out to retrieval, pricing and issuance collaborators with bounded timeouts
//! - Persists the turn through a [`autopoliza_db::SessionStore`] in one commit
//!
//! # Architecture
//!
//! 1. **Rehydration** (`orchestrator`) - history and handler blobs become a typed `TurnState`
//! 2. **Routing** (`orchestrator`, `classifier`) - escalation override, explicit hand-off,
//!    active flow, classifier, fallback
//! 3. **Handling** (`handlers`) - each handler advances its own state machine
//! 4. **Commit** - messages, touched handler records and artifacts are written together
//!
//! # Safety Principle
//!
//! The LLM only classifies. Prices come from the pricing engine and policies
//! from the issuance backend; a failed or ambiguous submission is never retried
//! automatically and always reaches a human advisor.

pub mod classifier;
pub mod collaborators;
pub mod extraction;
pub mod handlers;
pub mod llm;
pub mod orchestrator;
pub mod runtime;

#[cfg(test)]
mod test_support;

pub use orchestrator::{
    ContextSummary, Orchestrator, OrchestratorError, SessionStatus, SystemHealth, TurnRequest,
    TurnResponse,
};
pub use runtime::{AgentRuntime, TracingAuditSink};
