use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use autopoliza_core::domain::policy::{Policy, PolicyNumber};
use autopoliza_core::domain::quotation::Quotation;
use autopoliza_core::domain::session::{ControlMode, HandlerKind, Message, Session, SessionId};

pub mod memory;
pub mod session;

pub use memory::InMemorySessionStore;
pub use session::SqlSessionStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Everything a successful turn writes, applied as one unit.
///
/// The session row is upserted, so the first turn of a conversation creates it.
#[derive(Clone, Debug)]
pub struct TurnCommit {
    pub session: Session,
    pub messages: Vec<Message>,
    pub handler_states: Vec<(String, Value)>,
    pub quotations: Vec<Quotation>,
    pub policies: Vec<Policy>,
}

impl TurnCommit {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            messages: Vec::new(),
            handler_states: Vec::new(),
            quotations: Vec::new(),
            policies: Vec::new(),
        }
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Creates the session unless one with the same id already exists.
    async fn create_session(&self, session: Session) -> Result<(), RepositoryError>;

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError>;

    async fn list_sessions(
        &self,
        control_mode: Option<ControlMode>,
    ) -> Result<Vec<Session>, RepositoryError>;

    async fn set_control_mode(
        &self,
        id: &SessionId,
        mode: ControlMode,
    ) -> Result<(), RepositoryError>;

    async fn set_current_handler(
        &self,
        id: &SessionId,
        handler: Option<HandlerKind>,
    ) -> Result<(), RepositoryError>;

    async fn append_message(&self, message: Message) -> Result<(), RepositoryError>;

    /// Messages in append order. With a limit, the most recent `limit` messages.
    async fn get_history(
        &self,
        id: &SessionId,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, RepositoryError>;

    async fn count_messages(&self, id: &SessionId) -> Result<usize, RepositoryError>;

    async fn save_handler_state(
        &self,
        id: &SessionId,
        handler: &str,
        blob: Value,
    ) -> Result<(), RepositoryError>;

    async fn get_handler_state(
        &self,
        id: &SessionId,
        handler: &str,
    ) -> Result<Option<Value>, RepositoryError>;

    /// Every persisted `(handler, blob)` pair for the session.
    async fn get_handler_states(
        &self,
        id: &SessionId,
    ) -> Result<Vec<(String, Value)>, RepositoryError>;

    async fn save_quotation(&self, quotation: Quotation) -> Result<(), RepositoryError>;

    async fn latest_quotation(&self, id: &SessionId)
        -> Result<Option<Quotation>, RepositoryError>;

    async fn save_policy(&self, policy: Policy) -> Result<(), RepositoryError>;

    async fn find_policy(&self, number: &PolicyNumber) -> Result<Option<Policy>, RepositoryError>;

    /// Applies every write of one turn atomically.
    async fn commit_turn(&self, commit: TurnCommit) -> Result<(), RepositoryError>;

    async fn ping(&self) -> Result<(), RepositoryError>;
}
