use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    Client,
    Advisor,
}

impl ParticipantKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Advisor => "advisor",
        }
    }
}

impl FromStr for ParticipantKind {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "advisor" => Ok(Self::Advisor),
            other => Err(DomainError::InvalidValue {
                field: "participant_kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Who is currently allowed to answer the client.
///
/// Automated handling escalates into `Transferred`, an advisor posting into the
/// session moves it to `HumanActive`, and closing or handing the case back
/// returns it to `Automated`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Automated,
    Transferred,
    HumanActive,
}

impl ControlMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Automated => "automated",
            Self::Transferred => "transferred",
            Self::HumanActive => "human_active",
        }
    }

    pub fn can_transition_to(self, next: ControlMode) -> bool {
        use ControlMode::{Automated, HumanActive, Transferred};

        matches!(
            (self, next),
            (Automated, Automated)
                | (Automated, Transferred)
                | (Automated, HumanActive)
                | (Transferred, Transferred)
                | (Transferred, HumanActive)
                | (Transferred, Automated)
                | (HumanActive, HumanActive)
                | (HumanActive, Automated)
        )
    }

    pub fn transition_to(self, next: ControlMode) -> Result<ControlMode, DomainError> {
        if self.can_transition_to(next) {
            return Ok(next);
        }

        Err(DomainError::InvalidControlModeTransition { from: self, to: next })
    }
}

impl FromStr for ControlMode {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "automated" | "active" => Ok(Self::Automated),
            "transferred" => Ok(Self::Transferred),
            "human_active" => Ok(Self::HumanActive),
            other => {
                Err(DomainError::InvalidValue { field: "control_mode", value: other.to_string() })
            }
        }
    }
}

/// The four task handlers a turn can be routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Consultation,
    Quotation,
    Issuance,
    Escalation,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 4] =
        [HandlerKind::Consultation, HandlerKind::Quotation, HandlerKind::Issuance, HandlerKind::Escalation];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consultation => "consultation",
            Self::Quotation => "quotation",
            Self::Issuance => "issuance",
            Self::Escalation => "escalation",
        }
    }

    /// Handlers that may receive a same-turn hand-off.
    pub fn is_continuable(self) -> bool {
        !matches!(self, Self::Escalation)
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerKind {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "consultation" => Ok(Self::Consultation),
            "quotation" => Ok(Self::Quotation),
            "issuance" => Ok(Self::Issuance),
            "escalation" => Ok(Self::Escalation),
            other => Err(DomainError::InvalidValue { field: "handler", value: other.to_string() }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub participant_kind: ParticipantKind,
    pub control_mode: ControlMode,
    pub current_handler: Option<HandlerKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, participant_kind: ParticipantKind) -> Self {
        let now = Utc::now();
        Self {
            id,
            participant_kind,
            control_mode: ControlMode::Automated,
            current_handler: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Name reported for the handler that owns the conversation, `router` before any handler ran.
    pub fn current_handler_name(&self) -> &'static str {
        self.current_handler.map(HandlerKind::as_str).unwrap_or(ROUTER)
    }
}

/// Owner name used for orchestrator-level state and messages produced outside any handler.
pub const ROUTER: &str = "router";
/// Producer recorded on messages posted by a human advisor.
pub const ADVISOR: &str = "advisor";
/// Producer recorded on client messages.
pub const USER: &str = "user";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl FromStr for MessageRole {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(DomainError::InvalidValue { field: "role", value: other.to_string() }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: MessageRole,
    pub content: String,
    pub producing_handler: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Message {
    pub fn new(
        session_id: SessionId,
        role: MessageRole,
        producing_handler: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId(Uuid::new_v4().to_string()),
            session_id,
            role,
            content: content.into(),
            producing_handler: producing_handler.into(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn user(session_id: SessionId, content: impl Into<String>) -> Self {
        Self::new(session_id, MessageRole::User, USER, content)
    }

    pub fn assistant(
        session_id: SessionId,
        producing_handler: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(session_id, MessageRole::Assistant, producing_handler, content)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_user(&self) -> bool {
        self.role == MessageRole::User
    }
}

#[cfg(test)]
mod tests {
    use super::{ControlMode, HandlerKind, Message, MessageRole, ParticipantKind, SessionId};
    use crate::errors::DomainError;

    #[test]
    fn control_mode_follows_escalation_lifecycle() {
        let mode = ControlMode::Automated;
        let mode = mode.transition_to(ControlMode::Transferred).expect("escalation");
        let mode = mode.transition_to(ControlMode::HumanActive).expect("advisor takes over");
        let mode = mode.transition_to(ControlMode::Automated).expect("advisor hands back");
        assert_eq!(mode, ControlMode::Automated);
    }

    #[test]
    fn human_active_session_cannot_be_escalated_again() {
        let error = ControlMode::HumanActive
            .transition_to(ControlMode::Transferred)
            .expect_err("advisor already owns the session");

        assert!(matches!(
            error,
            DomainError::InvalidControlModeTransition {
                from: ControlMode::HumanActive,
                to: ControlMode::Transferred
            }
        ));
    }

    #[test]
    fn legacy_active_status_maps_to_automated() {
        assert_eq!("active".parse::<ControlMode>().expect("parse"), ControlMode::Automated);
        assert_eq!("human_active".parse::<ControlMode>().expect("parse"), ControlMode::HumanActive);
        assert!("paused".parse::<ControlMode>().is_err());
    }

    #[test]
    fn handler_names_round_trip_through_from_str() {
        for kind in HandlerKind::ALL {
            assert_eq!(kind.as_str().parse::<HandlerKind>().expect("parse"), kind);
        }
        assert!(!HandlerKind::Escalation.is_continuable());
        assert!(HandlerKind::Issuance.is_continuable());
        assert_eq!("ADVISOR".parse::<ParticipantKind>().expect("parse"), ParticipantKind::Advisor);
    }

    #[test]
    fn user_messages_are_attributed_to_user() {
        let message = Message::user(SessionId("S-1".to_string()), "hola");
        assert_eq!(message.role, MessageRole::User);
        assert_eq!(message.producing_handler, "user");
        assert!(message.is_user());
    }
}
