pub mod audit;
pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod flows;

pub use context::{ConversationContext, TurnArtifact, TurnFlags, TurnState};
pub use domain::escalation::{CaseSummary, EscalationReason};
pub use domain::policy::{ClientData, Policy, PolicyNumber};
pub use domain::quotation::{PlanOffer, Quotation, QuotationId};
pub use domain::session::{
    ControlMode, HandlerKind, Message, MessageRole, ParticipantKind, Session, SessionId,
};
pub use domain::vehicle::{BodyClass, VehicleDetails, VehicleDraft};
pub use errors::{ApplicationError, DomainError, InterfaceError};
