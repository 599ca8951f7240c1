pub mod engine;
pub mod states;

pub use engine::{FlowDefinition, FlowEngine, FlowTransitionError, IssuanceFlow, QuotationFlow};
pub use states::{
    FlowAction, FlowContext, FlowType, IssuanceEvent, IssuanceStage, QuotationEvent,
    QuotationStage, TransitionOutcome,
};
