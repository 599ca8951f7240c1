pub mod escalation;
pub mod policy;
pub mod quotation;
pub mod session;
pub mod vehicle;
