use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::quotation::QuotationId;
use crate::domain::session::SessionId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyNumber(pub String);

/// Policyholder fields collected across turns.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientData {
    pub identification: Option<String>,
    pub mobile: Option<String>,
    pub email: Option<String>,
}

impl ClientData {
    /// Merges newly collected fields. Fields missing from `update` are kept.
    pub fn absorb(&mut self, update: ClientData) {
        if update.identification.is_some() {
            self.identification = update.identification;
        }
        if update.mobile.is_some() {
            self.mobile = update.mobile;
        }
        if update.email.is_some() {
            self.email = update.email;
        }
    }

    pub fn known_fields(&self) -> Vec<&'static str> {
        let mut known = Vec::new();
        if self.identification.is_some() {
            known.push("identification");
        }
        if self.mobile.is_some() {
            known.push("mobile");
        }
        if self.email.is_some() {
            known.push("email");
        }
        known
    }

    pub fn missing_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.identification.is_none() {
            missing.push("identification".to_string());
        }
        if self.mobile.is_none() {
            missing.push("mobile".to_string());
        }
        if self.email.is_none() {
            missing.push("email".to_string());
        }
        missing
    }

    pub fn is_empty(&self) -> bool {
        self.known_fields().is_empty()
    }

    /// Returns a validated policyholder once every field is present and valid.
    pub fn complete(&self) -> Result<Policyholder, DomainError> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(DomainError::InvariantViolation(format!(
                "client data incomplete: missing {}",
                missing.join(", ")
            )));
        }

        let identification = self.identification.clone().unwrap_or_default();
        let mobile = self.mobile.clone().unwrap_or_default();
        let email = self.email.clone().unwrap_or_default();
        validate_identification(&identification)?;
        validate_mobile(&mobile)?;
        validate_email(&email)?;

        Ok(Policyholder { identification, mobile, email })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policyholder {
    pub identification: String,
    pub mobile: String,
    pub email: String,
}

pub fn validate_identification(value: &str) -> Result<(), DomainError> {
    let valid = (6..=12).contains(&value.len()) && value.chars().all(|c| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(DomainError::InvalidValue { field: "identification", value: value.to_string() })
    }
}

pub fn validate_mobile(value: &str) -> Result<(), DomainError> {
    let valid = value.len() == 10 && value.chars().all(|c| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(DomainError::InvalidValue { field: "mobile", value: value.to_string() })
    }
}

pub fn validate_email(value: &str) -> Result<(), DomainError> {
    let invalid = || DomainError::InvalidValue { field: "email", value: value.to_string() };

    let (local, domain) = value.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') || value.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    let domain_has_dot_segment = domain
        .split_once('.')
        .map(|(head, tail)| !head.is_empty() && !tail.is_empty() && !tail.ends_with('.'))
        .unwrap_or(false);
    if domain_has_dot_segment {
        Ok(())
    } else {
        Err(invalid())
    }
}

/// An issued policy. Created once per successful issuance call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub policy_number: PolicyNumber,
    pub session_id: SessionId,
    pub client: Policyholder,
    pub quotation_ref: QuotationId,
    pub plan_name: String,
    pub annual_premium: Decimal,
    pub monthly_premium: Decimal,
    pub issued_at: DateTime<Utc>,
}
