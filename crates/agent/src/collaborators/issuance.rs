use async_trait::async_trait;
use rand::Rng;
use tracing::info;

use autopoliza_core::domain::policy::{
    validate_email, validate_identification, validate_mobile, PolicyNumber,
};

use super::{CollaboratorError, IssuanceBackend, IssuanceOutcome, IssuanceRequest};

/// Issues policies locally with random 10-digit policy numbers.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalIssuanceBackend;

impl LocalIssuanceBackend {
    fn policy_number() -> PolicyNumber {
        let number: u64 = rand::thread_rng().gen_range(1_000_000_000..=9_999_999_999);
        PolicyNumber(number.to_string())
    }
}

#[async_trait]
impl IssuanceBackend for LocalIssuanceBackend {
    fn name(&self) -> &'static str {
        "local_issuance"
    }

    async fn issue(&self, request: &IssuanceRequest) -> Result<IssuanceOutcome, CollaboratorError> {
        let checks = [
            validate_identification(&request.identification),
            validate_mobile(&request.mobile),
            validate_email(&request.email),
        ];
        if let Some(Err(error)) = checks.into_iter().find(Result::is_err) {
            return Ok(IssuanceOutcome::Rejected { error: error.to_string() });
        }

        let policy_number = Self::policy_number();
        info!(
            event_name = "collaborator.issuance.issued",
            backend = self.name(),
            policy_number = %policy_number.0,
            plan = %request.plan_name,
            "policy issued"
        );
        Ok(IssuanceOutcome::Issued { policy_number })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::LocalIssuanceBackend;
    use crate::collaborators::{IssuanceBackend, IssuanceOutcome, IssuanceRequest};

    fn request(mobile: &str) -> IssuanceRequest {
        IssuanceRequest {
            identification: "1020304050".to_string(),
            mobile: mobile.to_string(),
            email: "ana@correo.co".to_string(),
            brand: "TOYOTA".to_string(),
            model_year: "2020".to_string(),
            line: "COROLLA".to_string(),
            body_class: "AUTOMOVIL".to_string(),
            color: String::new(),
            plan_name: "Plan Basico".to_string(),
            annual_premium: Decimal::new(1_950_000, 0),
            monthly_premium: Decimal::new(162_500, 0),
        }
    }

    #[tokio::test]
    async fn valid_request_gets_ten_digit_policy_number() {
        let outcome = LocalIssuanceBackend.issue(&request("3001234567")).await.expect("issue");
        match outcome {
            IssuanceOutcome::Issued { policy_number } => {
                assert_eq!(policy_number.0.len(), 10);
                assert!(policy_number.0.chars().all(|c| c.is_ascii_digit()));
            }
            other => panic!("expected issued policy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_holder_data_is_rejected_with_reason() {
        let outcome = LocalIssuanceBackend.issue(&request("12345")).await.expect("issue");
        assert!(matches!(
            outcome,
            IssuanceOutcome::Rejected { ref error } if error.contains("mobile")
        ));
    }
}
