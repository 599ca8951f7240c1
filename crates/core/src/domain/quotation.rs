use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::session::SessionId;
use crate::domain::vehicle::VehicleDetails;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotationId(pub String);

impl QuotationId {
    pub fn generate() -> Self {
        Self(format!("COT-{}", Uuid::new_v4().simple()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOffer {
    pub name: String,
    pub annual_premium: Decimal,
    pub monthly_premium: Decimal,
}

/// A priced offer for one vehicle. A changed vehicle produces a new quotation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quotation {
    pub id: QuotationId,
    pub session_id: SessionId,
    pub vehicle: VehicleDetails,
    /// Offers in presentation order; ordinal plan selection refers to this order.
    pub plans: Vec<PlanOffer>,
    pub estimated: bool,
    pub generated_at: DateTime<Utc>,
}

impl Quotation {
    pub fn new(
        session_id: SessionId,
        vehicle: VehicleDetails,
        plans: Vec<PlanOffer>,
        estimated: bool,
    ) -> Self {
        Self {
            id: QuotationId::generate(),
            session_id,
            vehicle,
            plans,
            estimated,
            generated_at: Utc::now(),
        }
    }

    pub fn plan(&self, name: &str) -> Option<&PlanOffer> {
        self.plans.iter().find(|plan| plan.name == name)
    }

    pub fn plan_names(&self) -> Vec<String> {
        self.plans.iter().map(|plan| plan.name.clone()).collect()
    }

    pub fn has_single_plan(&self) -> bool {
        self.plans.len() == 1
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{PlanOffer, Quotation};
    use crate::domain::session::SessionId;
    use crate::domain::vehicle::{BodyClass, VehicleDetails};

    #[test]
    fn plan_lookup_is_by_exact_name() {
        let quotation = Quotation::new(
            SessionId("S-1".to_string()),
            VehicleDetails {
                brand: "TOYOTA".to_string(),
                body_class: BodyClass::Automovil,
                model_year: Some(2020),
                line: None,
                color: None,
            },
            vec![PlanOffer {
                name: "Plan Basico".to_string(),
                annual_premium: Decimal::new(1_500_000, 0),
                monthly_premium: Decimal::new(125_000, 0),
            }],
            false,
        );

        assert!(quotation.plan("Plan Basico").is_some());
        assert!(quotation.plan("plan basico").is_none());
        assert!(quotation.has_single_plan());
        assert!(quotation.id.0.starts_with("COT-"));
    }
}
