use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use autopoliza_core::domain::quotation::PlanOffer;
use autopoliza_core::domain::vehicle::{BodyClass, VehicleDetails};

use super::{CollaboratorError, PricingEngine};
use crate::extraction::{normalize_text, token_set};

const BACKEND: &str = "catalog";
const BUNDLED_CATALOG: &str = include_str!("../../data/vehicle_catalog.toml");

/// Plan names and rates over insured value, in presentation order.
pub fn plan_rates() -> [(&'static str, Decimal); 3] {
    [
        ("Plan Basico", Decimal::new(25, 3)),
        ("Plan Autos Clasico", Decimal::new(35, 3)),
        ("Plan Autos Global", Decimal::new(45, 3)),
    ]
}

/// Annual and monthly premiums for every plan. Red vehicles carry a 10% surcharge.
pub fn plan_offers(insured_value: Decimal, red: bool) -> Vec<PlanOffer> {
    let surcharge = if red { Decimal::new(11, 1) } else { Decimal::ONE };
    plan_rates()
        .into_iter()
        .map(|(name, rate)| {
            let annual_premium = (insured_value * rate * surcharge).round_dp(2);
            let monthly_premium = (annual_premium / Decimal::from(12)).round_dp(2);
            PlanOffer { name: name.to_string(), annual_premium, monthly_premium }
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub brand: String,
    pub model_year: u16,
    pub line: String,
    pub body_class: BodyClass,
    pub insured_value: Decimal,
}

impl CatalogEntry {
    fn to_details(&self, color: Option<String>) -> VehicleDetails {
        VehicleDetails {
            brand: self.brand.clone(),
            body_class: self.body_class,
            model_year: Some(self.model_year),
            line: Some(self.line.clone()),
            color,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "vehicle")]
    vehicles: Vec<CatalogEntry>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("could not read vehicle catalog `{path}`: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("could not parse vehicle catalog `{path}`: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("vehicle catalog `{0}` lists no vehicles")]
    Empty(PathBuf),
}

/// Deterministic pricing over a fixed vehicle catalog.
#[derive(Clone, Debug)]
pub struct CatalogPricingEngine {
    entries: Vec<CatalogEntry>,
}

impl CatalogPricingEngine {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    /// The catalog compiled into the binary.
    pub fn bundled() -> Result<Self, CatalogError> {
        parse_catalog(BUNDLED_CATALOG, Path::new("<bundled>"))
    }

    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| CatalogError::Read { path: path.to_path_buf(), source })?;
        parse_catalog(&raw, path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First catalog entry matching brand and body class, plus year and line when given.
    pub fn find(&self, vehicle: &VehicleDetails) -> Option<&CatalogEntry> {
        self.entries.iter().find(|entry| matches_vehicle(entry, vehicle))
    }

    fn nearest(&self, vehicle: &VehicleDetails, limit: usize) -> Vec<VehicleDetails> {
        let requested_line = vehicle.line.as_deref().map(token_set).unwrap_or_default();
        let mut candidates: Vec<(u8, u16, &CatalogEntry)> = self
            .entries
            .iter()
            .filter(|entry| same_brand(entry, vehicle) && !matches_vehicle(entry, vehicle))
            .filter_map(|entry| {
                let shares_line = !requested_line.is_empty()
                    && !token_set(&entry.line).is_disjoint(&requested_line);
                let same_class = entry.body_class == vehicle.body_class;
                let rank = match (shares_line, same_class) {
                    (true, true) => 0,
                    (true, false) => 1,
                    (false, true) => 2,
                    (false, false) => return None,
                };
                let distance =
                    vehicle.model_year.map(|year| year.abs_diff(entry.model_year)).unwrap_or(0);
                Some((rank, distance, entry))
            })
            .collect();
        candidates.sort_by_key(|(rank, distance, _)| (*rank, *distance));

        candidates
            .into_iter()
            .take(limit)
            .map(|(_, _, entry)| entry.to_details(vehicle.color.clone()))
            .collect()
    }
}

fn parse_catalog(raw: &str, path: &Path) -> Result<CatalogPricingEngine, CatalogError> {
    let file: CatalogFile = toml::from_str(raw)
        .map_err(|source| CatalogError::Parse { path: path.to_path_buf(), source })?;
    if file.vehicles.is_empty() {
        return Err(CatalogError::Empty(path.to_path_buf()));
    }
    Ok(CatalogPricingEngine::new(file.vehicles))
}

fn same_brand(entry: &CatalogEntry, vehicle: &VehicleDetails) -> bool {
    normalize_text(&entry.brand) == normalize_text(&vehicle.brand)
}

fn matches_vehicle(entry: &CatalogEntry, vehicle: &VehicleDetails) -> bool {
    same_brand(entry, vehicle)
        && entry.body_class == vehicle.body_class
        && vehicle.model_year.map(|year| year == entry.model_year).unwrap_or(true)
        && vehicle.line.as_deref().map(|line| line_matches(&entry.line, line)).unwrap_or(true)
}

fn line_matches(catalog_line: &str, requested: &str) -> bool {
    let catalog_line = normalize_text(catalog_line);
    let requested = normalize_text(requested);
    catalog_line == requested
        || catalog_line.contains(requested.as_str())
        || requested.contains(catalog_line.as_str())
}

#[async_trait]
impl PricingEngine for CatalogPricingEngine {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn validate(&self, vehicle: &VehicleDetails) -> Result<bool, CollaboratorError> {
        Ok(self.find(vehicle).is_some())
    }

    async fn quote(&self, vehicle: &VehicleDetails) -> Result<Vec<PlanOffer>, CollaboratorError> {
        let entry = self.find(vehicle).ok_or_else(|| CollaboratorError::Rejected {
            backend: BACKEND,
            detail: format!("{} is not in the catalog", vehicle.describe()),
        })?;
        Ok(plan_offers(entry.insured_value, vehicle.is_red()))
    }

    async fn alternatives(
        &self,
        vehicle: &VehicleDetails,
        limit: usize,
    ) -> Result<Vec<VehicleDetails>, CollaboratorError> {
        Ok(self.nearest(vehicle, limit))
    }
}
