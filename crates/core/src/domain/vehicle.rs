use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Catalog body classes. Labels match the insurer catalog spelling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BodyClass {
    #[serde(rename = "AUTOMOVIL")]
    Automovil,
    #[serde(rename = "CAMIONETA")]
    Camioneta,
    #[serde(rename = "CAMIONETA PASAJ.")]
    CamionetaPasajeros,
    #[serde(rename = "PICKUP DOBLE CAB")]
    PickupDobleCabina,
    #[serde(rename = "MOTOCICLETA")]
    Motocicleta,
    #[serde(rename = "CAMPERO")]
    Campero,
}

impl BodyClass {
    pub fn label(self) -> &'static str {
        match self {
            Self::Automovil => "AUTOMOVIL",
            Self::Camioneta => "CAMIONETA",
            Self::CamionetaPasajeros => "CAMIONETA PASAJ.",
            Self::PickupDobleCabina => "PICKUP DOBLE CAB",
            Self::Motocicleta => "MOTOCICLETA",
            Self::Campero => "CAMPERO",
        }
    }
}

impl fmt::Display for BodyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for BodyClass {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "AUTOMOVIL" | "AUTOMÓVIL" => Ok(Self::Automovil),
            "CAMIONETA" => Ok(Self::Camioneta),
            "CAMIONETA PASAJ." | "CAMIONETA PASAJEROS" => Ok(Self::CamionetaPasajeros),
            "PICKUP DOBLE CAB" | "PICKUP" => Ok(Self::PickupDobleCabina),
            "MOTOCICLETA" => Ok(Self::Motocicleta),
            "CAMPERO" => Ok(Self::Campero),
            other => {
                Err(DomainError::InvalidValue { field: "body_class", value: other.to_string() })
            }
        }
    }
}

/// Vehicle attributes gathered so far. Every field is optional until the
/// quotation flow resolves the required ones.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleDraft {
    pub brand: Option<String>,
    pub model_year: Option<u16>,
    pub line: Option<String>,
    pub body_class: Option<BodyClass>,
    pub color: Option<String>,
}

impl VehicleDraft {
    pub fn is_empty(&self) -> bool {
        self.brand.is_none()
            && self.model_year.is_none()
            && self.line.is_none()
            && self.body_class.is_none()
            && self.color.is_none()
    }

    pub fn missing_required(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.brand.is_none() {
            missing.push("brand".to_string());
        }
        if self.body_class.is_none() {
            missing.push("body_class".to_string());
        }
        missing
    }

    /// Overlays every field present in `update`. Absent fields never clear known ones.
    pub fn absorb(&mut self, update: VehicleDraft) -> bool {
        let before = self.clone();
        if update.brand.is_some() {
            self.brand = update.brand;
        }
        if update.model_year.is_some() {
            self.model_year = update.model_year;
        }
        if update.line.is_some() {
            self.line = update.line;
        }
        if update.body_class.is_some() {
            self.body_class = update.body_class;
        }
        if update.color.is_some() {
            self.color = update.color;
        }
        *self != before
    }

    /// Returns resolved details once brand and body class are known.
    pub fn resolve(&self) -> Option<VehicleDetails> {
        Some(VehicleDetails {
            brand: self.brand.clone()?,
            body_class: self.body_class?,
            model_year: self.model_year,
            line: self.line.clone(),
            color: self.color.clone(),
        })
    }
}

impl From<&VehicleDetails> for VehicleDraft {
    fn from(value: &VehicleDetails) -> Self {
        Self {
            brand: Some(value.brand.clone()),
            model_year: value.model_year,
            line: value.line.clone(),
            body_class: Some(value.body_class),
            color: value.color.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleDetails {
    pub brand: String,
    pub body_class: BodyClass,
    pub model_year: Option<u16>,
    pub line: Option<String>,
    pub color: Option<String>,
}

impl VehicleDetails {
    pub fn is_red(&self) -> bool {
        self.color.as_deref().map(|color| color.trim().eq_ignore_ascii_case("rojo")).unwrap_or(false)
    }

    pub fn describe(&self) -> String {
        let mut parts = vec![self.brand.clone()];
        if let Some(line) = &self.line {
            parts.push(line.clone());
        }
        if let Some(year) = self.model_year {
            parts.push(year.to_string());
        }
        parts.push(format!("({})", self.body_class.label()));
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::{BodyClass, VehicleDraft};

    #[test]
    fn absorb_keeps_known_fields_when_update_is_partial() {
        let mut draft = VehicleDraft {
            brand: Some("TOYOTA".to_string()),
            model_year: Some(2020),
            ..VehicleDraft::default()
        };

        let changed = draft.absorb(VehicleDraft {
            body_class: Some(BodyClass::Automovil),
            ..VehicleDraft::default()
        });

        assert!(changed);
        assert_eq!(draft.brand.as_deref(), Some("TOYOTA"));
        assert_eq!(draft.model_year, Some(2020));
        assert!(draft.missing_required().is_empty());
    }

    #[test]
    fn resolve_requires_brand_and_body_class() {
        let draft = VehicleDraft { brand: Some("MAZDA".to_string()), ..VehicleDraft::default() };
        assert!(draft.resolve().is_none());
        assert_eq!(draft.missing_required(), vec!["body_class".to_string()]);
    }

    #[test]
    fn body_class_labels_parse_back() {
        assert_eq!("pickup doble cab".parse::<BodyClass>().expect("parse"), BodyClass::PickupDobleCabina);
        assert_eq!(BodyClass::CamionetaPasajeros.label(), "CAMIONETA PASAJ.");
        assert!("tractor".parse::<BodyClass>().is_err());
    }
}
