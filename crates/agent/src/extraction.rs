//! Deterministic extraction over client text: vehicle attributes, policyholder
//! data, confirmations, plan choices and the token helpers the classifier and
//! escalation heuristics share.

use std::collections::BTreeSet;

use autopoliza_core::domain::policy::{
    validate_email, validate_identification, validate_mobile, ClientData,
};
use autopoliza_core::domain::quotation::PlanOffer;
use autopoliza_core::domain::vehicle::{BodyClass, VehicleDraft};

const BRANDS: &[(&str, &str)] = &[
    ("chevrolet", "CHEVROLET"),
    ("chevy", "CHEVROLET"),
    ("toyota", "TOYOTA"),
    ("mazda", "MAZDA"),
    ("renault", "RENAULT"),
    ("kia", "KIA"),
    ("nissan", "NISSAN"),
    ("ford", "FORD"),
    ("hyundai", "HYUNDAI"),
    ("suzuki", "SUZUKI"),
    ("volkswagen", "VOLKSWAGEN"),
    ("vw", "VOLKSWAGEN"),
    ("honda", "HONDA"),
    ("mitsubishi", "MITSUBISHI"),
    ("mercedes", "MERCEDES-BENZ"),
    ("bmw", "BMW"),
    ("audi", "AUDI"),
    ("peugeot", "PEUGEOT"),
    ("citroen", "CITROEN"),
    ("jeep", "JEEP"),
    ("dodge", "DODGE"),
    ("subaru", "SUBARU"),
    ("fiat", "FIAT"),
    ("byd", "BYD"),
    ("chery", "CHERY"),
    ("jac", "JAC"),
    ("volvo", "VOLVO"),
    ("yamaha", "YAMAHA"),
];

/// Model lines recognised without a brand; the brand is inferred from the line.
const LINES: &[(&str, &str, &str)] = &[
    ("corolla", "COROLLA", "TOYOTA"),
    ("hilux", "HILUX", "TOYOTA"),
    ("fortuner", "FORTUNER", "TOYOTA"),
    ("prado", "PRADO", "TOYOTA"),
    ("spark", "SPARK GT", "CHEVROLET"),
    ("onix", "ONIX", "CHEVROLET"),
    ("sail", "SAIL", "CHEVROLET"),
    ("tracker", "TRACKER", "CHEVROLET"),
    ("sandero", "SANDERO", "RENAULT"),
    ("duster", "DUSTER", "RENAULT"),
    ("logan", "LOGAN", "RENAULT"),
    ("picanto", "PICANTO", "KIA"),
    ("sportage", "SPORTAGE", "KIA"),
    ("frontier", "FRONTIER", "NISSAN"),
    ("versa", "VERSA", "NISSAN"),
    ("escape", "ESCAPE", "FORD"),
    ("ranger", "RANGER", "FORD"),
    ("tucson", "TUCSON", "HYUNDAI"),
    ("h1", "H1", "HYUNDAI"),
    ("swift", "SWIFT", "SUZUKI"),
    ("gol", "GOL", "VOLKSWAGEN"),
    ("nmax", "NMAX", "YAMAHA"),
    ("cx", "CX-5", "MAZDA"),
];

const BODY_CLASSES: &[(&str, BodyClass)] = &[
    ("sedan", BodyClass::Automovil),
    ("automovil", BodyClass::Automovil),
    ("auto", BodyClass::Automovil),
    ("carro", BodyClass::Automovil),
    ("hatchback", BodyClass::Automovil),
    ("coupe", BodyClass::Automovil),
    ("camioneta", BodyClass::Camioneta),
    ("suv", BodyClass::Camioneta),
    ("pickup", BodyClass::PickupDobleCabina),
    ("platon", BodyClass::PickupDobleCabina),
    ("moto", BodyClass::Motocicleta),
    ("motocicleta", BodyClass::Motocicleta),
    ("campero", BodyClass::Campero),
    ("4x4", BodyClass::Campero),
    ("van", BodyClass::CamionetaPasajeros),
    ("buseta", BodyClass::CamionetaPasajeros),
    ("pasajeros", BodyClass::CamionetaPasajeros),
];

const COLORS: &[&str] = &[
    "rojo", "blanco", "negro", "gris", "azul", "plata", "plateado", "verde", "amarillo", "beige",
    "vinotinto", "naranja", "cafe",
];

const DONT_KNOW: &[&str] = &[
    "no se",
    "no lo se",
    "no sabria",
    "ni idea",
    "no tengo idea",
    "no recuerdo",
    "no estoy seguro",
    "no estoy segura",
    "desconozco",
];

const AFFIRMATIVE: &[&str] = &[
    "si",
    "claro",
    "confirmo",
    "acepto",
    "correcto",
    "dale",
    "listo",
    "ok",
    "okay",
    "afirmativo",
    "de acuerdo",
    "esta bien",
    "adelante",
    "procede",
    "proceder",
    "perfecto",
    "hagale",
];

const NEGATIVE: &[&str] =
    &["no", "negativo", "incorrecto", "cancelar", "corregir", "cambiar", "espera", "todavia no"];

const GREETING_VOCABULARY: &[&str] = &[
    "hola", "buenas", "buenos", "buen", "dia", "dias", "tardes", "noches", "hey", "saludos",
    "gracias", "muchas", "ok", "vale", "listo", "perfecto", "chao", "adios", "que", "tal", "como",
    "estas", "hello", "hi",
];

const IDENTIFICATION_CONTEXT: &[&str] =
    &["cedula", "identificacion", "documento", "cc", "nit", "id"];
const MOBILE_CONTEXT: &[&str] = &["celular", "telefono", "movil", "cel", "whatsapp", "numero"];

/// Lowercases and strips Spanish diacritics so keyword matching ignores accents.
pub fn normalize_text(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|character| match character {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

/// Normalized alphanumeric tokens. Digit groups split by `.` or `-` are joined.
pub fn tokenize(text: &str) -> Vec<String> {
    let normalized = normalize_text(text);
    let characters: Vec<char> = normalized.chars().collect();
    let mut sanitized = String::with_capacity(normalized.len());
    for (index, character) in characters.iter().enumerate() {
        let joins_digits = matches!(character, '.' | '-')
            && index > 0
            && characters[index - 1].is_ascii_digit()
            && characters.get(index + 1).map(char::is_ascii_digit).unwrap_or(false);
        if joins_digits {
            continue;
        }
        if character.is_alphanumeric() {
            sanitized.push(*character);
        } else {
            sanitized.push(' ');
        }
    }
    sanitized.split_whitespace().map(str::to_string).collect()
}

pub fn token_set(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

/// Token-set Jaccard similarity. Two empty sets are not similar.
pub fn jaccard(left: &BTreeSet<String>, right: &BTreeSet<String>) -> f64 {
    let union = left.union(right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(right).count() as f64 / union as f64
}

/// Whether `phrase` occurs as a contiguous run of whole tokens.
pub fn contains_phrase(tokens: &[String], phrase: &str) -> bool {
    let needle = tokenize(phrase);
    if needle.is_empty() || needle.len() > tokens.len() {
        return false;
    }
    tokens.windows(needle.len()).any(|window| window == needle.as_slice())
}

pub fn mentions_any(tokens: &[String], phrases: &[&str]) -> bool {
    phrases.iter().any(|phrase| contains_phrase(tokens, phrase))
}

/// Vehicle attributes mentioned in `text`. Unmentioned fields stay `None`.
pub fn extract_vehicle(text: &str) -> VehicleDraft {
    let tokens = tokenize(text);
    let mut draft = VehicleDraft::default();

    for token in &tokens {
        if draft.brand.is_none() {
            if let Some((_, brand)) = BRANDS.iter().find(|(alias, _)| *alias == token.as_str()) {
                draft.brand = Some((*brand).to_string());
            }
        }
        if draft.line.is_none() {
            if let Some((_, line, brand)) = LINES.iter().find(|(alias, _, _)| *alias == token.as_str()) {
                draft.line = Some((*line).to_string());
                if draft.brand.is_none() {
                    draft.brand = Some((*brand).to_string());
                }
            }
        }
        if draft.model_year.is_none() && token.len() == 4 {
            if let Ok(year) = token.parse::<u16>() {
                if (1980..=2030).contains(&year) {
                    draft.model_year = Some(year);
                }
            }
        }
        if draft.body_class.is_none() {
            if let Some((_, body_class)) = BODY_CLASSES.iter().find(|(word, _)| *word == token.as_str()) {
                draft.body_class = Some(*body_class);
            }
        }
        if draft.color.is_none() && COLORS.contains(&token.as_str()) {
            let color = if token == "plateado" { "plata" } else { token.as_str() };
            draft.color = Some(color.to_ascii_uppercase());
        }
    }

    if draft.body_class.is_none() && contains_phrase(&tokens, "pick up") {
        draft.body_class = Some(BodyClass::PickupDobleCabina);
    }
    draft
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractedClientData {
    /// Only values that passed field validation.
    pub data: ClientData,
    /// Fields the client attempted to give with an invalid value.
    pub rejected: Vec<&'static str>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClientField {
    Identification,
    Mobile,
}

/// Policyholder fields in `text`. Context words decide what a number is; without
/// one, ten digits starting with 3 read as a mobile and 6 to 12 digits as an id.
pub fn extract_client_data(text: &str) -> ExtractedClientData {
    let mut extracted = ExtractedClientData::default();

    for raw in text.split_whitespace() {
        if !raw.contains('@') {
            continue;
        }
        let candidate = raw
            .trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '(' | ')' | '<' | '>' | '"' | '\''))
            .trim_end_matches('.')
            .to_lowercase();
        if validate_email(&candidate).is_ok() {
            extracted.data.email.get_or_insert(candidate);
        } else if !extracted.rejected.contains(&"email") {
            extracted.rejected.push("email");
        }
    }

    // Digits inside an email address are never an identification or a mobile.
    let without_emails: Vec<&str> = text.split_whitespace().filter(|word| !word.contains('@')).collect();
    let tokens = tokenize(&without_emails.join(" "));
    let mut pending: Option<ClientField> = None;
    for token in &tokens {
        if IDENTIFICATION_CONTEXT.contains(&token.as_str()) {
            pending = Some(ClientField::Identification);
            continue;
        }
        if MOBILE_CONTEXT.contains(&token.as_str()) {
            pending = Some(ClientField::Mobile);
            continue;
        }
        if !token.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }

        match pending.take() {
            Some(ClientField::Mobile) => {
                if validate_mobile(token).is_ok() {
                    extracted.data.mobile = Some(token.clone());
                } else {
                    extracted.rejected.push("mobile");
                }
            }
            Some(ClientField::Identification) => {
                if validate_identification(token).is_ok() {
                    extracted.data.identification = Some(token.clone());
                } else {
                    extracted.rejected.push("identification");
                }
            }
            None => {
                if token.len() == 10 && token.starts_with('3') && extracted.data.mobile.is_none() {
                    extracted.data.mobile = Some(token.clone());
                } else if validate_identification(token).is_ok()
                    && extracted.data.identification.is_none()
                {
                    extracted.data.identification = Some(token.clone());
                }
            }
        }
    }

    extracted
}

/// Client says they do not know the requested details.
pub fn detect_dont_know(text: &str) -> bool {
    mentions_any(&tokenize(text), DONT_KNOW)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Confirmation {
    Affirmative,
    Negative,
    Ambiguous,
}

pub fn parse_confirmation(text: &str) -> Confirmation {
    let tokens = tokenize(text);
    let affirmative = mentions_any(&tokens, AFFIRMATIVE);
    let negative = mentions_any(&tokens, NEGATIVE);
    match (affirmative, negative) {
        (true, false) => Confirmation::Affirmative,
        (false, true) => Confirmation::Negative,
        _ => Confirmation::Ambiguous,
    }
}

fn ordinal_index(token: &str, plan_count: usize) -> Option<usize> {
    match token {
        "1" | "uno" | "primero" | "primer" | "primera" => Some(0),
        "2" | "dos" | "segundo" | "segunda" => Some(1),
        "3" | "tres" | "tercero" | "tercer" | "tercera" => Some(2),
        "ultimo" | "ultima" => plan_count.checked_sub(1),
        _ => None,
    }
}

/// Plan named by ordinal position, then by literal plan name, then by family keyword.
pub fn select_plan(text: &str, plans: &[PlanOffer]) -> Option<String> {
    let tokens = tokenize(text);

    if let Some(index) =
        tokens.iter().find_map(|token| ordinal_index(token, plans.len())).filter(|index| *index < plans.len())
    {
        return Some(plans[index].name.clone());
    }

    let normalized = tokens.join(" ");
    let mut by_length: Vec<&PlanOffer> = plans.iter().collect();
    by_length.sort_by_key(|plan| std::cmp::Reverse(plan.name.len()));
    if let Some(plan) =
        by_length.iter().find(|plan| normalized.contains(&tokenize(&plan.name).join(" ")))
    {
        return Some(plan.name.clone());
    }

    plans
        .iter()
        .find(|plan| {
            tokenize(&plan.name)
                .last()
                .map(|family| tokens.contains(family))
                .unwrap_or(false)
        })
        .map(|plan| plan.name.clone())
}

/// Bare greeting or acknowledgment of at most three tokens.
pub fn is_greeting(text: &str) -> bool {
    let tokens = tokenize(text);
    !tokens.is_empty()
        && tokens.len() <= 3
        && tokens.iter().all(|token| GREETING_VOCABULARY.contains(&token.as_str()))
}
