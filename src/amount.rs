//! Amount parsing, unit normalization and cross-phase conversion
//!
//! Canonical units are mg for weights and mL for volumes. Both micro-sign
//! code points (U+00B5 and U+03BC) fold to the Greek mu so recipe sheets
//! written on different systems parse identically.

use serde::{Deserialize, Serialize};

use crate::chemical::{Chemical, PhysicalForm, PhysicalState};
use crate::error::{StationError, StationResult};

/// Physical phase of an amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Volume,
    Weight,
}

/// An amount resolved into its canonical unit (mg or mL)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedAmount {
    pub kind: PhaseKind,
    pub value: f64,
}

/// Split `"500 μL"`-style text into the numeric prefix and the unit suffix.
///
/// The suffix keeps its case apart from micro-sign folding; unparsable
/// numeric prefixes yield `0.0`.
pub fn parse_amount(text: &str) -> (f64, String) {
    let mut number = String::new();
    let mut unit = String::new();
    for ch in text.trim().chars() {
        if unit.is_empty() && (ch.is_ascii_digit() || ch == '.') {
            number.push(ch);
        } else if !ch.is_whitespace() {
            unit.push(if ch == '\u{00B5}' { '\u{03BC}' } else { ch });
        }
    }
    let value = number.parse::<f64>().unwrap_or(0.0);
    (value, unit)
}

/// Normalize a value into the canonical unit for its phase.
///
/// Unknown suffixes keep the value unchanged and report `default_unit`.
pub fn normalize(value: f64, unit: &str, kind: PhaseKind, default_unit: &str) -> (f64, String) {
    let folded = unit.trim().replace('\u{00B5}', "\u{03BC}").to_lowercase();
    match kind {
        PhaseKind::Volume => match folded.as_str() {
            "l" => (value * 1000.0, "mL".to_string()),
            "ml" => (value, "mL".to_string()),
            "\u{03BC}l" | "ul" => (value / 1000.0, "mL".to_string()),
            _ => (value, default_unit.to_string()),
        },
        PhaseKind::Weight => match folded.as_str() {
            "kg" => (value * 1.0e6, "mg".to_string()),
            "g" => (value * 1000.0, "mg".to_string()),
            "mg" => (value, "mg".to_string()),
            _ => (value, default_unit.to_string()),
        },
    }
}

/// Convert an amount across phases via density (g/mL).
///
/// Returns 0.0 when density is missing/non-positive or the phases are
/// equal; callers must not use this as an identity conversion.
pub fn convert(from: PhaseKind, to: PhaseKind, value: f64, density: Option<f64>) -> f64 {
    let rho = density.unwrap_or(0.0);
    if rho <= 0.0 {
        return 0.0;
    }
    match (from, to) {
        (PhaseKind::Weight, PhaseKind::Volume) => value / 1000.0 / rho,
        (PhaseKind::Volume, PhaseKind::Weight) => value * rho * 1000.0,
        _ => 0.0,
    }
}

/// Resolve a molar target into a dispensable amount for the given chemical.
///
/// Neat solids weigh out `mmol x MW` mg; neat liquids pipette
/// `mmol x MW / rho / 1000` mL; solutions divide by the mmol/mL content;
/// beads scale the active mass up by the wt% loading.
pub fn resolve_mmol_to_amount(target_mmol: f64, chem: &Chemical) -> StationResult<ResolvedAmount> {
    let mw = chem.molecular_weight.unwrap_or(0.0);
    match chem.form {
        PhysicalForm::Solution => {
            let content = chem.active_content.unwrap_or(0.0);
            if content <= 0.0 {
                return Err(StationError::Validation(format!(
                    "'{}' has no usable active_content (mmol/mL)",
                    chem.name
                )));
            }
            Ok(ResolvedAmount {
                kind: PhaseKind::Volume,
                value: target_mmol / content,
            })
        }
        PhysicalForm::Beads => {
            let content = chem.active_content.unwrap_or(0.0);
            if mw <= 0.0 {
                return Err(StationError::Validation(format!(
                    "'{}' lacks molecular weight for wt% conversion",
                    chem.name
                )));
            }
            if content <= 0.0 {
                return Err(StationError::Validation(format!(
                    "'{}' has no usable active_content (wt%)",
                    chem.name
                )));
            }
            let active_mass_mg = target_mmol * mw;
            Ok(ResolvedAmount {
                kind: PhaseKind::Weight,
                value: active_mass_mg / (content / 100.0),
            })
        }
        PhysicalForm::Neat | PhysicalForm::Unknown => match chem.state {
            PhysicalState::Solid => {
                if mw <= 0.0 {
                    return Err(StationError::Validation(format!(
                        "'{}' lacks molecular weight for mmol conversion",
                        chem.name
                    )));
                }
                Ok(ResolvedAmount {
                    kind: PhaseKind::Weight,
                    value: target_mmol * mw,
                })
            }
            PhysicalState::Liquid => {
                let rho = chem.density.unwrap_or(0.0);
                if mw <= 0.0 {
                    return Err(StationError::Validation(format!(
                        "'{}' lacks molecular weight for mmol conversion",
                        chem.name
                    )));
                }
                if rho <= 0.0 {
                    return Err(StationError::Validation(format!(
                        "'{}' lacks density for mmol-to-volume conversion",
                        chem.name
                    )));
                }
                Ok(ResolvedAmount {
                    kind: PhaseKind::Volume,
                    value: target_mmol * mw / rho / 1000.0,
                })
            }
            _ => Err(StationError::Validation(format!(
                "'{}' has no physical state usable for dispensing",
                chem.name
            ))),
        },
    }
}
