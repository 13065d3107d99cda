//! Station inventory model
//!
//! The upper computer reports a flattened resource list where each entry is
//! either a tray body (`ZONE:-1`) or one well (`ZONE:n`). This module
//! aggregates that list into one row per tray position, the shape consumed
//! by the resource analyzer and the discharge planner.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::amount::{self, PhaseKind};
use crate::chemical::PhysicalState;
use crate::constants;
use crate::layout;

/// One occupied well of a tray
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubstanceDetail {
    /// 0-based row-major well index
    pub slot: Option<i64>,
    /// Human-readable well label, "-" when the slot is unknown
    #[serde(default)]
    pub well: String,
    #[serde(default)]
    pub substance: String,
    /// Display amount with unit, e.g. "100mg"
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_weight: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cur_weight: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_weight: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_volume: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cur_volume: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_volume: Option<String>,
}

impl SubstanceDetail {
    /// Pick the first usable amount field and normalize it into mg or mL.
    ///
    /// Field names carry an implicit unit when the value itself has none;
    /// the physical state decides the phase for the bare `value` field.
    pub fn pick_amount(&self, state: PhysicalState) -> Option<(PhaseKind, f64)> {
        let candidates: [(&str, &Option<String>); 6] = [
            ("available_weight", &self.available_weight),
            ("cur_weight", &self.cur_weight),
            ("initial_weight", &self.initial_weight),
            ("available_volume", &self.available_volume),
            ("cur_volume", &self.cur_volume),
            ("initial_volume", &self.initial_volume),
        ];
        for (key, slot) in candidates {
            let Some(raw) = slot else { continue };
            if raw.trim().is_empty() {
                continue;
            }
            let (num, mut unit) = amount::parse_amount(raw);
            if unit.is_empty() {
                unit = if key.contains("weight") { "mg" } else { "mL" }.to_string();
            }
            if let Some(found) = classify_amount(num, &unit, state) {
                return Some(found);
            }
        }
        if !self.value.trim().is_empty() {
            let (num, unit) = amount::parse_amount(&self.value);
            return classify_amount(num, &unit, state);
        }
        None
    }
}

fn classify_amount(value: f64, unit: &str, state: PhysicalState) -> Option<(PhaseKind, f64)> {
    let folded = unit.trim().replace('\u{00B5}', "\u{03BC}").to_lowercase();
    match folded.as_str() {
        "mg" | "g" | "kg" => {
            let (v, _) = amount::normalize(value, unit, PhaseKind::Weight, "mg");
            Some((PhaseKind::Weight, v))
        }
        "ml" | "l" | "\u{03BC}l" | "ul" => {
            let (v, _) = amount::normalize(value, unit, PhaseKind::Volume, "mL");
            Some((PhaseKind::Volume, v))
        }
        _ => match state {
            PhysicalState::Liquid => Some((PhaseKind::Volume, value)),
            PhysicalState::Solid => Some((PhaseKind::Weight, value)),
            _ => None,
        },
    }
}

/// One logical tray position of the station deck
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InventoryRow {
    pub layout_code: String,
    /// Tray resource code reported on the `:-1` entry
    pub resource_type: Option<i64>,
    #[serde(default)]
    pub resource_type_name: String,
    /// Occupied well count (consumables or media)
    pub count: u32,
    #[serde(default)]
    pub substance_details: Vec<SubstanceDetail>,
}

/// Aggregate the flattened vendor resource list into per-position rows.
pub fn aggregate_resource_rows(resource_list: &[Value]) -> Vec<InventoryRow> {
    // Group entries by their zone prefix, preserving first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut grouped: std::collections::HashMap<String, Vec<&Value>> =
        std::collections::HashMap::new();

    for item in resource_list {
        let Some(code) = item_layout_code(item) else {
            continue;
        };
        let zone = layout::zone_of(&code).to_string();
        if zone.is_empty() {
            continue;
        }
        grouped
            .entry(zone.clone())
            .or_insert_with(|| {
                order.push(zone.clone());
                Vec::new()
            })
            .push(item);
    }

    let mut rows = Vec::with_capacity(order.len());
    for zone in order {
        let Some(items) = grouped.get(zone.as_str()) else {
            continue;
        };

        let mut tray_code: Option<i64> = None;
        let mut count: u32 = 0;
        let mut details: Vec<SubstanceDetail> = Vec::new();

        for item in items {
            let slot = item_slot(item);
            match slot {
                Some(-1) => {
                    tray_code = item
                        .get("resource_type")
                        .and_then(value_as_i64)
                        .or(tray_code);
                }
                _ => {
                    count += 1;
                    if let Some(detail) = build_detail(item, slot, tray_code) {
                        details.push(detail);
                    }
                }
            }
        }

        // The tray body may arrive after its wells; re-derive wells then.
        if tray_code.is_some() {
            for detail in &mut details {
                detail.well = well_text(detail.slot, tray_code);
            }
        }

        rows.push(InventoryRow {
            layout_code: zone,
            resource_type: tray_code,
            resource_type_name: tray_code
                .map(constants::tray_display_name)
                .unwrap_or("")
                .to_string(),
            count,
            substance_details: details,
        });
    }
    rows
}

fn build_detail(item: &Value, slot: Option<i64>, tray_code: Option<i64>) -> Option<SubstanceDetail> {
    let substance = item
        .get("substance")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    if substance.is_empty() {
        return None;
    }

    let unit_text = item
        .get("unit")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();

    let take = |key: &str| -> Option<String> {
        item.get(key).and_then(|v| {
            let text = value_as_text(v)?;
            Some(if unit_text.is_empty() {
                text
            } else {
                format!("{}{}", text, unit_text)
            })
        })
    };

    let detail = SubstanceDetail {
        slot,
        well: well_text(slot, tray_code),
        substance,
        value: display_amount(item, tray_code, &unit_text),
        available_weight: take("available_weight"),
        cur_weight: take("cur_weight"),
        initial_weight: take("initial_weight"),
        available_volume: take("available_volume"),
        cur_volume: take("cur_volume"),
        initial_volume: take("initial_volume"),
    };
    Some(detail)
}

/// Display amount with field priority depending on the tray class: powder
/// buckets read weights first, reagent bottles volumes first.
fn display_amount(item: &Value, tray_code: Option<i64>, unit_text: &str) -> String {
    use constants::codes;

    let weight_first = ["cur_weight", "available_weight", "initial_weight"];
    let volume_first = ["cur_volume", "available_volume", "initial_volume"];
    let generic = [
        "cur_weight",
        "cur_volume",
        "available_weight",
        "available_volume",
        "initial_weight",
        "initial_volume",
    ];

    let fields: &[&str] = match tray_code {
        Some(codes::POWDER_BUCKET_TRAY_30ML) => &weight_first,
        Some(
            codes::REAGENT_BOTTLE_TRAY_2ML
            | codes::REAGENT_BOTTLE_TRAY_8ML
            | codes::REAGENT_BOTTLE_TRAY_40ML
            | codes::REAGENT_BOTTLE_TRAY_125ML,
        ) => &volume_first,
        _ => &generic,
    };

    let amount = fields
        .iter()
        .find_map(|key| item.get(*key).and_then(value_as_text))
        .unwrap_or_else(|| "0".to_string());
    format!("{}{}", amount, unit_text)
}

fn well_text(slot: Option<i64>, tray_code: Option<i64>) -> String {
    let Some(slot) = slot else {
        return "-".to_string();
    };
    if slot < 0 {
        return "-".to_string();
    }
    let Some((cols, rows)) = tray_code.and_then(constants::tray_grid) else {
        return slot.to_string();
    };
    layout::slot_to_well(slot as u32, cols, rows).unwrap_or_else(|_| slot.to_string())
}

fn item_layout_code(item: &Value) -> Option<String> {
    for key in ["layout_code", "source_layout_code"] {
        if let Some(text) = item.get(key).and_then(Value::as_str) {
            if !text.trim().is_empty() {
                return Some(text.trim().to_string());
            }
        }
    }
    None
}

fn item_slot(item: &Value) -> Option<i64> {
    let code = item_layout_code(item)?;
    let (_, slot_text) = code.split_once(':')?;
    slot_text.trim().parse().ok()
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Render a number without trailing zeros; non-numeric values pass through.
fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => {
            let f = n.as_f64()?;
            if (f - f.round()).abs() < 1e-9 {
                Some(format!("{}", f.round() as i64))
            } else {
                let text = format!("{:.6}", f);
                Some(text.trim_end_matches('0').trim_end_matches('.').to_string())
            }
        }
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aggregates_tray_and_wells() {
        let list = vec![
            json!({"layout_code": "W-2-1:-1", "resource_type": 201000502}),
            json!({
                "layout_code": "W-2-1:0",
                "substance": "A",
                "available_volume": 5.5,
                "unit": "mL"
            }),
            json!({"layout_code": "W-2-1:1"}),
            json!({"layout_code": "N-1:-1", "resource_type": 201000726}),
        ];
        let rows = aggregate_resource_rows(&list);
        assert_eq!(rows.len(), 2);

        let bottle_tray = &rows[0];
        assert_eq!(bottle_tray.layout_code, "W-2-1");
        assert_eq!(bottle_tray.resource_type, Some(201000502));
        assert_eq!(bottle_tray.count, 2);
        assert_eq!(bottle_tray.substance_details.len(), 1);
        let detail = &bottle_tray.substance_details[0];
        assert_eq!(detail.substance, "A");
        assert_eq!(detail.well, "A1");
        assert_eq!(detail.value, "5.5mL");

        let tube_tray = &rows[1];
        assert_eq!(tube_tray.count, 0);
    }

    #[test]
    fn pick_amount_prefers_explicit_fields_over_value() {
        let detail = SubstanceDetail {
            substance: "A".to_string(),
            value: "999mL".to_string(),
            available_weight: Some("100mg".to_string()),
            ..SubstanceDetail::default()
        };
        let (kind, value) = detail.pick_amount(PhysicalState::Solid).unwrap();
        assert_eq!(kind, PhaseKind::Weight);
        assert!((value - 100.0).abs() < 1e-9);
    }

    #[test]
    fn pick_amount_infers_unit_from_field_name() {
        let detail = SubstanceDetail {
            substance: "A".to_string(),
            available_volume: Some("2.5".to_string()),
            ..SubstanceDetail::default()
        };
        let (kind, value) = detail.pick_amount(PhysicalState::Liquid).unwrap();
        assert_eq!(kind, PhaseKind::Volume);
        assert!((value - 2.5).abs() < 1e-9);
    }

    #[test]
    fn pick_amount_falls_back_to_display_value_and_state() {
        let detail = SubstanceDetail {
            substance: "A".to_string(),
            value: "3.2".to_string(),
            ..SubstanceDetail::default()
        };
        let (kind, value) = detail.pick_amount(PhysicalState::Liquid).unwrap();
        assert_eq!(kind, PhaseKind::Volume);
        assert!((value - 3.2).abs() < 1e-9);
    }

    #[test]
    fn source_layout_code_is_honored() {
        let list = vec![json!({"source_layout_code": "N-3:-1", "resource_type": 201000726})];
        let rows = aggregate_resource_rows(&list);
        assert_eq!(rows[0].layout_code, "N-3");
    }
}
