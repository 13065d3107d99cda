//! Task payload wire types posted to the station's AddTask endpoint
//!
//! Field names and casing follow the vendor protocol verbatim; everything
//! here serializes byte-for-byte into the shape the upper computer expects.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::codes;

/// Presses of the flash filter plunger per sampling operation
pub const SINGLE_PRESS_NUM: u32 = 6;

/// Round a weight to the station's 0.1 mg resolution.
pub fn round_mg(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Round a volume to the station's 1 uL resolution.
pub fn round_ml(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Complete AddTask request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: i64,
    pub task_name: String,
    pub is_audit_log: i64,
    pub is_copy: bool,
    pub task_setup: TaskSetup,
    pub layout_list: Vec<OperationUnit>,
}

impl TaskPayload {
    pub fn new(task_name: impl Into<String>, experiment_num: u32) -> Self {
        Self {
            task_id: 0,
            task_name: task_name.into(),
            is_audit_log: 1,
            is_copy: false,
            task_setup: TaskSetup {
                subtype: None,
                experiment_num,
                vessel: codes::REACTION_TUBE_2ML.to_string(),
                added_slots: String::new(),
            },
            layout_list: Vec::new(),
        }
    }

    pub fn experiment_num(&self) -> u32 {
        self.task_setup.experiment_num
    }
}

/// Task setup block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSetup {
    pub subtype: Option<String>,
    pub experiment_num: u32,
    pub vessel: String,
    pub added_slots: String,
}

/// Operation unit kinds understood by the station scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitType {
    #[serde(rename = "exp_add_powder")]
    AddPowder,
    #[serde(rename = "exp_pipetting")]
    Pipetting,
    #[serde(rename = "exp_add_magnet")]
    AddMagnet,
    #[serde(rename = "exp_magnetic_stirrer")]
    MagneticStirrer,
    #[serde(rename = "exp_filtering_sample")]
    FilteringSample,
}

/// One grid-placed instruction of the task layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationUnit {
    pub unit_id: String,
    pub unit_type: UnitType,
    /// Experiment index, 0-based
    pub unit_column: u32,
    /// Step row within the experiment, 0-based
    pub unit_row: u32,
    pub layout_code: String,
    pub src_layout_code: String,
    pub resource_type: String,
    pub status: i64,
    #[serde(rename = "tray_QR_code")]
    pub tray_qr_code: String,
    #[serde(rename = "QR_code")]
    pub qr_code: String,
    pub process_json: ProcessJson,
}

/// Unit display-unit block carried inside process_json
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CustomUnit {
    pub unit: String,
    #[serde(
        rename = "unitOptions",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub unit_options: Vec<String>,
}

/// Kind-specific process parameters.
///
/// Serialized untagged; variant order matters for deserialization because
/// later variants are subsets of earlier ones field-wise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProcessJson {
    AddPowder {
        substance: String,
        chemical_id: i64,
        /// mg
        add_weight: f64,
        /// Allowed weighing deviation, mg
        offset: f64,
        custom: CustomUnit,
    },
    FilteringSample {
        substance: String,
        chemical_id: i64,
        /// Diluent volume, mL
        add_volume: f64,
        /// Sample draw volume, mL
        sampling_volume: f64,
        single_press_num: u32,
    },
    Stirrer {
        temperature: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_temperature: Option<f64>,
        is_heating: bool,
        is_wait: bool,
        rotation_speed: u32,
        /// seconds
        reaction_duration: u64,
        custom: CustomUnit,
    },
    Pipetting {
        substance: String,
        chemical_id: i64,
        /// mL
        add_volume: f64,
        custom: CustomUnit,
    },
    Magnet {
        custom: CustomUnit,
    },
}

/// Stir stage parameters for [`OperationUnit::stirrer`]
#[derive(Debug, Clone, Copy)]
pub struct StirSpec {
    pub temperature: f64,
    pub target_temperature: Option<f64>,
    pub is_heating: bool,
    pub is_wait: bool,
    pub rotation_speed: u32,
    pub duration_s: u64,
}

fn short_unit_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("unit-{}", &hex[..8])
}

impl OperationUnit {
    fn base(unit_type: UnitType, column: u32, row: u32, process_json: ProcessJson) -> Self {
        Self {
            unit_id: short_unit_id(),
            unit_type,
            unit_column: column,
            unit_row: row,
            layout_code: String::new(),
            src_layout_code: String::new(),
            resource_type: codes::REACTION_TUBE_2ML.to_string(),
            status: 0,
            tray_qr_code: String::new(),
            qr_code: String::new(),
            process_json,
        }
    }

    pub fn add_powder(
        column: u32,
        row: u32,
        substance: &str,
        chemical_id: i64,
        add_weight_mg: f64,
        offset_mg: f64,
    ) -> Self {
        Self::base(
            UnitType::AddPowder,
            column,
            row,
            ProcessJson::AddPowder {
                substance: substance.to_string(),
                chemical_id,
                add_weight: round_mg(add_weight_mg),
                offset: round_mg(offset_mg),
                custom: CustomUnit {
                    unit: "mg".to_string(),
                    unit_options: vec!["mg".to_string(), "g".to_string()],
                },
            },
        )
    }

    pub fn pipette(
        column: u32,
        row: u32,
        substance: &str,
        chemical_id: i64,
        add_volume_ml: f64,
    ) -> Self {
        Self::base(
            UnitType::Pipetting,
            column,
            row,
            ProcessJson::Pipetting {
                substance: substance.to_string(),
                chemical_id,
                add_volume: round_ml(add_volume_ml),
                custom: CustomUnit {
                    unit: "mL".to_string(),
                    unit_options: vec!["mL".to_string(), "L".to_string()],
                },
            },
        )
    }

    pub fn add_magnet(column: u32, row: u32) -> Self {
        Self::base(
            UnitType::AddMagnet,
            column,
            row,
            ProcessJson::Magnet {
                custom: CustomUnit::default(),
            },
        )
    }

    pub fn stirrer(column: u32, row: u32, spec: StirSpec) -> Self {
        Self::base(
            UnitType::MagneticStirrer,
            column,
            row,
            ProcessJson::Stirrer {
                temperature: spec.temperature,
                target_temperature: spec.target_temperature,
                is_heating: spec.is_heating,
                is_wait: spec.is_wait,
                rotation_speed: spec.rotation_speed,
                reaction_duration: spec.duration_s,
                custom: CustomUnit::default(),
            },
        )
    }

    pub fn filter_sample(
        column: u32,
        row: u32,
        substance: &str,
        chemical_id: i64,
        add_volume_ml: f64,
        sampling_volume_ml: f64,
    ) -> Self {
        Self::base(
            UnitType::FilteringSample,
            column,
            row,
            ProcessJson::FilteringSample {
                substance: substance.to_string(),
                chemical_id,
                add_volume: round_ml(add_volume_ml),
                sampling_volume: round_ml(sampling_volume_ml),
                single_press_num: SINGLE_PRESS_NUM,
            },
        )
    }

    /// Substance handled by this unit, if its kind dispenses one.
    pub fn substance(&self) -> Option<&str> {
        match &self.process_json {
            ProcessJson::AddPowder { substance, .. }
            | ProcessJson::Pipetting { substance, .. }
            | ProcessJson::FilteringSample { substance, .. } => Some(substance),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_ids_are_short_hex() {
        let unit = OperationUnit::add_magnet(0, 1);
        assert!(unit.unit_id.starts_with("unit-"));
        assert_eq!(unit.unit_id.len(), "unit-".len() + 8);
        assert!(unit.unit_id["unit-".len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn powder_unit_serializes_to_wire_shape() {
        let unit = OperationUnit::add_powder(3, 0, "A", 42, 10.04, 0.123);
        let value = serde_json::to_value(&unit).unwrap();
        assert_eq!(value["unit_type"], "exp_add_powder");
        assert_eq!(value["unit_column"], 3);
        assert_eq!(value["resource_type"], "551000502");
        assert_eq!(value["tray_QR_code"], "");
        assert_eq!(value["process_json"]["add_weight"], 10.0);
        assert_eq!(value["process_json"]["offset"], 0.1);
        assert_eq!(value["process_json"]["custom"]["unitOptions"][1], "g");
    }

    #[test]
    fn magnet_unit_has_bare_custom_block() {
        let unit = OperationUnit::add_magnet(0, 2);
        let value = serde_json::to_value(&unit).unwrap();
        assert_eq!(value["process_json"]["custom"]["unit"], "");
        assert!(value["process_json"]["custom"].get("unitOptions").is_none());
    }

    #[test]
    fn process_json_round_trips_per_variant() {
        let units = vec![
            OperationUnit::add_powder(0, 0, "A", 1, 5.0, 0.1),
            OperationUnit::pipette(0, 1, "B", 2, 0.15),
            OperationUnit::filter_sample(0, 2, "DMSO", 3, 0.05, 0.05),
            OperationUnit::add_magnet(0, 3),
            OperationUnit::stirrer(
                0,
                4,
                StirSpec {
                    temperature: 25.0,
                    target_temperature: None,
                    is_heating: false,
                    is_wait: false,
                    rotation_speed: 600,
                    duration_s: 3600,
                },
            ),
        ];
        for unit in units {
            let json = serde_json::to_string(&unit).unwrap();
            let back: OperationUnit = serde_json::from_str(&json).unwrap();
            assert_eq!(back.unit_type, unit.unit_type);
            assert_eq!(back.substance(), unit.substance());
        }
    }

    #[test]
    fn rounding_matches_station_resolution() {
        assert_eq!(round_mg(10.04), 10.0);
        assert_eq!(round_mg(10.05), 10.1);
        assert_eq!(round_ml(0.0494), 0.049);
        assert_eq!(round_ml(0.15), 0.15);
    }
}
