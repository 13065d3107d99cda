//! End-to-end builder scenarios over the public API

use std::collections::{HashMap, HashSet};

use synthstation::payload::ProcessJson;
use synthstation::{
    Chemical, ChemicalDirectory, GlobalParams, PhysicalForm, PhysicalState, Recipe, TaskBuilder,
    TaskPayload, UnitType,
};

fn coupling_directory() -> ChemicalDirectory {
    ChemicalDirectory::from_chemicals(vec![
        Chemical {
            molecular_weight: Some(100.0),
            state: PhysicalState::Solid,
            form: PhysicalForm::Neat,
            ..Chemical::new("A")
        },
        Chemical {
            state: PhysicalState::Liquid,
            form: PhysicalForm::Solution,
            active_content: Some(1.0),
            ..Chemical::new("B")
        },
        Chemical {
            molecular_weight: Some(78.1),
            density: Some(1.1),
            state: PhysicalState::Liquid,
            form: PhysicalForm::Neat,
            ..Chemical::new("DMSO")
        },
    ])
    .unwrap()
}

fn coupling_recipe() -> Recipe {
    let params = GlobalParams {
        task_name: "coupling screen".to_string(),
        reaction_scale_mmol: 0.1,
        reactor_type: "autotype heat".to_string(),
        reaction_time_h: 16.0,
        rotation_speed_rpm: 600,
        auto_magnet: true,
        diluent: "DMSO".to_string(),
        dilution_volume_ul: 50.0,
        sample_volume_ul: 50.0,
        ..GlobalParams::default()
    };
    let headers = vec![
        "reagent_1".to_string(),
        "amount_1".to_string(),
        "reagent_2".to_string(),
        "amount_2".to_string(),
    ];
    let row = vec![
        "A".to_string(),
        "1.0 eq".to_string(),
        "B".to_string(),
        "1.5 eq".to_string(),
    ];
    Recipe::new(params, headers, vec![row; 12])
}

fn by_column(payload: &TaskPayload) -> HashMap<u32, Vec<&synthstation::OperationUnit>> {
    let mut grouped: HashMap<u32, Vec<&synthstation::OperationUnit>> = HashMap::new();
    for unit in &payload.layout_list {
        grouped.entry(unit.unit_column).or_default().push(unit);
    }
    for units in grouped.values_mut() {
        units.sort_by_key(|u| u.unit_row);
    }
    grouped
}

#[test]
fn two_reagent_coupling_screen() {
    let dir = coupling_directory();
    let payload = TaskBuilder::new(&coupling_recipe(), &dir).build().unwrap();

    assert_eq!(payload.task_name, "coupling screen");
    assert_eq!(payload.experiment_num(), 12);

    let grouped = by_column(&payload);
    assert_eq!(grouped.len(), 12);

    for (column, units) in &grouped {
        assert_eq!(units.len(), 5, "column {}", column);
        let kinds: Vec<UnitType> = units.iter().map(|u| u.unit_type).collect();
        assert_eq!(
            kinds,
            vec![
                UnitType::AddPowder,
                UnitType::AddMagnet,
                UnitType::Pipetting,
                UnitType::MagneticStirrer,
                UnitType::FilteringSample,
            ]
        );

        match &units[0].process_json {
            ProcessJson::AddPowder { add_weight, .. } => assert!((add_weight - 10.0).abs() < 1e-9),
            other => panic!("unexpected process json {:?}", other),
        }
        match &units[2].process_json {
            ProcessJson::Pipetting { add_volume, .. } => assert!((add_volume - 0.15).abs() < 1e-9),
            other => panic!("unexpected process json {:?}", other),
        }
        match &units[3].process_json {
            ProcessJson::Stirrer {
                reaction_duration, ..
            } => assert_eq!(*reaction_duration, 16 * 3600),
            other => panic!("unexpected process json {:?}", other),
        }
        match &units[4].process_json {
            ProcessJson::FilteringSample {
                add_volume,
                sampling_volume,
                single_press_num,
                ..
            } => {
                assert!((add_volume - 0.05).abs() < 1e-9);
                assert!((sampling_volume - 0.05).abs() < 1e-9);
                assert_eq!(*single_press_num, 6);
            }
            other => panic!("unexpected process json {:?}", other),
        }
    }
}

#[test]
fn wire_shape_matches_vendor_protocol() {
    let dir = coupling_directory();
    let payload = TaskBuilder::new(&coupling_recipe(), &dir).build().unwrap();
    let value = serde_json::to_value(&payload).unwrap();

    assert_eq!(value["task_id"], 0);
    assert_eq!(value["is_audit_log"], 1);
    assert_eq!(value["is_copy"], false);
    assert_eq!(value["task_setup"]["experiment_num"], 12);
    assert_eq!(value["task_setup"]["vessel"], "551000502");
    assert_eq!(value["task_setup"]["subtype"], serde_json::Value::Null);
    assert_eq!(value["task_setup"]["added_slots"], "");

    let units = value["layout_list"].as_array().unwrap();
    assert_eq!(units.len(), 5 * 12);
    for unit in units {
        assert!(unit["unit_id"].as_str().unwrap().starts_with("unit-"));
        assert_eq!(unit["layout_code"], "");
        assert_eq!(unit["src_layout_code"], "");
        assert_eq!(unit["resource_type"], "551000502");
        assert_eq!(unit["status"], 0);
        assert!(unit.get("tray_QR_code").is_some());
        assert!(unit.get("QR_code").is_some());
    }
}

#[test]
fn mixed_solid_liquid_column_splits_cleanly() {
    let dir = coupling_directory();
    let params = GlobalParams {
        reaction_scale_mmol: 0.1,
        auto_magnet: false,
        ..GlobalParams::default()
    };
    let mut rows = Vec::new();
    for i in 0..12 {
        if i < 6 {
            rows.push(vec!["A".to_string(), "10 mg".to_string()]);
        } else {
            rows.push(vec!["B".to_string(), "200 \u{03BC}L".to_string()]);
        }
    }
    let recipe = Recipe::new(
        params,
        vec!["reagent_1".to_string(), "amount_1".to_string()],
        rows,
    );
    let payload = TaskBuilder::new(&recipe, &dir).build().unwrap();

    for unit in &payload.layout_list {
        match unit.unit_column {
            0..=5 => {
                assert_eq!(unit.unit_type, UnitType::AddPowder);
                assert_eq!(unit.unit_row, 0);
            }
            _ => {
                assert_eq!(unit.unit_type, UnitType::Pipetting);
                assert_eq!(unit.unit_row, 1);
            }
        }
    }
}

#[test]
fn grid_rows_are_contiguous_and_unique() {
    let dir = coupling_directory();
    let payload = TaskBuilder::new(&coupling_recipe(), &dir).build().unwrap();

    let mut rows_per_column: HashMap<u32, Vec<u32>> = HashMap::new();
    let mut cells: HashSet<(u32, u32)> = HashSet::new();
    for unit in &payload.layout_list {
        assert!(
            cells.insert((unit.unit_column, unit.unit_row)),
            "duplicate cell ({}, {})",
            unit.unit_column,
            unit.unit_row
        );
        rows_per_column
            .entry(unit.unit_column)
            .or_default()
            .push(unit.unit_row);
    }
    assert_eq!(rows_per_column.len() as u32, payload.experiment_num());
    for (column, mut rows) in rows_per_column {
        rows.sort_unstable();
        let expected: Vec<u32> = (0..rows.len() as u32).collect();
        assert_eq!(rows, expected, "column {} rows not contiguous", column);
    }
}

#[test]
fn weighing_offsets_stay_within_tolerance_band() {
    let dir = coupling_directory();
    let params = GlobalParams {
        reaction_scale_mmol: 2.0,
        weighing_tolerance_pct: 2.0,
        max_weighing_error_mg: 3.0,
        auto_magnet: false,
        ..GlobalParams::default()
    };
    let recipe = Recipe::new(
        params,
        vec!["reagent_1".to_string(), "amount_1".to_string()],
        vec![vec!["A".to_string(), "1.0 eq".to_string()]; 12],
    );
    let payload = TaskBuilder::new(&recipe, &dir).build().unwrap();

    for unit in &payload.layout_list {
        if let ProcessJson::AddPowder {
            add_weight, offset, ..
        } = &unit.process_json
        {
            // 200 mg target, 2% tolerance = 4 mg, capped at 3 mg.
            assert!((add_weight - 200.0).abs() < 1e-9);
            assert!(*offset >= 0.1);
            assert!((offset - 3.0).abs() < 1e-9);
        }
    }
}

#[test]
fn experiment_count_is_enforced() {
    let dir = coupling_directory();
    let recipe = Recipe::new(
        GlobalParams::default(),
        vec!["reagent_1".to_string(), "amount_1".to_string()],
        vec![vec!["A".to_string(), "1 mg".to_string()]; 10],
    );
    let err = TaskBuilder::new(&recipe, &dir).build().unwrap_err();
    assert!(err.to_string().contains("experiment count"));
}
