//! Task graph builder: recipe rows in, grid-placed operation units out
//!
//! Columns are classified by what their cells contain; mixed solid/liquid
//! reagent columns split into virtual columns filtered by kind, so the
//! ordering heuristic can interleave them correctly. Output rows are dense:
//! every experiment's used rows form a contiguous prefix.

use tracing::debug;

use crate::amount::{self, PhaseKind};
use crate::chemical::{Chemical, ChemicalDirectory, PhysicalState};
use crate::error::{StationError, StationResult};
use crate::payload::{OperationUnit, StirSpec, TaskPayload};
use crate::recipe::{cell_is_blank, Recipe, MAGNET_CELL, REAGENT_HEADER_PREFIX};

/// Classification of a (possibly virtual) recipe column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Solid,
    Liquid,
    Other,
    MagnetManual,
}

/// Substance class used both for column typing and split filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubstanceClass {
    Solid,
    Liquid,
    Other,
}

fn classify(chem: &Chemical) -> SubstanceClass {
    match chem.state {
        PhysicalState::Solid => SubstanceClass::Solid,
        PhysicalState::Liquid => SubstanceClass::Liquid,
        _ => SubstanceClass::Other,
    }
}

/// One column of the ordered task grid
#[derive(Debug, Clone)]
struct ColumnPlan {
    /// Index of the name column in the source rows
    source_col: usize,
    /// Index of the paired amount column, absent at the sheet edge
    amount_col: Option<usize>,
    kind: ColumnKind,
    /// For virtual columns of a split source: emit only matching substances
    split_kind: Option<SubstanceClass>,
    /// Largest single liquid volume seen in this column, mL
    max_volume_ml: f64,
    /// Column only ever emits magnet units
    magnet_only: bool,
    /// Column dispenses reagents (name + amount pair)
    is_reagent: bool,
}

#[derive(Debug, Clone)]
enum OrderedColumn {
    Reagent(ColumnPlan),
    SyntheticMagnet,
}

/// Builds an AddTask payload from a recipe and the chemical directory
pub struct TaskBuilder<'a> {
    recipe: &'a Recipe,
    chemicals: &'a ChemicalDirectory,
}

impl<'a> TaskBuilder<'a> {
    pub fn new(recipe: &'a Recipe, chemicals: &'a ChemicalDirectory) -> Self {
        Self { recipe, chemicals }
    }

    pub fn build(&self) -> StationResult<TaskPayload> {
        self.recipe.validate()?;

        let columns = self.scan_columns();
        let ordered = order_columns(
            columns,
            self.recipe.params.fixed_order,
            self.recipe.params.auto_magnet,
        );
        debug!(columns = ordered.len(), "ordered reagent grid");

        let params = &self.recipe.params;
        let mut payload = TaskPayload::new(&params.task_name, self.recipe.rows.len() as u32);

        // Auxiliary rows are appended contiguously after the reagent rows so
        // every column's rows stay a dense prefix.
        let mut next_row = ordered.len() as u32;
        let mut reaction_row = None;
        let mut standard_row = None;
        let mut post_stir_row = None;
        let mut filter_row = None;
        if !params.reactor_type.trim().is_empty() {
            reaction_row = Some(next_row);
            next_row += 1;
        }
        let has_standard = !params.internal_standard.trim().is_empty();
        if has_standard {
            standard_row = Some(next_row);
            next_row += 1;
        }
        if has_standard && params.post_standard_stir_min.unwrap_or(0.0) > 0.0 {
            post_stir_row = Some(next_row);
            next_row += 1;
        }
        if !params.diluent.trim().is_empty() {
            filter_row = Some(next_row);
        }

        for (exp_idx, row_vals) in self.recipe.rows.iter().enumerate() {
            let column = exp_idx as u32;
            self.emit_experiment(&mut payload, column, exp_idx, row_vals, &ordered)?;

            if let Some(row) = reaction_row {
                payload
                    .layout_list
                    .push(OperationUnit::stirrer(column, row, reaction_stir_spec(params)));
            }
            if let Some(row) = standard_row {
                self.emit_internal_standard(&mut payload, column, row)?;
            }
            if let Some(row) = post_stir_row {
                let minutes = params.post_standard_stir_min.unwrap_or(0.0);
                payload.layout_list.push(OperationUnit::stirrer(
                    column,
                    row,
                    StirSpec {
                        temperature: 25.0,
                        target_temperature: Some(25.0),
                        is_heating: false,
                        is_wait: false,
                        rotation_speed: params.rotation_speed_rpm,
                        duration_s: (minutes * 60.0) as u64,
                    },
                ));
            }
            if let Some(row) = filter_row {
                self.emit_filter_sample(&mut payload, column, row)?;
            }
        }

        Ok(payload)
    }

    /// Walk the headers, classify each reagent column by its cell contents
    /// and split columns that mix solids and liquids into virtual columns.
    fn scan_columns(&self) -> Vec<ColumnPlan> {
        let headers = &self.recipe.headers;
        let mut plans: Vec<ColumnPlan> = Vec::new();
        let mut idx = 0;

        while idx < headers.len() {
            let header = headers[idx].trim().to_ascii_lowercase();

            if header.starts_with(REAGENT_HEADER_PREFIX) {
                let name_col = idx;
                let amount_col = (idx + 1 < headers.len()).then_some(idx + 1);
                let scan = self.scan_reagent_column(name_col, amount_col);

                if scan.has_liquid && scan.has_solid {
                    debug!(column = name_col, "mixed reagent column, splitting");
                    plans.push(ColumnPlan {
                        source_col: name_col,
                        amount_col,
                        kind: ColumnKind::Solid,
                        split_kind: Some(SubstanceClass::Solid),
                        max_volume_ml: 0.0,
                        magnet_only: false,
                        is_reagent: true,
                    });
                    if scan.has_magnet {
                        plans.push(ColumnPlan {
                            source_col: name_col,
                            amount_col: None,
                            kind: ColumnKind::MagnetManual,
                            split_kind: None,
                            max_volume_ml: 0.0,
                            magnet_only: true,
                            is_reagent: false,
                        });
                    }
                    plans.push(ColumnPlan {
                        source_col: name_col,
                        amount_col,
                        kind: ColumnKind::Liquid,
                        split_kind: Some(SubstanceClass::Liquid),
                        max_volume_ml: scan.max_volume_ml,
                        magnet_only: false,
                        is_reagent: true,
                    });
                    if scan.has_other {
                        plans.push(ColumnPlan {
                            source_col: name_col,
                            amount_col,
                            kind: ColumnKind::Other,
                            split_kind: Some(SubstanceClass::Other),
                            max_volume_ml: 0.0,
                            magnet_only: false,
                            is_reagent: true,
                        });
                    }
                } else {
                    let kind = if scan.has_magnet {
                        ColumnKind::MagnetManual
                    } else if scan.has_liquid {
                        ColumnKind::Liquid
                    } else if scan.has_solid {
                        ColumnKind::Solid
                    } else {
                        ColumnKind::Other
                    };
                    plans.push(ColumnPlan {
                        source_col: name_col,
                        amount_col,
                        kind,
                        split_kind: None,
                        max_volume_ml: if kind == ColumnKind::Liquid {
                            scan.max_volume_ml
                        } else {
                            0.0
                        },
                        magnet_only: false,
                        is_reagent: true,
                    });
                }

                // A reagent group occupies the name and amount columns.
                idx += 2;
                continue;
            }

            if header == MAGNET_CELL {
                plans.push(ColumnPlan {
                    source_col: idx,
                    amount_col: None,
                    kind: ColumnKind::MagnetManual,
                    split_kind: None,
                    max_volume_ml: 0.0,
                    magnet_only: true,
                    is_reagent: false,
                });
            }

            idx += 1;
        }

        plans
    }

    fn scan_reagent_column(&self, name_col: usize, amount_col: Option<usize>) -> ColumnScan {
        let mut scan = ColumnScan::default();

        for row_vals in &self.recipe.rows {
            let Some(cell) = row_vals.get(name_col) else {
                continue;
            };
            let name = cell.trim();
            if cell_is_blank(name) {
                continue;
            }
            if name == MAGNET_CELL {
                scan.has_magnet = true;
                continue;
            }
            // Column-level scan stays lenient; per-experiment emission
            // reports unknown chemicals with their exact row.
            let Some(chem) = self.chemicals.get(name) else {
                scan.has_other = true;
                continue;
            };
            match classify(chem) {
                SubstanceClass::Liquid => {
                    scan.has_liquid = true;
                    let amount_text = amount_col
                        .and_then(|c| row_vals.get(c))
                        .map(|s| s.as_str())
                        .unwrap_or("0");
                    let (value, unit) = amount::parse_amount(amount_text);
                    let volume_ml = to_ml_if_volume(value, &unit);
                    if volume_ml > scan.max_volume_ml {
                        scan.max_volume_ml = volume_ml;
                    }
                }
                SubstanceClass::Solid => scan.has_solid = true,
                SubstanceClass::Other => scan.has_other = true,
            }
        }

        scan
    }

    fn emit_experiment(
        &self,
        payload: &mut TaskPayload,
        column: u32,
        exp_idx: usize,
        row_vals: &[String],
        ordered: &[OrderedColumn],
    ) -> StationResult<()> {
        let explicit_magnet = row_vals.iter().any(|cell| cell.trim() == MAGNET_CELL);

        for (pos, item) in ordered.iter().enumerate() {
            let row = pos as u32;
            let plan = match item {
                OrderedColumn::SyntheticMagnet => {
                    // The explicit cell acts as a suppressor: one magnet per tube.
                    if !explicit_magnet {
                        payload
                            .layout_list
                            .push(OperationUnit::add_magnet(column, row));
                    }
                    continue;
                }
                OrderedColumn::Reagent(plan) => plan,
            };

            let Some(cell) = row_vals.get(plan.source_col) else {
                continue;
            };
            let name = cell.trim();
            if cell_is_blank(name) {
                continue;
            }

            if name == MAGNET_CELL {
                // After a split, only the dedicated magnet column emits, so a
                // shared source cell cannot add two magnets.
                if plan.magnet_only || plan.split_kind.is_none() {
                    payload
                        .layout_list
                        .push(OperationUnit::add_magnet(column, row));
                }
                continue;
            }
            if plan.magnet_only {
                continue;
            }

            let chem = self.chemicals.get(name).ok_or_else(|| {
                StationError::Validation(format!(
                    "experiment {}: unknown chemical '{}'",
                    exp_idx + 1,
                    name
                ))
            })?;
            if let Some(split) = plan.split_kind {
                if classify(chem) != split {
                    continue;
                }
            }
            if !plan.is_reagent {
                continue;
            }

            let amount_text = plan
                .amount_col
                .and_then(|c| row_vals.get(c))
                .map(|s| s.as_str())
                .unwrap_or("0");
            let (value, unit) = amount::parse_amount(amount_text);
            if value <= 0.0 {
                continue;
            }

            let unit = self
                .emit_reagent_unit(column, row, exp_idx, chem, value, &unit)
                .map_err(|e| prefix_experiment(e, exp_idx))?;
            payload.layout_list.push(unit);
        }

        Ok(())
    }

    /// Convert one reagent cell into a powder or pipette unit.
    fn emit_reagent_unit(
        &self,
        column: u32,
        row: u32,
        exp_idx: usize,
        chem: &Chemical,
        value: f64,
        unit: &str,
    ) -> StationResult<OperationUnit> {
        let params = &self.recipe.params;
        let unit_lower = unit.trim().to_lowercase();
        let chemical_id = chem.station_id.unwrap_or(0);

        let target_mmol = match unit_lower.as_str() {
            "eq" => {
                if params.reaction_scale_mmol <= 0.0 {
                    return Err(StationError::Validation(format!(
                        "'{}' amount given in eq but reaction scale (mmol) is not set",
                        chem.name
                    )));
                }
                Some(value * params.reaction_scale_mmol)
            }
            "mmol" => Some(value),
            _ => None,
        };

        if let Some(mmol) = target_mmol {
            let resolved = amount::resolve_mmol_to_amount(mmol, chem)?;
            return Ok(match resolved.kind {
                PhaseKind::Weight => {
                    let offset = weighing_offset(
                        resolved.value,
                        params.weighing_tolerance_pct,
                        params.max_weighing_error_mg,
                    );
                    OperationUnit::add_powder(
                        column,
                        row,
                        &chem.name,
                        chemical_id,
                        resolved.value,
                        offset,
                    )
                }
                PhaseKind::Volume => {
                    OperationUnit::pipette(column, row, &chem.name, chemical_id, resolved.value)
                }
            });
        }

        // Direct mass / volume amounts, dispatched by physical state.
        match classify(chem) {
            SubstanceClass::Solid => {
                let target_mg = match unit_lower.as_str() {
                    "g" => value * 1000.0,
                    "mg" => value,
                    _ => {
                        return Err(StationError::Validation(format!(
                            "'{}' is a solid but amount unit '{}' is not a mass",
                            chem.name, unit
                        )))
                    }
                };
                let offset = weighing_offset(
                    target_mg,
                    params.weighing_tolerance_pct,
                    params.max_weighing_error_mg,
                );
                Ok(OperationUnit::add_powder(
                    column,
                    row,
                    &chem.name,
                    chemical_id,
                    target_mg,
                    offset,
                ))
            }
            SubstanceClass::Liquid => {
                let target_ml = match unit_lower.as_str() {
                    "ml" => value,
                    "\u{03BC}l" | "ul" => value / 1000.0,
                    _ => {
                        return Err(StationError::Validation(format!(
                            "'{}' is a liquid but amount unit '{}' is not a volume",
                            chem.name, unit
                        )))
                    }
                };
                Ok(OperationUnit::pipette(
                    column,
                    row,
                    &chem.name,
                    chemical_id,
                    target_ml,
                ))
            }
            SubstanceClass::Other => Err(StationError::Validation(format!(
                "experiment {}: '{}' has no dispensable physical state",
                exp_idx + 1,
                chem.name
            ))),
        }
    }

    fn emit_internal_standard(
        &self,
        payload: &mut TaskPayload,
        column: u32,
        row: u32,
    ) -> StationResult<()> {
        let params = &self.recipe.params;
        let name = params.internal_standard.trim();
        let chem = self.chemicals.require(name).map_err(|_| {
            StationError::Validation(format!("internal standard '{}' not in directory", name))
        })?;
        let chemical_id = chem.station_id.unwrap_or(0);
        let amount = params.internal_standard_amount;

        let unit = match classify(chem) {
            SubstanceClass::Solid => {
                let target_mg = if amount > 0.0 { amount } else { 10.0 };
                let offset = weighing_offset(
                    target_mg,
                    params.weighing_tolerance_pct,
                    params.max_weighing_error_mg,
                );
                OperationUnit::add_powder(column, row, name, chemical_id, target_mg, offset)
            }
            SubstanceClass::Liquid => {
                let target_ml = if amount > 0.0 { amount / 1000.0 } else { 0.1 };
                OperationUnit::pipette(column, row, name, chemical_id, target_ml)
            }
            SubstanceClass::Other => {
                return Err(StationError::Validation(format!(
                    "internal standard '{}' has no dispensable physical state",
                    name
                )))
            }
        };
        payload.layout_list.push(unit);
        Ok(())
    }

    fn emit_filter_sample(
        &self,
        payload: &mut TaskPayload,
        column: u32,
        row: u32,
    ) -> StationResult<()> {
        let params = &self.recipe.params;
        let name = params.diluent.trim();
        let chem = self.chemicals.require(name).map_err(|_| {
            StationError::Validation(format!("diluent '{}' not in directory", name))
        })?;
        payload.layout_list.push(OperationUnit::filter_sample(
            column,
            row,
            name,
            chem.station_id.unwrap_or(0),
            params.dilution_volume_ul / 1000.0,
            params.sample_volume_ul / 1000.0,
        ));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ColumnScan {
    has_liquid: bool,
    has_solid: bool,
    has_other: bool,
    has_magnet: bool,
    max_volume_ml: f64,
}

/// Order the columns into grid rows.
///
/// Auto mode sorts by group (solids, magnets, liquids by descending max
/// volume, others) with the synthetic magnet slotted after the solids.
/// Fixed mode keeps sheet order and inserts the synthetic magnet right
/// before the first liquid column, or last when there is none.
fn order_columns(
    mut columns: Vec<ColumnPlan>,
    fixed_order: bool,
    auto_magnet: bool,
) -> Vec<OrderedColumn> {
    if !fixed_order {
        // Stable sort: ties keep sheet order.
        columns.sort_by(|a, b| {
            group_rank(a.kind).cmp(&group_rank(b.kind)).then_with(|| {
                if a.kind == ColumnKind::Liquid && b.kind == ColumnKind::Liquid {
                    b.max_volume_ml
                        .partial_cmp(&a.max_volume_ml)
                        .unwrap_or(std::cmp::Ordering::Equal)
                } else {
                    std::cmp::Ordering::Equal
                }
            })
        });
    }

    let magnet_pos = if !auto_magnet {
        None
    } else if fixed_order {
        Some(
            columns
                .iter()
                .position(|c| c.kind == ColumnKind::Liquid)
                .unwrap_or(columns.len()),
        )
    } else {
        Some(
            columns
                .iter()
                .position(|c| group_rank(c.kind) > group_rank(ColumnKind::Solid))
                .unwrap_or(columns.len()),
        )
    };

    let total = columns.len();
    let mut ordered: Vec<OrderedColumn> = Vec::with_capacity(total + 1);
    for (idx, plan) in columns.into_iter().enumerate() {
        if magnet_pos == Some(idx) {
            ordered.push(OrderedColumn::SyntheticMagnet);
        }
        ordered.push(OrderedColumn::Reagent(plan));
    }
    if magnet_pos == Some(total) {
        ordered.push(OrderedColumn::SyntheticMagnet);
    }
    ordered
}

fn group_rank(kind: ColumnKind) -> u8 {
    match kind {
        ColumnKind::Solid => 0,
        ColumnKind::MagnetManual => 2,
        ColumnKind::Liquid => 3,
        ColumnKind::Other => 4,
    }
}

/// Allowed weighing deviation: tolerance percent of the target, clamped to
/// [0.1 mg, max_err_mg].
fn weighing_offset(target_mg: f64, tolerance_pct: f64, max_error_mg: f64) -> f64 {
    (target_mg * tolerance_pct / 100.0).min(max_error_mg).max(0.1)
}

fn reaction_stir_spec(params: &crate::recipe::GlobalParams) -> StirSpec {
    let is_heating = params.target_temperature_c.is_some();
    StirSpec {
        temperature: params.reaction_temp_c.unwrap_or(25.0),
        target_temperature: params.target_temperature_c,
        is_heating,
        is_wait: params.wait_target_temp,
        rotation_speed: params.rotation_speed_rpm,
        duration_s: (params.reaction_time_h * 3600.0) as u64,
    }
}

fn to_ml_if_volume(value: f64, unit: &str) -> f64 {
    let folded = unit.trim().replace('\u{00B5}', "\u{03BC}").to_lowercase();
    match folded.as_str() {
        "ml" => value,
        "\u{03BC}l" | "ul" => value / 1000.0,
        _ => 0.0,
    }
}

fn prefix_experiment(err: StationError, exp_idx: usize) -> StationError {
    match err {
        StationError::Validation(msg) if !msg.starts_with("experiment") => {
            StationError::Validation(format!("experiment {}: {}", exp_idx + 1, msg))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chemical::{PhysicalForm, PhysicalState};
    use crate::payload::{ProcessJson, UnitType};
    use crate::recipe::GlobalParams;

    fn directory() -> ChemicalDirectory {
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

    fn params() -> GlobalParams {
        GlobalParams {
            reaction_scale_mmol: 0.1,
            reactor_type: "autotype heat".to_string(),
            reaction_time_h: 2.0,
            rotation_speed_rpm: 600,
            diluent: "DMSO".to_string(),
            dilution_volume_ul: 50.0,
            sample_volume_ul: 50.0,
            ..GlobalParams::default()
        }
    }

    fn two_reagent_recipe() -> Recipe {
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
        Recipe::new(params(), headers, vec![row; 12])
    }

    fn units_for_column(payload: &TaskPayload, column: u32) -> Vec<&OperationUnit> {
        let mut units: Vec<&OperationUnit> = payload
            .layout_list
            .iter()
            .filter(|u| u.unit_column == column)
            .collect();
        units.sort_by_key(|u| u.unit_row);
        units
    }

    #[test]
    fn two_reagent_coupling_builds_five_dense_rows() {
        let dir = directory();
        let recipe = two_reagent_recipe();
        let payload = TaskBuilder::new(&recipe, &dir).build().unwrap();

        assert_eq!(payload.experiment_num(), 12);
        for column in 0..12 {
            let units = units_for_column(&payload, column);
            assert_eq!(units.len(), 5);
            let rows: Vec<u32> = units.iter().map(|u| u.unit_row).collect();
            assert_eq!(rows, vec![0, 1, 2, 3, 4]);
            assert_eq!(units[0].unit_type, UnitType::AddPowder);
            assert_eq!(units[1].unit_type, UnitType::AddMagnet);
            assert_eq!(units[2].unit_type, UnitType::Pipetting);
            assert_eq!(units[3].unit_type, UnitType::MagneticStirrer);
            assert_eq!(units[4].unit_type, UnitType::FilteringSample);

            match &units[0].process_json {
                ProcessJson::AddPowder { add_weight, offset, .. } => {
                    assert!((add_weight - 10.0).abs() < 1e-9);
                    assert!(*offset >= 0.1 && *offset <= 1.0);
                }
                other => panic!("expected powder, got {:?}", other),
            }
            match &units[2].process_json {
                ProcessJson::Pipetting { add_volume, .. } => {
                    assert!((add_volume - 0.15).abs() < 1e-9)
                }
                other => panic!("expected pipette, got {:?}", other),
            }
            match &units[3].process_json {
                ProcessJson::Stirrer { reaction_duration, .. } => {
                    assert_eq!(*reaction_duration, 7200)
                }
                other => panic!("expected stirrer, got {:?}", other),
            }
            match &units[4].process_json {
                ProcessJson::FilteringSample { add_volume, .. } => {
                    assert!((add_volume - 0.05).abs() < 1e-9)
                }
                other => panic!("expected filter sample, got {:?}", other),
            }
        }
    }

    #[test]
    fn mixed_column_splits_without_cross_contamination() {
        let dir = directory();
        let headers = vec!["reagent_1".to_string(), "amount_1".to_string()];
        let mut rows = Vec::new();
        for i in 0..12 {
            if i < 6 {
                rows.push(vec!["A".to_string(), "5 mg".to_string()]);
            } else {
                rows.push(vec!["B".to_string(), "100 \u{03BC}L".to_string()]);
            }
        }
        let recipe = Recipe::new(
            GlobalParams {
                auto_magnet: false,
                reactor_type: String::new(),
                diluent: String::new(),
                ..params()
            },
            headers,
            rows,
        );
        let payload = TaskBuilder::new(&recipe, &dir).build().unwrap();

        // Solid virtual column sits above the liquid one.
        for column in 0..6u32 {
            let units = units_for_column(&payload, column);
            assert_eq!(units.len(), 1);
            assert_eq!(units[0].unit_type, UnitType::AddPowder);
            assert_eq!(units[0].unit_row, 0);
        }
        for column in 6..12u32 {
            let units = units_for_column(&payload, column);
            assert_eq!(units.len(), 1);
            assert_eq!(units[0].unit_type, UnitType::Pipetting);
            assert_eq!(units[0].unit_row, 1);
        }
    }

    #[test]
    fn explicit_magnet_cell_suppresses_synthetic_unit() {
        let dir = directory();
        let headers = vec![
            "reagent_1".to_string(),
            "amount_1".to_string(),
            "magnet".to_string(),
        ];
        let mut rows = vec![vec!["A".to_string(), "5 mg".to_string(), "magnet".to_string()]; 12];
        // One experiment without the explicit cell gets the synthetic magnet.
        rows[3][2] = String::new();
        let recipe = Recipe::new(
            GlobalParams {
                reactor_type: String::new(),
                diluent: String::new(),
                ..params()
            },
            headers,
            rows,
        );
        let payload = TaskBuilder::new(&recipe, &dir).build().unwrap();

        for column in 0..12u32 {
            let magnet_count = units_for_column(&payload, column)
                .iter()
                .filter(|u| u.unit_type == UnitType::AddMagnet)
                .count();
            assert_eq!(magnet_count, 1, "column {}", column);
        }
    }

    #[test]
    fn liquids_order_by_descending_max_volume() {
        let dir = directory();
        let headers = vec![
            "reagent_1".to_string(),
            "amount_1".to_string(),
            "reagent_2".to_string(),
            "amount_2".to_string(),
        ];
        // Second column carries the larger volume, so it must come first.
        let row = vec![
            "B".to_string(),
            "100 \u{03BC}L".to_string(),
            "DMSO".to_string(),
            "1 mL".to_string(),
        ];
        let recipe = Recipe::new(
            GlobalParams {
                auto_magnet: false,
                reactor_type: String::new(),
                diluent: String::new(),
                ..params()
            },
            headers,
            vec![row; 12],
        );
        let payload = TaskBuilder::new(&recipe, &dir).build().unwrap();
        let units = units_for_column(&payload, 0);
        assert_eq!(units[0].substance(), Some("DMSO"));
        assert_eq!(units[1].substance(), Some("B"));
    }

    #[test]
    fn fixed_order_appends_magnet_when_no_liquid() {
        let dir = directory();
        let headers = vec!["reagent_1".to_string(), "amount_1".to_string()];
        let recipe = Recipe::new(
            GlobalParams {
                fixed_order: true,
                reactor_type: String::new(),
                diluent: String::new(),
                ..params()
            },
            headers,
            vec![vec!["A".to_string(), "5 mg".to_string()]; 12],
        );
        let payload = TaskBuilder::new(&recipe, &dir).build().unwrap();
        let units = units_for_column(&payload, 0);
        assert_eq!(units[0].unit_type, UnitType::AddPowder);
        assert_eq!(units[1].unit_type, UnitType::AddMagnet);
    }

    #[test]
    fn eq_without_scale_faults_with_row_context() {
        let dir = directory();
        let mut bad_params = params();
        bad_params.reaction_scale_mmol = 0.0;
        let recipe = Recipe::new(
            bad_params,
            vec!["reagent_1".to_string(), "amount_1".to_string()],
            vec![vec!["A".to_string(), "1.0 eq".to_string()]; 12],
        );
        let err = TaskBuilder::new(&recipe, &dir).build().unwrap_err();
        assert!(err.to_string().contains("experiment 1"));
        assert!(err.to_string().contains("reaction scale"));
    }

    #[test]
    fn unknown_chemical_names_the_experiment() {
        let dir = directory();
        let recipe = Recipe::new(
            params(),
            vec!["reagent_1".to_string(), "amount_1".to_string()],
            vec![vec!["mystery".to_string(), "1.0 eq".to_string()]; 12],
        );
        let err = TaskBuilder::new(&recipe, &dir).build().unwrap_err();
        assert!(err.to_string().contains("unknown chemical 'mystery'"));
    }

    #[test]
    fn grid_invariants_hold() {
        let dir = directory();
        let recipe = two_reagent_recipe();
        let payload = TaskBuilder::new(&recipe, &dir).build().unwrap();

        let mut columns: std::collections::HashSet<u32> = std::collections::HashSet::new();
        let mut seen: std::collections::HashSet<(u32, u32)> = std::collections::HashSet::new();
        for unit in &payload.layout_list {
            columns.insert(unit.unit_column);
            assert!(
                seen.insert((unit.unit_column, unit.unit_row)),
                "duplicate cell ({}, {})",
                unit.unit_column,
                unit.unit_row
            );
        }
        assert_eq!(columns.len() as u32, payload.experiment_num());
    }
}
