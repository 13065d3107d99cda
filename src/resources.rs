//! Resource readiness analysis: demand vs. deck stock
//!
//! Walks a built task payload to collect reagent and consumable demand,
//! pads it with dead-volume budgets, aggregates the live inventory and
//! reports shortages and surplus per item.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::amount::{self, PhaseKind};
use crate::chemical::ChemicalDirectory;
use crate::constants::{self, codes, POWDER_DEAD_WEIGHT_MG};
use crate::inventory::InventoryRow;
use crate::layout;
use crate::payload::{ProcessJson, TaskPayload};

/// Usable fraction of a tip's nominal volume
const TIP_USABLE_FRACTION: f64 = 0.7;
const USABLE_50UL_ML: f64 = 0.05 * TIP_USABLE_FRACTION;
const USABLE_1ML_ML: f64 = 1.0 * TIP_USABLE_FRACTION;
const USABLE_5ML_ML: f64 = 5.0 * TIP_USABLE_FRACTION;

/// Supply verdict for one report row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupplyStatus {
    Satisfied,
    Short,
}

/// Per-reagent readiness row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReagentRow {
    pub substance: String,
    /// Demand incl. dead-weight padding, mg
    pub need_mg: f64,
    /// Demand incl. dead-volume padding, mL
    pub need_ml: f64,
    pub available_mg: f64,
    pub available_ml: f64,
    pub status: SupplyStatus,
    /// Signed difference with unit, e.g. "-70.0mg"
    pub diff: String,
    /// Demand before padding
    pub base_need_mg: f64,
    pub base_need_ml: f64,
}

/// Per-consumable readiness row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumableRow {
    pub code: i64,
    pub name: String,
    pub need: i64,
    pub available: i64,
    pub diff: i64,
    pub status: SupplyStatus,
}

/// Aggregated readiness verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub reagents: Vec<ReagentRow>,
    pub consumables: Vec<ConsumableRow>,
    /// Shortage entries, "name:amount" texts
    pub missing: Vec<String>,
    /// Surplus entries
    pub redundant: Vec<String>,
    /// Message from the station-side secondary check, when it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_check_message: Option<String>,
}

impl ReadinessReport {
    /// Fold in the station-side `check_task_resource` verdict.
    pub fn apply_station_check(&mut self, code: i64, message: String) {
        if code == 1200 {
            self.ready = false;
            self.station_check_message = Some(message);
        } else if code != 200 {
            warn!(code, %message, "secondary resource check returned an unexpected code");
        }
    }
}

/// Options controlling supply aggregation
#[derive(Debug, Clone)]
pub struct AnalyzerOptions {
    /// Inventory rows whose zone starts with one of these are not stock.
    /// Airlock zones plus the discharge ring: material in transit.
    pub excluded_prefixes: Vec<String>,
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        let mut prefixes: Vec<String> = layout::AIRLOCK_PREFIXES
            .iter()
            .map(|p| p.to_string())
            .collect();
        prefixes.push("TB".to_string());
        Self {
            excluded_prefixes: prefixes,
        }
    }
}

/// Computes demand/supply diffs for one payload against one inventory snapshot
pub struct ResourceAnalyzer<'a> {
    chemicals: &'a ChemicalDirectory,
    options: AnalyzerOptions,
}

impl<'a> ResourceAnalyzer<'a> {
    pub fn new(chemicals: &'a ChemicalDirectory) -> Self {
        Self {
            chemicals,
            options: AnalyzerOptions::default(),
        }
    }

    pub fn with_options(chemicals: &'a ChemicalDirectory, options: AnalyzerOptions) -> Self {
        Self { chemicals, options }
    }

    pub fn analyze(&self, payload: &TaskPayload, inventory: &[InventoryRow]) -> ReadinessReport {
        let demand = collect_demand(payload);
        let supply = self.collect_supply(inventory);
        self.diff(demand, supply)
    }

    fn collect_supply(&self, inventory: &[InventoryRow]) -> Supply {
        let prefixes: Vec<&str> = self
            .options
            .excluded_prefixes
            .iter()
            .map(|s| s.as_str())
            .collect();

        let mut supply = Supply::default();
        for row in inventory {
            if layout::is_excluded_zone(&row.layout_code, &prefixes) {
                debug!(code = %row.layout_code, "skipping in-transit inventory row");
                continue;
            }

            if let Some(tray_code) = row.resource_type {
                if let Some(consumable) = constants::tray_consumable(tray_code) {
                    *supply.consumables.entry(consumable).or_insert(0) += row.count as i64;
                }

                let dead_volume = constants::container_dead_volume_ml(tray_code);
                for detail in &row.substance_details {
                    let name = detail.substance.trim();
                    if name.is_empty() {
                        continue;
                    }
                    let state = self
                        .chemicals
                        .get(name)
                        .map(|c| c.state)
                        .unwrap_or_default();
                    let Some((kind, value)) = detail.pick_amount(state) else {
                        continue;
                    };
                    if value <= 0.0 {
                        continue;
                    }
                    let stock = supply.reagents.entry(name.to_string()).or_default();
                    match kind {
                        PhaseKind::Weight => stock.mg += value,
                        PhaseKind::Volume => stock.ml += value,
                    }
                    if let Some(dead) = dead_volume {
                        // Largest observed container class wins; conservative.
                        let entry = supply.dead_volume_ml.entry(name.to_string()).or_insert(0.0);
                        if dead > *entry {
                            *entry = dead;
                        }
                    }
                }
            }
        }
        supply
    }

    fn diff(&self, demand: Demand, supply: Supply) -> ReadinessReport {
        let mut reagents = Vec::new();
        let mut missing = Vec::new();
        let mut redundant = Vec::new();

        for (name, need) in &demand.reagents {
            let base_need_mg = need.mg;
            let base_need_ml = need.ml;
            let need_mg = if base_need_mg > 0.0 {
                base_need_mg + POWDER_DEAD_WEIGHT_MG
            } else {
                base_need_mg
            };
            let need_ml = if base_need_ml > 0.0 {
                base_need_ml + supply.dead_volume_ml.get(name).copied().unwrap_or(0.0)
            } else {
                base_need_ml
            };

            let stock = supply.reagents.get(name).cloned().unwrap_or_default();
            let density = self.chemicals.get(name).and_then(|c| c.density);

            let (status, diff_text) = if need_ml > 0.0 {
                let mut total_ml = stock.ml;
                if total_ml < need_ml && stock.mg > 0.0 {
                    total_ml += amount::convert(PhaseKind::Weight, PhaseKind::Volume, stock.mg, density);
                }
                let diff = total_ml - need_ml;
                let text = format!("{:.3}mL", diff);
                if diff < 0.0 {
                    missing.push(format!("{}:{:.3}mL", name, diff.abs()));
                    (SupplyStatus::Short, text)
                } else {
                    redundant.push(format!("{}:{:.3}mL", name, diff));
                    (SupplyStatus::Satisfied, text)
                }
            } else {
                let mut total_mg = stock.mg;
                if total_mg < need_mg && stock.ml > 0.0 {
                    total_mg += amount::convert(PhaseKind::Volume, PhaseKind::Weight, stock.ml, density);
                }
                let diff = total_mg - need_mg;
                let text = format!("{:.1}mg", diff);
                if diff < 0.0 {
                    missing.push(format!("{}:{:.1}mg", name, diff.abs()));
                    (SupplyStatus::Short, text)
                } else {
                    redundant.push(format!("{}:{:.1}mg", name, diff));
                    (SupplyStatus::Satisfied, text)
                }
            };

            reagents.push(ReagentRow {
                substance: name.clone(),
                need_mg: round1(need_mg),
                need_ml: round3(need_ml),
                available_mg: round1(stock.mg),
                available_ml: round3(stock.ml),
                status,
                diff: diff_text,
                base_need_mg: round1(base_need_mg),
                base_need_ml: round3(base_need_ml),
            });
        }

        let mut consumables = Vec::new();
        for (code, need) in &demand.consumables {
            let available = supply.consumables.get(code).copied().unwrap_or(0);
            let diff = available - need;
            let name = constants::consumable_name(*code);
            let label = if name.is_empty() {
                code.to_string()
            } else {
                name.to_string()
            };
            let status = if diff < 0 {
                missing.push(format!("{}:{}pcs", label, diff.abs()));
                SupplyStatus::Short
            } else {
                redundant.push(format!("{}:{}pcs", label, diff));
                SupplyStatus::Satisfied
            };
            consumables.push(ConsumableRow {
                code: *code,
                name: label,
                need: *need,
                available,
                diff,
                status,
            });
        }

        let ready = missing.is_empty();
        if !ready {
            warn!(?missing, "resource check found shortages");
        }
        ReadinessReport {
            ready,
            reagents,
            consumables,
            missing,
            redundant,
            station_check_message: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ReagentStock {
    mg: f64,
    ml: f64,
}

#[derive(Debug, Default)]
struct Supply {
    consumables: HashMap<i64, i64>,
    reagents: HashMap<String, ReagentStock>,
    dead_volume_ml: HashMap<String, f64>,
}

#[derive(Debug, Default)]
struct Demand {
    /// BTreeMap keeps report rows in a stable order
    reagents: BTreeMap<String, ReagentStock>,
    consumables: BTreeMap<i64, i64>,
}

/// Tips needed for one (row, substance) dispensing plan of the given
/// maximum single volume.
fn tip_usage(volume_ml: f64) -> (i64, i64) {
    if volume_ml <= USABLE_50UL_ML {
        (codes::TIP_50UL, 1)
    } else if volume_ml <= USABLE_1ML_ML {
        (codes::TIP_1ML, 1)
    } else {
        // Above 1 mL everything rides the 5 mL tip, 3.5 mL usable each.
        (codes::TIP_5ML, (volume_ml / USABLE_5ML_ML).ceil() as i64)
    }
}

fn collect_demand(payload: &TaskPayload) -> Demand {
    let experiment_num = payload.experiment_num() as i64;

    let mut demand = Demand::default();
    let mut magnet_units: i64 = 0;
    let mut has_stir = false;
    let mut filter_units: i64 = 0;
    let mut pipette_plan: HashMap<(u32, String), f64> = HashMap::new();
    let mut filter_rows: HashSet<u32> = HashSet::new();
    let mut diluent_plan: HashMap<String, f64> = HashMap::new();

    for unit in &payload.layout_list {
        match &unit.process_json {
            ProcessJson::AddPowder {
                substance,
                add_weight,
                ..
            } => {
                demand
                    .reagents
                    .entry(substance.clone())
                    .or_default()
                    .mg += add_weight;
            }
            ProcessJson::Pipetting {
                substance,
                add_volume,
                ..
            } => {
                demand
                    .reagents
                    .entry(substance.clone())
                    .or_default()
                    .ml += add_volume;
                if *add_volume > 0.0 {
                    let entry = pipette_plan
                        .entry((unit.unit_row, substance.clone()))
                        .or_insert(0.0);
                    if *add_volume > *entry {
                        *entry = *add_volume;
                    }
                }
            }
            ProcessJson::FilteringSample {
                substance,
                add_volume,
                ..
            } => {
                demand
                    .reagents
                    .entry(substance.clone())
                    .or_default()
                    .ml += add_volume;
                filter_units += 1;
                filter_rows.insert(unit.unit_row);
                if *add_volume > 0.0 {
                    let entry = diluent_plan.entry(substance.clone()).or_insert(0.0);
                    if *add_volume > *entry {
                        *entry = *add_volume;
                    }
                }
            }
            ProcessJson::Magnet { .. } => magnet_units += 1,
            ProcessJson::Stirrer { .. } => has_stir = true,
        }
    }

    demand
        .consumables
        .insert(codes::REACTION_TUBE_2ML, experiment_num);
    // No stir stage means uncapped tubes; the cap tray stays untouched.
    let caps = if has_stir {
        (experiment_num + 23) / 24
    } else {
        0
    };
    demand.consumables.insert(codes::REACTION_SEAL_CAP, caps);
    demand
        .consumables
        .insert(codes::TEST_TUBE_MAGNET_2ML, magnet_units);
    demand
        .consumables
        .insert(codes::FLASH_FILTER_INNER_BOTTLE, filter_units);
    demand
        .consumables
        .insert(codes::FLASH_FILTER_OUTER_BOTTLE, filter_units);

    let mut tips: BTreeMap<i64, i64> = BTreeMap::new();
    tips.insert(codes::TIP_50UL, 0);
    tips.insert(codes::TIP_1ML, 0);
    tips.insert(codes::TIP_5ML, 0);

    for max_volume in pipette_plan.values() {
        let (code, count) = tip_usage(*max_volume);
        *tips.entry(code).or_insert(0) += count;
    }
    // Every filter row samples each experiment with a fresh 50 uL tip.
    if !filter_rows.is_empty() && experiment_num > 0 {
        *tips.entry(codes::TIP_50UL).or_insert(0) += filter_rows.len() as i64 * experiment_num;
    }
    for max_volume in diluent_plan.values() {
        if *max_volume > 0.0 {
            *tips.entry(codes::TIP_5ML).or_insert(0) += 1;
        }
    }
    demand.consumables.extend(tips);

    demand
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
