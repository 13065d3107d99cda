//! Experiment recipe model
//!
//! The builder receives a recipe already parsed out of its source sheet:
//! global parameters, column headers and one data row per experiment.

use serde::{Deserialize, Serialize};

use crate::error::{StationError, StationResult};

/// Header prefix opening a reagent (name, amount) column pair
pub const REAGENT_HEADER_PREFIX: &str = "reagent";
/// Header or cell literal declaring a magnet addition
pub const MAGNET_CELL: &str = "magnet";

/// Experiment counts the deck can physically host
pub const VALID_EXPERIMENT_COUNTS: &[usize] = &[12, 24, 36, 48];

/// Global parameters shared by every experiment of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalParams {
    /// Task name submitted to the station
    pub task_name: String,
    /// Reaction scale in mmol; required for `eq` amounts
    pub reaction_scale_mmol: f64,
    /// Reactor type label; blank skips the reaction stir stage
    pub reactor_type: String,
    /// Reaction time in hours
    pub reaction_time_h: f64,
    /// Reaction temperature in deg C; blank defaults to 25
    pub reaction_temp_c: Option<f64>,
    /// Stirrer rotation speed in rpm
    pub rotation_speed_rpm: u32,
    /// Post-stir target temperature; set means heating is requested
    pub target_temperature_c: Option<f64>,
    /// Hold until the target temperature is reached before timing
    pub wait_target_temp: bool,
    /// Weighing tolerance in percent of the target weight
    pub weighing_tolerance_pct: f64,
    /// Absolute cap on the weighing tolerance in mg
    pub max_weighing_error_mg: f64,
    /// Keep reagent columns in sheet order instead of the solids-first heuristic
    pub fixed_order: bool,
    /// Insert a magnet step automatically for every experiment
    pub auto_magnet: bool,
    /// Internal standard substance; blank skips the stage
    pub internal_standard: String,
    /// Internal standard amount: mg for solids, uL for liquids
    pub internal_standard_amount: f64,
    /// Stir time after internal standard addition, minutes
    pub post_standard_stir_min: Option<f64>,
    /// Diluent substance for filter sampling; blank skips the stage
    pub diluent: String,
    /// Dilution volume in uL
    pub dilution_volume_ul: f64,
    /// Sampling volume in uL
    pub sample_volume_ul: f64,
}

impl Default for GlobalParams {
    fn default() -> Self {
        Self {
            task_name: "AutoTask".to_string(),
            reaction_scale_mmol: 0.0,
            reactor_type: String::new(),
            reaction_time_h: 0.0,
            reaction_temp_c: None,
            rotation_speed_rpm: 0,
            target_temperature_c: None,
            wait_target_temp: false,
            weighing_tolerance_pct: 1.0,
            max_weighing_error_mg: 1.0,
            fixed_order: false,
            auto_magnet: true,
            internal_standard: String::new(),
            internal_standard_amount: 0.0,
            post_standard_stir_min: None,
            diluent: String::new(),
            dilution_volume_ul: 0.0,
            sample_volume_ul: 0.0,
        }
    }
}

/// A parsed experiment recipe: one data row per experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub params: GlobalParams,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Recipe {
    pub fn new(params: GlobalParams, headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            params,
            headers,
            rows,
        }
    }

    pub fn experiment_count(&self) -> usize {
        self.rows.len()
    }

    /// Structural validation ahead of task building.
    pub fn validate(&self) -> StationResult<()> {
        if self.headers.is_empty() {
            return Err(StationError::Validation("recipe has no headers".into()));
        }
        if !VALID_EXPERIMENT_COUNTS.contains(&self.rows.len()) {
            return Err(StationError::Validation(format!(
                "experiment count {} is not one of {:?}",
                self.rows.len(),
                VALID_EXPERIMENT_COUNTS
            )));
        }
        Ok(())
    }
}

/// Treat empty cells and bare zeros as absent.
pub(crate) fn cell_is_blank(cell: &str) -> bool {
    let trimmed = cell.trim();
    trimmed.is_empty() || trimmed == "0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_nonstandard_experiment_counts() {
        let recipe = Recipe::new(
            GlobalParams::default(),
            vec!["reagent_1".to_string()],
            vec![vec!["A".to_string()]; 13],
        );
        assert!(recipe.validate().is_err());

        let recipe = Recipe::new(
            GlobalParams::default(),
            vec!["reagent_1".to_string()],
            vec![vec!["A".to_string()]; 24],
        );
        assert!(recipe.validate().is_ok());
    }

    #[test]
    fn blank_cells() {
        assert!(cell_is_blank(""));
        assert!(cell_is_blank(" 0 "));
        assert!(!cell_is_blank("0.5 eq"));
    }
}
