//! Layout code parsing and tray well/slot mapping
//!
//! A layout code is `ZONE[-i[-j]][:slot]`. Slot `-1` designates the tray
//! itself; slots >= 0 are wells, numbered row-major over the tray grid.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StationError, StationResult};

/// Zone prefixes for material in transit through the airlock and
/// intermediate shelves. Longest prefixes first so `MSB` is matched
/// before `MS`.
pub const AIRLOCK_PREFIXES: &[&str] = &["MSB", "MS", "AS", "TS"];

/// A parsed layout code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LayoutCode {
    /// Zone part, e.g. "W-1-3"
    pub zone: String,
    /// `Some(-1)` for the tray itself, `Some(n >= 0)` for a well
    pub slot: Option<i64>,
}

impl LayoutCode {
    pub fn parse(text: &str) -> StationResult<Self> {
        let trimmed = text.trim();
        let (zone, slot_text) = match trimmed.split_once(':') {
            Some((z, s)) => (z.trim(), Some(s.trim())),
            None => (trimmed, None),
        };
        if !zone.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false) {
            return Err(StationError::Validation(format!(
                "layout code '{}' must start with a zone letter",
                text
            )));
        }
        let slot = match slot_text {
            None => None,
            Some(s) => Some(s.parse::<i64>().map_err(|_| {
                StationError::Validation(format!("layout code '{}' has a non-numeric slot", text))
            })?),
        };
        if let Some(n) = slot {
            if n < -1 {
                return Err(StationError::Validation(format!(
                    "layout code '{}' slot must be -1 or a well index",
                    text
                )));
            }
        }
        Ok(Self {
            zone: zone.to_string(),
            slot,
        })
    }

    /// True when the code refers to the tray body rather than a well.
    pub fn is_tray(&self) -> bool {
        self.slot == Some(-1)
    }
}

impl fmt::Display for LayoutCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot {
            Some(slot) => write!(f, "{}:{}", self.zone, slot),
            None => write!(f, "{}", self.zone),
        }
    }
}

/// Zone part of a raw code, i.e. everything before the `:`.
pub fn zone_of(code: &str) -> &str {
    code.split(':').next().unwrap_or(code).trim()
}

/// Prefix predicate for in-transit zones; callers may override the list.
pub fn is_excluded_zone(code: &str, prefixes: &[&str]) -> bool {
    let upper = zone_of(code).to_ascii_uppercase();
    prefixes.iter().any(|p| upper.starts_with(p))
}

/// Map a row-major slot index to its well label (`A1`, `B3`, ...).
pub fn slot_to_well(slot: u32, cols: u32, rows: u32) -> StationResult<String> {
    if cols == 0 || rows == 0 || slot >= cols * rows {
        return Err(StationError::Validation(format!(
            "slot {} outside {}x{} tray",
            slot, cols, rows
        )));
    }
    let row_index = slot / cols;
    let col_index = slot % cols + 1;
    let letter = (b'A' + row_index as u8) as char;
    Ok(format!("{}{}", letter, col_index))
}

/// Map a well label back to its row-major slot index.
pub fn well_to_slot(well: &str, cols: u32, rows: u32) -> StationResult<u32> {
    let trimmed = well.trim();
    let mut chars = trimmed.chars();
    let letter = chars
        .next()
        .filter(|c| c.is_ascii_alphabetic())
        .ok_or_else(|| {
            StationError::Validation(format!("well '{}' must start with a row letter", well))
        })?;
    let row_index = (letter.to_ascii_uppercase() as u32) - ('A' as u32);
    let col_number: u32 = chars.as_str().parse().map_err(|_| {
        StationError::Validation(format!("well '{}' has a non-numeric column", well))
    })?;
    if row_index >= rows || col_number < 1 || col_number > cols {
        return Err(StationError::Validation(format!(
            "well '{}' outside {}x{} tray",
            well, cols, rows
        )));
    }
    Ok(row_index * cols + (col_number - 1))
}
