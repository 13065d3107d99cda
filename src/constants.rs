//! Status codes, resource codes and tray geometry tables
//!
//! Codes mirror the vendor upper-computer protocol and are stable per
//! station firmware release.

use serde::{Deserialize, Serialize};

/// Task lifecycle status codes reported by the station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Unstarted,
    Running,
    Completed,
    Paused,
    Failed,
    Stopped,
    Pausing,
    Stopping,
    Waiting,
    Holding,
}

impl TaskStatus {
    /// Decode a raw status code, `None` for unknown codes.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Unstarted),
            1 => Some(Self::Running),
            2 => Some(Self::Completed),
            3 => Some(Self::Paused),
            4 => Some(Self::Failed),
            5 => Some(Self::Stopped),
            6 => Some(Self::Pausing),
            7 => Some(Self::Stopping),
            8 => Some(Self::Waiting),
            10 => Some(Self::Holding),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::Unstarted => 0,
            Self::Running => 1,
            Self::Completed => 2,
            Self::Paused => 3,
            Self::Failed => 4,
            Self::Stopped => 5,
            Self::Pausing => 6,
            Self::Stopping => 7,
            Self::Waiting => 8,
            Self::Holding => 10,
        }
    }

    /// Completed, failed and stopped tasks never leave that state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Unstarted => "UNSTARTED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Paused => "PAUSED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
            Self::Pausing => "PAUSING",
            Self::Stopping => "STOPPING",
            Self::Waiting => "WAITING",
            Self::Holding => "HOLDING",
        }
    }
}

/// Whole-station state codes, same numeric space as [`TaskStatus`]
/// but describing the machine rather than a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StationState {
    Idle,
    Running,
    Paused,
    Pausing,
    Stopping,
    Holding,
}

impl StationState {
    pub const IDLE_CODE: i64 = 0;

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Idle),
            1 => Some(Self::Running),
            3 => Some(Self::Paused),
            6 => Some(Self::Pausing),
            7 => Some(Self::Stopping),
            10 => Some(Self::Holding),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Pausing => "PAUSING",
            Self::Stopping => "STOPPING",
            Self::Holding => "HOLDING",
        }
    }
}

/// Per-module status codes from the device info listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceModuleStatus {
    Available,
    Running,
    Unavailable,
    Open,
    Close,
    Outside,
    Home,
}

impl DeviceModuleStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Available),
            1 => Some(Self::Running),
            2 => Some(Self::Unavailable),
            3 => Some(Self::Open),
            4 => Some(Self::Close),
            5 => Some(Self::Outside),
            6 => Some(Self::Home),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Running => "RUNNING",
            Self::Unavailable => "UNAVAILABLE",
            Self::Open => "OPEN",
            Self::Close => "CLOSE",
            Self::Outside => "OUTSIDE",
            Self::Home => "HOME",
        }
    }
}

/// Resource codes for trays and the consumables they carry
pub mod codes {
    // Tray codes
    pub const REACTION_TUBE_TRAY_2ML: i64 = 201000726;
    pub const TEST_TUBE_MAGNET_TRAY_2ML: i64 = 201000711;
    pub const REACTION_SEAL_CAP_TRAY: i64 = 201000712;
    pub const FLASH_FILTER_INNER_BOTTLE_TRAY: i64 = 201000727;
    pub const FLASH_FILTER_OUTER_BOTTLE_TRAY: i64 = 201000728;
    pub const TIP_TRAY_50UL: i64 = 201000815;
    pub const TIP_TRAY_1ML: i64 = 201000731;
    pub const TIP_TRAY_5ML: i64 = 201000512;
    pub const POWDER_BUCKET_TRAY_30ML: i64 = 201000600;
    pub const REAGENT_BOTTLE_TRAY_2ML: i64 = 201000730;
    pub const REAGENT_BOTTLE_TRAY_8ML: i64 = 201000502;
    pub const REAGENT_BOTTLE_TRAY_40ML: i64 = 201000503;
    pub const REAGENT_BOTTLE_TRAY_125ML: i64 = 220000023;

    // Consumable / media codes
    pub const REACTION_TUBE_2ML: i64 = 551000502;
    pub const TEST_TUBE_MAGNET_2ML: i64 = 220000322;
    pub const REACTION_SEAL_CAP: i64 = 211009427;
    pub const FLASH_FILTER_INNER_BOTTLE: i64 = 220000320;
    pub const FLASH_FILTER_OUTER_BOTTLE: i64 = 220000321;
    pub const TIP_1ML: i64 = 220000308;
    pub const TIP_5ML: i64 = 214000037;
    pub const TIP_50UL: i64 = 220000304;
    pub const POWDER_BUCKET_30ML: i64 = 201000816;
    pub const REAGENT_BOTTLE_2ML: i64 = 502000353;
    pub const REAGENT_BOTTLE_8ML: i64 = 220000005;
    pub const REAGENT_BOTTLE_40ML: i64 = 220000092;
    pub const REAGENT_BOTTLE_125ML: i64 = 220000008;
}

/// Tray geometry as (columns, rows); rows map to well letters A, B, ...
pub fn tray_grid(tray_code: i64) -> Option<(u32, u32)> {
    match tray_code {
        codes::REAGENT_BOTTLE_TRAY_2ML => Some((8, 6)),
        codes::REAGENT_BOTTLE_TRAY_8ML => Some((4, 3)),
        codes::REAGENT_BOTTLE_TRAY_40ML => Some((3, 2)),
        codes::REAGENT_BOTTLE_TRAY_125ML => Some((2, 1)),
        codes::REACTION_TUBE_TRAY_2ML => Some((6, 4)),
        codes::TEST_TUBE_MAGNET_TRAY_2ML => Some((6, 4)),
        codes::REACTION_SEAL_CAP_TRAY => Some((1, 1)),
        codes::FLASH_FILTER_INNER_BOTTLE_TRAY => Some((8, 6)),
        codes::FLASH_FILTER_OUTER_BOTTLE_TRAY => Some((8, 6)),
        codes::TIP_TRAY_50UL => Some((12, 8)),
        codes::TIP_TRAY_1ML => Some((12, 8)),
        codes::TIP_TRAY_5ML => Some((6, 4)),
        codes::POWDER_BUCKET_TRAY_30ML => Some((1, 2)),
        _ => None,
    }
}

/// Map a tray code to the consumable it dispenses, if any.
pub fn tray_consumable(tray_code: i64) -> Option<i64> {
    match tray_code {
        codes::TIP_TRAY_50UL => Some(codes::TIP_50UL),
        codes::TIP_TRAY_1ML => Some(codes::TIP_1ML),
        codes::TIP_TRAY_5ML => Some(codes::TIP_5ML),
        codes::TEST_TUBE_MAGNET_TRAY_2ML => Some(codes::TEST_TUBE_MAGNET_2ML),
        codes::REACTION_SEAL_CAP_TRAY => Some(codes::REACTION_SEAL_CAP),
        codes::REACTION_TUBE_TRAY_2ML => Some(codes::REACTION_TUBE_2ML),
        codes::FLASH_FILTER_INNER_BOTTLE_TRAY => Some(codes::FLASH_FILTER_INNER_BOTTLE),
        codes::FLASH_FILTER_OUTER_BOTTLE_TRAY => Some(codes::FLASH_FILTER_OUTER_BOTTLE),
        _ => None,
    }
}

/// Display name of a tray kind, empty when unknown.
pub fn tray_display_name(tray_code: i64) -> &'static str {
    match tray_code {
        codes::REACTION_TUBE_TRAY_2ML => "2 mL reaction tube tray",
        codes::TEST_TUBE_MAGNET_TRAY_2ML => "2 mL tube magnet tray",
        codes::REACTION_SEAL_CAP_TRAY => "reaction seal cap tray",
        codes::FLASH_FILTER_INNER_BOTTLE_TRAY => "flash filter inner bottle tray",
        codes::FLASH_FILTER_OUTER_BOTTLE_TRAY => "flash filter outer bottle tray",
        codes::TIP_TRAY_50UL => "50 uL tip tray",
        codes::TIP_TRAY_1ML => "1 mL tip tray",
        codes::TIP_TRAY_5ML => "5 mL tip tray",
        codes::POWDER_BUCKET_TRAY_30ML => "30 mL powder bucket tray",
        codes::REAGENT_BOTTLE_TRAY_2ML => "2 mL reagent bottle tray",
        codes::REAGENT_BOTTLE_TRAY_8ML => "8 mL reagent bottle tray",
        codes::REAGENT_BOTTLE_TRAY_40ML => "40 mL reagent bottle tray",
        codes::REAGENT_BOTTLE_TRAY_125ML => "125 mL reagent bottle tray",
        _ => "",
    }
}

/// Display name of a consumable code.
pub fn consumable_name(code: i64) -> &'static str {
    match code {
        codes::TIP_50UL => "50uL tip",
        codes::TIP_1ML => "1mL tip",
        codes::TIP_5ML => "5mL tip",
        codes::TEST_TUBE_MAGNET_2ML => "2mL tube magnet",
        codes::REACTION_TUBE_2ML => "2mL reaction tube",
        codes::REACTION_SEAL_CAP => "reaction seal cap",
        codes::FLASH_FILTER_INNER_BOTTLE => "flash filter inner bottle",
        codes::FLASH_FILTER_OUTER_BOTTLE => "flash filter outer bottle",
        _ => "",
    }
}

/// Liquid dead volume (mL) left behind per reagent bottle class
pub fn container_dead_volume_ml(tray_code: i64) -> Option<f64> {
    match tray_code {
        codes::REAGENT_BOTTLE_TRAY_2ML => Some(0.1),
        codes::REAGENT_BOTTLE_TRAY_8ML => Some(1.0),
        codes::REAGENT_BOTTLE_TRAY_40ML => Some(4.0),
        codes::REAGENT_BOTTLE_TRAY_125ML => Some(14.0),
        _ => None,
    }
}

/// Fixed powder dead weight padding (mg) per solid reagent
pub const POWDER_DEAD_WEIGHT_MG: f64 = 20.0;

/// Glovebox environment device code for the runtime query endpoint
pub const GLOVEBOX_ENV_DEVICE_CODE: &str = "352";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for code in [0, 1, 2, 3, 4, 5, 6, 7, 8, 10] {
            let status = TaskStatus::from_code(code).unwrap();
            assert_eq!(status.code(), code);
        }
        assert!(TaskStatus::from_code(9).is_none());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Waiting.is_terminal());
    }

    #[test]
    fn tray_tables_agree() {
        // Every tray with a consumable mapping also has a geometry.
        for tray in [
            codes::TIP_TRAY_50UL,
            codes::TIP_TRAY_1ML,
            codes::TIP_TRAY_5ML,
            codes::TEST_TUBE_MAGNET_TRAY_2ML,
            codes::REACTION_SEAL_CAP_TRAY,
            codes::REACTION_TUBE_TRAY_2ML,
            codes::FLASH_FILTER_INNER_BOTTLE_TRAY,
            codes::FLASH_FILTER_OUTER_BOTTLE_TRAY,
        ] {
            assert!(tray_consumable(tray).is_some());
            assert!(tray_grid(tray).is_some());
        }
    }
}
