//! Orchestration core for a glovebox synthesis workstation
//!
//! This crate mediates between spreadsheet-driven experiment recipes and a
//! remote synthesis station exposed through an HTTP/JSON upper computer:
//! - Builds grid-placed task payloads from tabular recipes
//! - Checks reagent and consumable readiness against the live deck inventory
//! - Drives the run: initialize, submit, start, poll progress, discharge
//! - Aligns the local chemical directory with the station registry
//! - Records snapshots and task history through a pluggable data sink

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod amount;
pub mod builder;
pub mod chemical;
pub mod client;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod inventory;
pub mod layout;
pub mod payload;
pub mod recipe;
pub mod resources;
pub mod sink;

pub use builder::TaskBuilder;
pub use chemical::{Chemical, ChemicalDirectory, PhysicalForm, PhysicalState};
pub use client::StationClient;
pub use config::StationConfig;
pub use constants::{StationState, TaskStatus};
pub use coordinator::{
    Coordinator, DischargeOptions, DischargeOutcome, PollOptions, StartOptions, TaskHandle,
    TaskProgress,
};
pub use error::{StationError, StationResult};
pub use inventory::{InventoryRow, SubstanceDetail};
pub use payload::{OperationUnit, TaskPayload, UnitType};
pub use recipe::{GlobalParams, Recipe};
pub use resources::{ReadinessReport, ResourceAnalyzer, SupplyStatus};
pub use sink::{DataSink, FsDataSink, NullSink, SnapshotKind};
