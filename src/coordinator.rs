//! Run-time coordinator: the workflow driver over the station client
//!
//! Owns the session and the active task for the duration of a run. All
//! long-running operations poll with an interval and honor a deadline;
//! breaching it raises a timeout fault naming the stage. Recording goes
//! through the [`DataSink`] seam after every major transition.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::chemical::ChemicalDirectory;
use crate::client::{envelope, extract_i64, loose_f64, StationClient};
use crate::config::StationConfig;
use crate::constants::{self, codes, DeviceModuleStatus, StationState, TaskStatus};
use crate::error::{StationError, StationResult};
use crate::inventory::{aggregate_resource_rows, InventoryRow};
use crate::layout;
use crate::payload::TaskPayload;
use crate::resources::{AnalyzerOptions, ReadinessReport, ResourceAnalyzer};
use crate::sink::{DataSink, FsDataSink, NullSink, SnapshotKind};

/// Transfer-bin ring positions, filled in this fixed order during discharge
pub const DISCHARGE_RING: &[&str] = &[
    "TB-2-1", "TB-2-2", "TB-2-3", "TB-2-4", "TB-1-1", "TB-1-2", "TB-1-3", "TB-1-4",
];

/// Polling cadence and bound for one long-running operation
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    pub deadline: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            deadline: Duration::from_secs(600),
        }
    }
}

/// Gate checked before a task may start
#[derive(Debug, Clone, Copy)]
pub struct StartOptions {
    /// Verify glovebox water/oxygen before starting
    pub check_glovebox_env: bool,
    pub water_limit_ppm: f64,
    pub oxygen_limit_ppm: f64,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            check_glovebox_env: true,
            water_limit_ppm: 10.0,
            oxygen_limit_ppm: 10.0,
        }
    }
}

/// Discharge behavior knobs
#[derive(Debug, Clone)]
pub struct DischargeOptions {
    /// Warn and drop targets missing from the inventory instead of faulting
    pub ignore_missing: bool,
    pub move_type: String,
    pub poll: PollOptions,
    /// Zones never discharged (in-transit material)
    pub excluded_prefixes: Vec<String>,
}

impl Default for DischargeOptions {
    fn default() -> Self {
        Self {
            ignore_missing: true,
            move_type: "main_out".to_string(),
            poll: PollOptions {
                interval: Duration::from_secs(1),
                deadline: Duration::from_secs(900),
            },
            excluded_prefixes: layout::AIRLOCK_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// Submitted task: station id (when assigned) joined with the payload
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: Option<i64>,
    pub status: TaskStatus,
    pub payload: TaskPayload,
}

/// Trays a finished task touched, from its stored layout
#[derive(Debug, Clone, Default)]
pub struct TrayMapping {
    pub task_id: i64,
    pub reaction_trays: Vec<String>,
    pub sampling_trays: Vec<String>,
}

/// One source-to-ring assignment of a discharge run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DischargeAssignment {
    pub source: String,
    pub dst: String,
    /// Set for task-derived trays, None for plain empty trays
    pub task_id: Option<i64>,
}

/// Result of a discharge run
#[derive(Debug, Clone)]
pub struct DischargeOutcome {
    pub assignments: Vec<DischargeAssignment>,
    pub response: Value,
}

/// Outcome of a progress-polled task wait
#[derive(Debug, Clone)]
pub struct TaskProgress {
    pub task_id: i64,
    pub status: TaskStatus,
    /// Every step string observed, in first-seen order
    pub steps: Vec<String>,
}

/// Per-module device status row
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeviceStatus {
    pub device_name: String,
    pub status: String,
    pub status_code: Option<i64>,
}

/// Counters from a chemical registry alignment pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlignmentSummary {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// Tabular load-in request: (position, tray kind text, content cell)
#[derive(Debug, Clone)]
pub struct BatchInRow {
    /// Target tray position, e.g. "W-2-1"
    pub position: String,
    /// Tray kind, either a bare code or "name(code)" text
    pub tray_kind: String,
    /// For media trays: `slot|substance|amount;...`; for consumable trays: count
    pub content: String,
}

pub struct Coordinator {
    client: StationClient,
    sink: Arc<dyn DataSink>,
    record: bool,
}

impl Coordinator {
    pub fn new(config: StationConfig, sink: Arc<dyn DataSink>) -> StationResult<Self> {
        let record = config.enable_data_logging;
        Ok(Self {
            client: StationClient::new(config)?,
            sink,
            record,
        })
    }

    /// Build with the filesystem sink under the configured data dir, or the
    /// null sink when data logging is disabled.
    pub fn from_config(config: StationConfig) -> StationResult<Self> {
        let sink: Arc<dyn DataSink> = if config.enable_data_logging {
            Arc::new(FsDataSink::new(config.data_dir.clone())?)
        } else {
            Arc::new(NullSink)
        };
        Self::new(config, sink)
    }

    pub fn client(&self) -> &StationClient {
        &self.client
    }

    fn sink_write(&self, result: StationResult<()>) {
        if let Err(e) = result {
            warn!(error = %e, "sink write failed");
        }
    }

    fn snapshot(&self, kind: SnapshotKind, data: Value) {
        if self.record {
            self.sink_write(self.sink.snapshot(kind, &data));
        }
    }

    // ----- session -----

    /// Make sure a session token is cached; used before a run starts.
    pub async fn ensure_session(&self) -> StationResult<()> {
        self.client.ensure_login().await
    }

    // ----- state & environment -----

    /// Current station state code, with a state snapshot as a side effect.
    pub async fn station_state(&self) -> StationResult<i64> {
        let code = self.client.station_state().await?;
        let name = StationState::from_code(code)
            .map(StationState::name)
            .unwrap_or("UNKNOWN");
        self.snapshot(
            SnapshotKind::StationState,
            json!({ "state": name, "state_code": code }),
        );
        Ok(code)
    }

    /// Poll until the station is idle; log every transition.
    pub async fn wait_idle(&self, stage: &str, opts: &PollOptions) -> StationResult<()> {
        let deadline = Instant::now() + opts.deadline;
        let mut last_state: Option<i64> = None;
        loop {
            let state = self.station_state().await?;
            if Some(state) != last_state {
                debug!(stage, state, "station state");
                last_state = Some(state);
            }
            if state == StationState::IDLE_CODE {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(StationError::Timeout {
                    stage: stage.to_string(),
                    last_state,
                });
            }
            sleep(opts.interval).await;
        }
    }

    /// Initialize the station and wait for idleness.
    ///
    /// Afterwards, any 125 mL solvent bottle tray found on W-1-1..W-1-4 has
    /// its shelf homed; failures there are logged, never raised.
    pub async fn device_init(&self, opts: &PollOptions) -> StationResult<Value> {
        let response = self.client.device_init().await?;
        info!("station initialization commanded");
        self.wait_idle("device init", opts).await?;
        info!("station initialization finished");
        self.home_w1_shelves_best_effort().await;
        Ok(response)
    }

    async fn home_w1_shelves_best_effort(&self) {
        let rows = match self.get_resource_info().await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "could not scan W-1 shelves after init");
                return;
            }
        };

        // W-1-1 commands the 1/2 pair, W-1-3 the 3/4 pair.
        let controlled: [(&str, i64); 4] =
            [("W-1-1", 1), ("W-1-2", 1), ("W-1-3", 3), ("W-1-4", 3)];
        let mut shelves: Vec<i64> = Vec::new();
        for row in &rows {
            if row.resource_type != Some(codes::REAGENT_BOTTLE_TRAY_125ML) {
                continue;
            }
            if let Some((_, num)) = controlled.iter().find(|(pos, _)| *pos == row.layout_code) {
                if !shelves.contains(num) {
                    info!(position = %row.layout_code, "125 mL bottle tray detected");
                    shelves.push(*num);
                }
            }
        }
        shelves.sort_unstable();

        for num in shelves {
            match self.client.single_control_w1_shelf("FSY", "home", num).await {
                Ok(_) => info!(shelf = num, "W-1 shelf homed"),
                Err(e) => error!(shelf = num, error = %e, "W-1 shelf homing failed"),
            }
        }
    }

    /// Glovebox atmosphere, with a snapshot as a side effect.
    pub async fn glovebox_env(&self) -> StationResult<crate::client::GloveboxEnv> {
        let env = self.client.glovebox_env().await?;
        self.snapshot(
            SnapshotKind::GloveboxEnv,
            json!({
                "pressure_pa": env.box_pressure,
                "humidity_ppm": env.water_ppm,
                "oxygen_ppm": env.oxygen_ppm,
            }),
        );
        Ok(env)
    }

    /// Per-module device status names.
    pub async fn list_device_status(&self) -> StationResult<Vec<DeviceStatus>> {
        let raw = self.client.get_all_device_info().await?;
        let container = envelope(&raw);
        let stations = container
            .get("station_data")
            .or_else(|| raw.get("station_data"))
            .and_then(Value::as_array)
            .ok_or_else(|| StationError::Response {
                endpoint: "/api/getAllDeviceInfo".to_string(),
                detail: "no station_data list".to_string(),
            })?;

        let mut result = Vec::new();
        for station in stations {
            let Some(devices) = station.get("device_info").and_then(Value::as_array) else {
                continue;
            };
            for device in devices {
                let status_code = device.get("status").and_then(Value::as_i64);
                let status = status_code
                    .and_then(DeviceModuleStatus::from_code)
                    .map(DeviceModuleStatus::name)
                    .unwrap_or("UNKNOWN");
                result.push(DeviceStatus {
                    device_name: device
                        .get("device_name")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    status: status.to_string(),
                    status_code,
                });
            }
        }
        debug!(devices = result.len(), "device status collected");
        self.snapshot(SnapshotKind::DeviceStatus, json!({ "devices": &result }));
        Ok(result)
    }

    /// Station-wide setup parameters from GetSetUp.
    pub async fn get_setup_params(&self) -> StationResult<Map<String, Value>> {
        let raw = self.client.get_set_up().await?;
        let container = envelope(&raw);
        let mut out = Map::new();
        let required = [
            "addition_timeout",
            "accuracy",
            "liquid_threshold",
            "substance_shortage_nums",
        ];
        let mut missing = Vec::new();
        for key in required {
            match container.get(key).or_else(|| raw.get(key)) {
                Some(value) => {
                    out.insert(key.to_string(), value.clone());
                }
                None => missing.push(key),
            }
        }
        if !missing.is_empty() {
            return Err(StationError::Response {
                endpoint: "/api/GetSetUp".to_string(),
                detail: format!("missing keys {:?}", missing),
            });
        }
        Ok(out)
    }

    // ----- inventory -----

    /// Aggregated per-position inventory rows, with a snapshot side effect.
    pub async fn get_resource_info(&self) -> StationResult<Vec<InventoryRow>> {
        let list = self.client.get_resource_list().await?;
        let rows = aggregate_resource_rows(&list);
        self.snapshot(SnapshotKind::ResourceInfo, json!({ "resources": &rows }));
        Ok(rows)
    }

    /// Tray positions currently reporting zero usable count.
    pub async fn list_empty_trays(&self) -> StationResult<Vec<InventoryRow>> {
        let rows = self.get_resource_info().await?;
        Ok(rows.into_iter().filter(|r| r.count == 0).collect())
    }

    // ----- readiness -----

    /// Run the local readiness analysis against the live inventory and,
    /// when it passes and a task id is known, the station-side audit.
    pub async fn analyze_resources(
        &self,
        payload: &TaskPayload,
        chemicals: &ChemicalDirectory,
        task_id: Option<i64>,
    ) -> StationResult<ReadinessReport> {
        let inventory = self.get_resource_info().await?;
        let mut report =
            ResourceAnalyzer::with_options(chemicals, AnalyzerOptions::default())
                .analyze(payload, &inventory);

        if report.ready {
            info!("local resource check passed");
            if let Some(id) = task_id {
                match self.client.check_task_resource(id).await {
                    Ok(verdict) => {
                        let code = verdict.get("code").and_then(Value::as_i64).unwrap_or(200);
                        let message = station_check_message(&verdict);
                        report.apply_station_check(code, message);
                    }
                    Err(e) => {
                        // Best-effort secondary check; the local verdict stands.
                        warn!(error = %e, "station-side resource check unavailable");
                    }
                }
            }
        }

        if let Some(id) = task_id {
            if self.record {
                if let Ok(value) = serde_json::to_value(&report) {
                    self.sink_write(self.sink.resource_check(&id.to_string(), &value));
                }
            }
        }
        Ok(report)
    }

    // ----- task lifecycle -----

    /// Create the task on the station and record it.
    pub async fn submit_task(&self, payload: TaskPayload) -> StationResult<TaskHandle> {
        let (task_id, _response) = self.client.add_task(&payload).await?;
        info!(?task_id, task_name = %payload.task_name, "task submitted");
        if let Some(id) = task_id {
            if self.record {
                let key = id.to_string();
                self.sink_write(self.sink.task_create(
                    &key,
                    &json!({ "task_id": key, "status": TaskStatus::Unstarted.name() }),
                ));
                if let Ok(value) = serde_json::to_value(&payload) {
                    self.sink_write(self.sink.task_payload(&key, &value));
                }
            }
        }
        Ok(TaskHandle {
            task_id,
            status: TaskStatus::Unstarted,
            payload,
        })
    }

    /// Start a task after the idle and glovebox gates.
    ///
    /// With no task id, the newest UNSTARTED task is chosen.
    pub async fn start_task(
        &self,
        task_id: Option<i64>,
        opts: &StartOptions,
    ) -> StationResult<i64> {
        let state = self.station_state().await?;
        if state != StationState::IDLE_CODE {
            return Err(StationError::Validation(format!(
                "station is not idle (state {}), refusing to start",
                state
            )));
        }

        if opts.check_glovebox_env {
            let env = self.glovebox_env().await?;
            let water = env.water_ppm.ok_or_else(|| {
                StationError::Validation("glovebox water reading missing".into())
            })?;
            let oxygen = env.oxygen_ppm.ok_or_else(|| {
                StationError::Validation("glovebox oxygen reading missing".into())
            })?;
            if water >= opts.water_limit_ppm {
                return Err(StationError::Validation(format!(
                    "glovebox water {}ppm over the {}ppm limit",
                    water, opts.water_limit_ppm
                )));
            }
            if oxygen >= opts.oxygen_limit_ppm {
                return Err(StationError::Validation(format!(
                    "glovebox oxygen {}ppm over the {}ppm limit",
                    oxygen, opts.oxygen_limit_ppm
                )));
            }
        }

        let target = match task_id {
            Some(id) => id,
            None => self.latest_task_with_status(TaskStatus::Unstarted).await?,
        };

        info!(task_id = target, "starting task");
        self.client.start_task(target).await?;
        if self.record {
            self.sink_write(
                self.sink
                    .task_status(&target.to_string(), TaskStatus::Running.name()),
            );
        }
        Ok(target)
    }

    /// Poll a running task to a terminal status, streaming step deltas.
    ///
    /// With no task id the newest RUNNING task is picked, retrying three
    /// times ten seconds apart before giving up.
    pub async fn wait_task_with_progress(
        &self,
        task_id: Option<i64>,
        opts: &PollOptions,
    ) -> StationResult<TaskProgress> {
        let target = match task_id {
            Some(id) => id,
            None => self.find_running_task().await?,
        };
        info!(task_id = target, "watching task progress");

        let deadline = Instant::now() + opts.deadline;
        let mut seen: HashSet<String> = HashSet::new();
        let mut steps: Vec<String> = Vec::new();

        loop {
            let info = self.client.get_task_info(target).await?;
            let status = extract_i64(&info, &["status"]).and_then(TaskStatus::from_code);

            if let Some(status) = status {
                if status.is_terminal() {
                    if status == TaskStatus::Completed {
                        info!(task_id = target, "task completed");
                    } else {
                        warn!(task_id = target, status = status.name(), "task ended early");
                    }
                    if self.record {
                        self.sink_write(
                            self.sink.task_status(&target.to_string(), status.name()),
                        );
                    }
                    return Ok(TaskProgress {
                        task_id: target,
                        status,
                        steps,
                    });
                }
            }

            let op_info = self.client.get_task_op_info(target).await?;
            for step in format_steps(&op_info) {
                // Insertion-ordered set: the delta stream never repeats.
                if seen.insert(step.clone()) {
                    info!(task_id = target, step = %step, "progress");
                    steps.push(step);
                }
            }

            if Instant::now() > deadline {
                return Err(StationError::Timeout {
                    stage: "task progress".to_string(),
                    last_state: status.map(TaskStatus::code),
                });
            }
            sleep(opts.interval).await;
        }
    }

    async fn find_running_task(&self) -> StationResult<i64> {
        for attempt in 0..3 {
            if attempt > 0 {
                sleep(Duration::from_secs(10)).await;
            }
            let listing = self
                .client
                .get_task_list("desc", 0, 20, Some(&[TaskStatus::Running.code()]))
                .await?;
            let running: Vec<i64> = tasks_of(&listing)
                .iter()
                .filter(|t| {
                    task_status_of(t) == Some(TaskStatus::Running.code())
                })
                .filter_map(|t| extract_i64(t, &["task_id"]))
                .collect();
            if let Some(max) = running.into_iter().max() {
                return Ok(max);
            }
        }
        Err(StationError::Validation("no running task found".into()))
    }

    async fn latest_task_with_status(&self, wanted: TaskStatus) -> StationResult<i64> {
        let listing = self.client.get_task_list("desc", 0, 50, None).await?;
        let candidate = tasks_of(&listing)
            .iter()
            .filter(|t| task_status_of(t) == Some(wanted.code()))
            .filter_map(|t| extract_i64(t, &["task_id"]))
            .max();
        candidate.ok_or_else(|| {
            StationError::Validation(format!("no {} task found", wanted.name()))
        })
    }

    /// All tasks, sized by a one-row probe of `task_sums`.
    pub async fn get_all_tasks(&self) -> StationResult<Value> {
        let probe = self.client.get_task_list("desc", 0, 1, None).await?;
        let total = extract_i64(&probe, &["task_sums"]).ok_or_else(|| StationError::Response {
            endpoint: "/api/GetTaskList".to_string(),
            detail: "no task_sums field".to_string(),
        })?;
        self.client.get_task_list("desc", 0, total.max(1), None).await
    }

    /// Reaction and sampling trays recorded in a task's stored layout.
    pub async fn get_task_tray_mapping(&self, task_id: i64) -> StationResult<TrayMapping> {
        let info = self.client.get_task_info(task_id).await?;
        let container = envelope(&info);
        let units = container
            .get("layout_list")
            .or_else(|| container.get("unit_list"))
            .or_else(|| info.get("layout_list"))
            .and_then(Value::as_array)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                StationError::Validation(format!(
                    "task {} has no stored layout to derive trays from",
                    task_id
                ))
            })?;

        let mut reaction: HashSet<String> = HashSet::new();
        let mut sampling: HashSet<String> = HashSet::new();
        for unit in units {
            if let Some(code) = unit.get("layout_code").and_then(Value::as_str) {
                if code.contains(':') {
                    reaction.insert(layout::zone_of(code).to_string());
                }
            }
            if unit.get("unit_type").and_then(Value::as_str) == Some("exp_filtering_sample") {
                if let Some(code) = unit
                    .get("process_json")
                    .and_then(|p| p.get("sampling_layout_code"))
                    .and_then(Value::as_str)
                {
                    if code.contains(':') {
                        sampling.insert(layout::zone_of(code).to_string());
                    }
                }
            }
        }

        let mut mapping = TrayMapping {
            task_id,
            reaction_trays: reaction.into_iter().collect(),
            sampling_trays: sampling.into_iter().collect(),
        };
        mapping.reaction_trays.sort();
        mapping.sampling_trays.sort();
        debug!(
            task_id,
            reaction = ?mapping.reaction_trays,
            sampling = ?mapping.sampling_trays,
            "task tray mapping"
        );
        Ok(mapping)
    }

    // ----- material load-in -----

    /// Load trays in, bracketed by idle waits, and record the operation.
    pub async fn batch_in_tray(
        &self,
        resource_req_list: &[Value],
        task_id: Option<i64>,
        opts: &PollOptions,
    ) -> StationResult<Value> {
        if resource_req_list.is_empty() {
            return Err(StationError::Validation(
                "resource_req_list must not be empty".into(),
            ));
        }
        let start_time = Utc::now().to_rfc3339();

        self.wait_idle("before load-in", opts).await?;
        info!(trays = resource_req_list.len(), "station idle, loading in");
        let response = self.client.batch_in_tray(resource_req_list).await?;
        self.wait_idle("after load-in", opts).await?;
        info!("load-in finished");

        if self.record {
            self.sink_write(self.sink.batch_in_log(&json!({
                "start_time": start_time,
                "end_time": Utc::now().to_rfc3339(),
                "task_id": task_id,
                "requests": resource_req_list,
            })));
        }
        Ok(response)
    }

    /// Build a BatchInTray payload from tabular rows, validating slots,
    /// capacities and substances along the way.
    pub async fn build_batch_in_tray_payload(
        &self,
        rows: &[BatchInRow],
    ) -> StationResult<Vec<Value>> {
        let mut chem_cache: HashMap<String, Option<i64>> = HashMap::new();
        let mut requests: Vec<Value> = Vec::new();

        for row in rows {
            let position = row.position.trim();
            if position.is_empty() {
                continue;
            }
            let Some(tray_code) = parse_tray_code(&row.tray_kind) else {
                warn!(position, kind = %row.tray_kind, "unparsable tray kind, skipping");
                continue;
            };
            let grid = constants::tray_grid(tray_code);

            let mut resource_list: Vec<Value> = vec![json!({
                "layout_code": format!("{}:-1", position),
                "resource_type": tray_code.to_string(),
            })];

            if let Some(media) = media_for_tray(tray_code) {
                for segment in row.content.split(';') {
                    let segment = segment.trim();
                    if segment.is_empty() {
                        continue;
                    }
                    let parts: Vec<&str> = segment.split('|').map(str::trim).collect();
                    if parts.len() < 3 {
                        warn!(position, segment, "malformed load-in entry, skipping");
                        continue;
                    }
                    let (slot_text, substance, amount_text) = (parts[0], parts[1], parts[2]);
                    let slot = resolve_slot(slot_text, position, grid)?;
                    let (raw_value, raw_unit) = crate::amount::parse_amount(amount_text);
                    let (value, unit) = crate::amount::normalize(
                        raw_value,
                        &raw_unit,
                        media.phase,
                        media.default_unit,
                    );
                    let chemical_id = self
                        .resolve_chemical_id(substance, &mut chem_cache)
                        .await?;

                    let mut item = json!({
                        "layout_code": format!("{}:{}", position, slot),
                        "resource_type": media.code.to_string(),
                        "with_cap": media.with_cap,
                        "substance": substance,
                        "unit": unit,
                        "chemical_id": chemical_id,
                    });
                    match media.phase {
                        crate::amount::PhaseKind::Volume => item["initial_volume"] = json!(value),
                        crate::amount::PhaseKind::Weight => item["initial_weight"] = json!(value),
                    }
                    resource_list.push(item);
                }
            } else {
                // Consumable tray: the content cell is a count.
                let qty: i64 = row.content.trim().parse().map_err(|_| {
                    StationError::Validation(format!(
                        "tray {} consumable count '{}' is not a number",
                        position, row.content
                    ))
                })?;
                if qty <= 0 {
                    return Err(StationError::Validation(format!(
                        "tray {} consumable count must be positive",
                        position
                    )));
                }
                if let Some((cols, rows_n)) = grid {
                    let capacity = (cols * rows_n) as i64;
                    if qty > capacity {
                        return Err(StationError::Validation(format!(
                            "tray {} count {} exceeds capacity {}",
                            position, qty, capacity
                        )));
                    }
                }
                let consumable = constants::tray_consumable(tray_code).unwrap_or(tray_code);
                for idx in 0..qty {
                    resource_list.push(json!({
                        "layout_code": format!("{}:{}", position, idx),
                        "resource_type": consumable.to_string(),
                        "with_cap": false,
                    }));
                }
            }

            requests.push(json!({ "remark": "", "resource_list": resource_list }));
        }

        info!(trays = requests.len(), "load-in payload built");
        Ok(requests)
    }

    async fn resolve_chemical_id(
        &self,
        substance: &str,
        cache: &mut HashMap<String, Option<i64>>,
    ) -> StationResult<i64> {
        if let Some(cached) = cache.get(substance) {
            return cached.ok_or_else(|| {
                StationError::Validation(format!("chemical '{}' not found on station", substance))
            });
        }
        let page = self.client.chemical_list(Some(substance), 0, 10).await?;
        let exact = page
            .items
            .iter()
            .find(|c| c.get("name").and_then(Value::as_str).map(str::trim) == Some(substance))
            .or_else(|| page.items.first());
        let id = exact.and_then(|c| extract_i64(c, &["fid", "chemical_id"]));
        cache.insert(substance.to_string(), id);
        id.ok_or_else(|| {
            StationError::Validation(format!("chemical '{}' not found on station", substance))
        })
    }

    // ----- discharge -----

    /// Discharge a finished task's trays together with all empty trays.
    pub async fn discharge_task_and_empty_trays(
        &self,
        task_id: Option<i64>,
        opts: &DischargeOptions,
    ) -> StationResult<DischargeOutcome> {
        self.discharge(task_id, true, true, opts).await
    }

    /// Discharge only the trays a finished task touched.
    pub async fn discharge_task_trays(
        &self,
        task_id: Option<i64>,
        opts: &DischargeOptions,
    ) -> StationResult<DischargeOutcome> {
        self.discharge(task_id, true, false, opts).await
    }

    /// Discharge only the currently empty trays.
    pub async fn discharge_empty_trays(
        &self,
        opts: &DischargeOptions,
    ) -> StationResult<DischargeOutcome> {
        self.discharge(None, false, true, opts).await
    }

    async fn discharge(
        &self,
        task_id: Option<i64>,
        include_task: bool,
        include_empty: bool,
        opts: &DischargeOptions,
    ) -> StationResult<DischargeOutcome> {
        // Tray info is only consistent once the machine has settled.
        self.wait_idle("waiting for task completion", &opts.poll).await?;

        let mut task_trays: Vec<String> = Vec::new();
        let mut resolved_task: Option<i64> = None;
        if include_task {
            let target = match task_id {
                Some(id) => id,
                None => self.latest_task_with_status(TaskStatus::Completed).await?,
            };
            resolved_task = Some(target);
            let mapping = self.get_task_tray_mapping(target).await?;
            let mut set: HashSet<String> = mapping.reaction_trays.into_iter().collect();
            set.extend(mapping.sampling_trays);
            task_trays = set.into_iter().collect();
            task_trays.sort();
        }

        let inventory = self.get_resource_info().await?;
        let mut empty_trays: Vec<String> = Vec::new();
        if include_empty {
            empty_trays = inventory
                .iter()
                .filter(|r| r.count == 0)
                .map(|r| r.layout_code.clone())
                .collect();
            empty_trays.sort();
        }

        let prefixes: Vec<&str> = opts.excluded_prefixes.iter().map(|s| s.as_str()).collect();
        let excluded: Vec<String> = task_trays
            .iter()
            .chain(empty_trays.iter())
            .filter(|c| layout::is_excluded_zone(c, &prefixes))
            .cloned()
            .collect();
        if !excluded.is_empty() {
            info!(?excluded, "skipping in-transit trays");
        }
        task_trays.retain(|c| !layout::is_excluded_zone(c, &prefixes));
        empty_trays.retain(|c| !layout::is_excluded_zone(c, &prefixes));

        let task_set: HashSet<String> = task_trays.iter().cloned().collect();
        // Task trays first, then plain empties; both groups stay sorted.
        let mut targets: Vec<(String, bool)> =
            task_trays.iter().map(|c| (c.clone(), true)).collect();
        targets.extend(
            empty_trays
                .iter()
                .filter(|c| !task_set.contains(*c))
                .map(|c| (c.clone(), false)),
        );

        if targets.is_empty() {
            return Err(StationError::Validation(
                "no tray positions to discharge".into(),
            ));
        }

        let by_code: HashMap<&str, &InventoryRow> = inventory
            .iter()
            .map(|r| (r.layout_code.as_str(), r))
            .collect();
        let missing: Vec<String> = targets
            .iter()
            .filter(|(code, _)| !by_code.contains_key(code.as_str()))
            .map(|(code, _)| code.clone())
            .collect();
        if !missing.is_empty() {
            if opts.ignore_missing {
                warn!(?missing, "targets not in inventory, dropping");
                targets.retain(|(code, _)| by_code.contains_key(code.as_str()));
            } else {
                return Err(StationError::Validation(format!(
                    "discharge targets missing from inventory: {:?}",
                    missing
                )));
            }
        }
        if targets.is_empty() {
            return Err(StationError::Validation(
                "nothing left to discharge after validation".into(),
            ));
        }
        if targets.len() > DISCHARGE_RING.len() {
            return Err(StationError::Validation(format!(
                "{} trays to discharge but the transfer ring only holds {}",
                targets.len(),
                DISCHARGE_RING.len()
            )));
        }

        let start_time = Utc::now().to_rfc3339();
        let mut assignments: Vec<DischargeAssignment> = Vec::new();
        let mut wire_items: Vec<Value> = Vec::new();
        let mut log_resources: Vec<Value> = Vec::new();
        for (idx, (code, from_task)) in targets.iter().enumerate() {
            let dst = DISCHARGE_RING[idx].to_string();
            let row = by_code.get(code.as_str());
            wire_items.push(json!({
                "layout_code": code,
                "resource_type": row.and_then(|r| r.resource_type),
                "dst_layout_code": dst,
            }));
            log_resources.push(json!({
                "layout_code": code,
                "dst_layout_code": dst,
                "task_id": if *from_task { resolved_task } else { None },
                "count": row.map(|r| r.count),
                "resource_type": row.and_then(|r| r.resource_type),
                "resource_type_name": row.map(|r| r.resource_type_name.clone()),
                "substance_details": row.map(|r| r.substance_details.clone()),
            }));
            assignments.push(DischargeAssignment {
                source: code.clone(),
                dst,
                task_id: if *from_task { resolved_task } else { None },
            });
        }

        info!(
            task_id = ?resolved_task,
            plan = ?assignments
                .iter()
                .map(|a| format!("{}->{}", a.source, a.dst))
                .collect::<Vec<_>>(),
            "discharging trays"
        );
        let response = self.client.batch_out_tray(&wire_items, &opts.move_type).await?;
        self.wait_idle("after discharge", &opts.poll).await?;
        info!(trays = assignments.len(), "discharge finished");

        if self.record {
            let log = json!({
                "start_time": start_time,
                "end_time": Utc::now().to_rfc3339(),
                "task_id": resolved_task,
                "resources": log_resources,
            });
            self.sink_write(self.sink.batch_out_log(&log));
            self.sink_write(
                self.sink
                    .task_discharge(resolved_task.map(|id| id.to_string()).as_deref(), &log),
            );
        }

        Ok(DischargeOutcome {
            assignments,
            response,
        })
    }

    // ----- chemical registry alignment -----

    /// Align the station chemical registry with the local directory and
    /// back-fill station ids. `auto_delete` removes station chemicals the
    /// directory does not know.
    pub async fn align_chemicals(
        &self,
        directory: &mut ChemicalDirectory,
        auto_delete: bool,
    ) -> StationResult<AlignmentSummary> {
        let probe = self.client.chemical_list(None, 0, 1).await?;
        let total = probe.total.unwrap_or(1000).max(1);
        let page = self.client.chemical_list(None, 0, total).await?;

        let mut station_by_name: HashMap<String, &Value> = HashMap::new();
        for item in &page.items {
            if let Some(name) = item.get("name").and_then(Value::as_str) {
                let trimmed = name.trim();
                if !trimmed.is_empty() {
                    station_by_name.insert(trimmed.to_string(), item);
                }
            }
        }

        let mut summary = AlignmentSummary::default();
        let mut assigned: Vec<(String, i64)> = Vec::new();
        let local: Vec<(String, Option<String>, String)> = directory
            .iter()
            .map(|c| {
                (
                    c.name.clone(),
                    c.cas.clone(),
                    c.state.name().to_string(),
                )
            })
            .collect();

        for (name, cas, state) in &local {
            match station_by_name.get(name.as_str()) {
                None => {
                    let mut payload = json!({ "name": name });
                    if let Some(cas) = cas {
                        payload["cas"] = json!(cas);
                    }
                    payload["state"] = json!(state);
                    let response = self.client.add_chemical(&payload).await?;
                    summary.added += 1;
                    if let Some(fid) = extract_i64(&response, &["fid", "chemical_id"]) {
                        assigned.push((name.clone(), fid));
                    }
                }
                Some(existing) => {
                    let fid = extract_i64(existing, &["fid", "chemical_id"]);
                    if let Some(fid) = fid {
                        assigned.push((name.clone(), fid));
                    }

                    let station_cas = existing
                        .get("cas")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .trim()
                        .to_string();
                    let station_state = existing
                        .get("state")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .trim()
                        .to_string();
                    let cas_differs = cas
                        .as_deref()
                        .map(|c| !c.is_empty() && c != station_cas)
                        .unwrap_or(false);
                    let state_differs = !state.is_empty() && *state != station_state;

                    if cas_differs || state_differs {
                        let mut payload = (*existing).clone();
                        if let Some(cas) = cas {
                            payload["cas"] = json!(cas);
                        }
                        payload["state"] = json!(state);
                        if let Some(fid) = fid {
                            payload["fid"] = json!(fid);
                        }
                        self.client.update_chemical(&payload).await?;
                        summary.updated += 1;
                    }
                }
            }
        }

        if auto_delete {
            let local_names: HashSet<&str> = local.iter().map(|(n, _, _)| n.as_str()).collect();
            for (name, item) in &station_by_name {
                if local_names.contains(name.as_str()) {
                    continue;
                }
                if let Some(fid) = extract_i64(item, &["fid", "chemical_id"]) {
                    self.client.delete_chemical(fid).await?;
                    summary.deleted += 1;
                }
            }
        }

        // The name-to-id map is rebuilt from scratch on every alignment.
        for (name, fid) in assigned {
            directory.set_station_id(&name, fid);
        }

        info!(
            added = summary.added,
            updated = summary.updated,
            deleted = summary.deleted,
            "chemical alignment finished"
        );
        Ok(summary)
    }

    /// Drop task records older than the configured retention window.
    pub fn retention_sweep(&self) -> StationResult<usize> {
        let days = self.client.config().task_retention_days;
        let removed = self.sink.retention_sweep(days)?;
        if removed > 0 {
            info!(removed, days, "retention sweep removed old task records");
        }
        Ok(removed)
    }
}

/// Media (bottle/bucket) description for a tray class
struct TrayMedia {
    code: i64,
    with_cap: bool,
    phase: crate::amount::PhaseKind,
    default_unit: &'static str,
}

fn media_for_tray(tray_code: i64) -> Option<TrayMedia> {
    use crate::amount::PhaseKind;
    match tray_code {
        codes::REAGENT_BOTTLE_TRAY_2ML => Some(TrayMedia {
            code: codes::REAGENT_BOTTLE_2ML,
            with_cap: true,
            phase: PhaseKind::Volume,
            default_unit: "mL",
        }),
        codes::REAGENT_BOTTLE_TRAY_8ML => Some(TrayMedia {
            code: codes::REAGENT_BOTTLE_8ML,
            with_cap: true,
            phase: PhaseKind::Volume,
            default_unit: "mL",
        }),
        codes::REAGENT_BOTTLE_TRAY_40ML => Some(TrayMedia {
            code: codes::REAGENT_BOTTLE_40ML,
            with_cap: true,
            phase: PhaseKind::Volume,
            default_unit: "mL",
        }),
        codes::REAGENT_BOTTLE_TRAY_125ML => Some(TrayMedia {
            code: codes::REAGENT_BOTTLE_125ML,
            with_cap: true,
            phase: PhaseKind::Volume,
            default_unit: "mL",
        }),
        codes::POWDER_BUCKET_TRAY_30ML => Some(TrayMedia {
            code: codes::POWDER_BUCKET_30ML,
            with_cap: false,
            phase: PhaseKind::Weight,
            default_unit: "mg",
        }),
        _ => None,
    }
}

/// Extract a tray code from either a bare number or "name(code)" text.
fn parse_tray_code(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    if let Ok(code) = trimmed.parse::<i64>() {
        return Some(code);
    }
    let open = trimmed.rfind('(')?;
    let close = trimmed.rfind(')')?;
    if close <= open {
        return None;
    }
    let digits: String = trimmed[open + 1..close]
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Resolve a load-in slot cell: bare index or well label, range-checked.
fn resolve_slot(
    slot_text: &str,
    position: &str,
    grid: Option<(u32, u32)>,
) -> StationResult<u32> {
    if let Ok(index) = slot_text.parse::<u32>() {
        if let Some((cols, rows)) = grid {
            if index >= cols * rows {
                return Err(StationError::Validation(format!(
                    "tray {} slot {} outside its {}x{} grid",
                    position, index, cols, rows
                )));
            }
        }
        return Ok(index);
    }
    let Some((cols, rows)) = grid else {
        return Err(StationError::Validation(format!(
            "tray {} slot '{}' cannot be resolved without a grid",
            position, slot_text
        )));
    };
    layout::well_to_slot(slot_text, cols, rows).map_err(|_| {
        StationError::Validation(format!(
            "tray {} slot '{}' is neither an index nor a valid well",
            position, slot_text
        ))
    })
}

fn tasks_of(listing: &Value) -> Vec<Value> {
    for source in [listing, envelope(listing)] {
        if let Some(list) = source.get("task_list").and_then(Value::as_array) {
            return list.clone();
        }
    }
    Vec::new()
}

fn task_status_of(task: &Value) -> Option<i64> {
    match task.get("status") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn station_check_message(verdict: &Value) -> String {
    let msg = verdict.get("msg").and_then(Value::as_str).unwrap_or("");
    if let Some(prompt) = verdict.get("prompt_msg") {
        let resource = prompt
            .get("resource_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown resource");
        let number = loose_f64(prompt.get("number")).unwrap_or(0.0);
        return format!("{}: {} short by {}", msg, resource, number);
    }
    msg.to_string()
}

/// Flatten done and running unit traces into "unit: action -> target" lines.
fn format_steps(op_info: &Value) -> Vec<String> {
    let mut result = Vec::new();
    let container = envelope(op_info);
    for key in ["done_units", "running_units"] {
        let Some(units) = container
            .get(key)
            .or_else(|| op_info.get(key))
            .and_then(Value::as_array)
        else {
            continue;
        };
        for unit_obj in units {
            let Some(map) = unit_obj.as_object() else {
                continue;
            };
            for (unit_name, step_list) in map {
                let Some(step_items) = step_list.as_array() else {
                    continue;
                };
                for step in step_items {
                    let Some(parts) = step.as_array() else {
                        continue;
                    };
                    let action = parts
                        .first()
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .trim();
                    let target = parts
                        .get(1)
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .trim();
                    if target.is_empty() {
                        result.push(format!("{}: {}", unit_name, action));
                    } else {
                        result.push(format!("{}: {} -> {}", unit_name, action, target));
                    }
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_steps_flattens_done_and_running() {
        let op_info = json!({
            "done_units": [
                { "unit-1": [["add powder", "A"], ["stir", ""]] }
            ],
            "running_units": [
                { "unit-2": [["pipette", "B"]] }
            ]
        });
        let steps = format_steps(&op_info);
        assert_eq!(
            steps,
            vec![
                "unit-1: add powder -> A",
                "unit-1: stir",
                "unit-2: pipette -> B",
            ]
        );
    }

    #[test]
    fn parse_tray_code_accepts_bare_and_bracketed() {
        assert_eq!(parse_tray_code("201000502"), Some(201000502));
        assert_eq!(parse_tray_code("50 uL tip tray(201000815)"), Some(201000815));
        assert_eq!(parse_tray_code("mystery"), None);
    }

    #[test]
    fn resolve_slot_takes_indices_and_wells() {
        assert_eq!(resolve_slot("5", "W-2-1", Some((4, 3))).unwrap(), 5);
        assert_eq!(resolve_slot("B2", "W-2-1", Some((4, 3))).unwrap(), 5);
        assert!(resolve_slot("99", "W-2-1", Some((4, 3))).is_err());
        assert!(resolve_slot("Z9", "W-2-1", Some((4, 3))).is_err());
    }

    #[test]
    fn station_check_message_includes_prompt_details() {
        let verdict = json!({
            "code": 1200,
            "msg": "insufficient resources",
            "prompt_msg": { "resource_type": "2mL reaction tube", "number": 3 }
        });
        assert_eq!(
            station_check_message(&verdict),
            "insufficient resources: 2mL reaction tube short by 3"
        );
    }
}
