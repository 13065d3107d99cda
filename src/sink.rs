//! Data sink: append-only JSON records of everything the coordinator does
//!
//! The trait is the seam; the filesystem implementation writes
//! operator-readable JSON under one root:
//!
//! ```text
//! <root>/snapshots/{device_status,station_state,glovebox_env,resource_info}.json
//! <root>/tasks/<id>/{task_info,task_payload,resource_check,unload_info}.json
//! <root>/operations/{batch_in,batch_out}.jsonl
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{StationError, StationResult};

/// Snapshot families kept by the sink, latest-wins per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    DeviceStatus,
    StationState,
    GloveboxEnv,
    ResourceInfo,
}

impl SnapshotKind {
    fn file_name(self) -> &'static str {
        match self {
            Self::DeviceStatus => "device_status.json",
            Self::StationState => "station_state.json",
            Self::GloveboxEnv => "glovebox_env.json",
            Self::ResourceInfo => "resource_info.json",
        }
    }
}

/// Recording seam consumed by the coordinator and the analyzer.
///
/// Every write is side-effect-only; reads are idempotent by id/kind.
pub trait DataSink: Send + Sync {
    fn snapshot(&self, kind: SnapshotKind, data: &Value) -> StationResult<()>;
    fn task_create(&self, task_id: &str, info: &Value) -> StationResult<()>;
    fn task_status(&self, task_id: &str, status: &str) -> StationResult<()>;
    fn task_payload(&self, task_id: &str, payload: &Value) -> StationResult<()>;
    fn resource_check(&self, task_id: &str, report: &Value) -> StationResult<()>;
    fn task_discharge(&self, task_id: Option<&str>, log: &Value) -> StationResult<()>;
    fn batch_in_log(&self, entry: &Value) -> StationResult<()>;
    fn batch_out_log(&self, entry: &Value) -> StationResult<()>;
    /// Remove completed task records older than `days`; returns the count.
    fn retention_sweep(&self, days: i64) -> StationResult<usize>;
    fn load_snapshot(&self, kind: SnapshotKind) -> StationResult<Option<Value>>;
    fn load_task_record(&self, task_id: &str) -> StationResult<Option<Value>>;
}

/// Discards every record; for callers that do not keep history.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DataSink for NullSink {
    fn snapshot(&self, _kind: SnapshotKind, _data: &Value) -> StationResult<()> {
        Ok(())
    }
    fn task_create(&self, _task_id: &str, _info: &Value) -> StationResult<()> {
        Ok(())
    }
    fn task_status(&self, _task_id: &str, _status: &str) -> StationResult<()> {
        Ok(())
    }
    fn task_payload(&self, _task_id: &str, _payload: &Value) -> StationResult<()> {
        Ok(())
    }
    fn resource_check(&self, _task_id: &str, _report: &Value) -> StationResult<()> {
        Ok(())
    }
    fn task_discharge(&self, _task_id: Option<&str>, _log: &Value) -> StationResult<()> {
        Ok(())
    }
    fn batch_in_log(&self, _entry: &Value) -> StationResult<()> {
        Ok(())
    }
    fn batch_out_log(&self, _entry: &Value) -> StationResult<()> {
        Ok(())
    }
    fn retention_sweep(&self, _days: i64) -> StationResult<usize> {
        Ok(0)
    }
    fn load_snapshot(&self, _kind: SnapshotKind) -> StationResult<Option<Value>> {
        Ok(None)
    }
    fn load_task_record(&self, _task_id: &str) -> StationResult<Option<Value>> {
        Ok(None)
    }
}

/// Filesystem-backed sink
pub struct FsDataSink {
    root: PathBuf,
}

impl FsDataSink {
    pub fn new(root: impl Into<PathBuf>) -> StationResult<Self> {
        let root = root.into();
        for sub in ["snapshots", "tasks", "operations"] {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self { root })
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("tasks").join(task_id)
    }

    fn write_json(&self, path: &Path, data: &Value) -> StationResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(data)
            .map_err(|e| StationError::Sink(format!("serialize {}: {}", path.display(), e)))?;
        fs::write(path, text)?;
        debug!(path = %path.display(), "sink write");
        Ok(())
    }

    fn read_json(&self, path: &Path) -> StationResult<Option<Value>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)?;
        let value = serde_json::from_str(&text)
            .map_err(|e| StationError::Sink(format!("parse {}: {}", path.display(), e)))?;
        Ok(Some(value))
    }

    fn append_jsonl(&self, file: &str, entry: &Value) -> StationResult<()> {
        let mut stamped = entry.clone();
        if stamped.get("timestamp").is_none() {
            if let Some(map) = stamped.as_object_mut() {
                map.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
            }
        }
        let line = serde_json::to_string(&stamped)
            .map_err(|e| StationError::Sink(format!("serialize {}: {}", file, e)))?;
        let path = self.root.join("operations").join(file);
        let mut handle = fs::OpenOptions::new().create(true).append(true).open(path)?;
        handle.write_all(line.as_bytes())?;
        handle.write_all(b"\n")?;
        Ok(())
    }
}

impl DataSink for FsDataSink {
    fn snapshot(&self, kind: SnapshotKind, data: &Value) -> StationResult<()> {
        let mut stamped = data.clone();
        if stamped.get("timestamp").is_none() {
            if let Some(map) = stamped.as_object_mut() {
                map.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
            }
        }
        self.write_json(&self.snapshots_dir().join(kind.file_name()), &stamped)
    }

    fn task_create(&self, task_id: &str, info: &Value) -> StationResult<()> {
        let mut record = info.clone();
        if let Some(map) = record.as_object_mut() {
            map.entry("task_id".to_string())
                .or_insert_with(|| json!(task_id));
            map.entry("created_at".to_string())
                .or_insert_with(|| json!(Utc::now().to_rfc3339()));
        }
        self.write_json(&self.task_dir(task_id).join("task_info.json"), &record)
    }

    fn task_status(&self, task_id: &str, status: &str) -> StationResult<()> {
        let path = self.task_dir(task_id).join("task_info.json");
        let mut record = self
            .read_json(&path)?
            .unwrap_or_else(|| json!({ "task_id": task_id }));
        if let Some(map) = record.as_object_mut() {
            map.insert("status".to_string(), json!(status));
            let now = json!(Utc::now().to_rfc3339());
            match status {
                "RUNNING" => {
                    map.entry("started_at".to_string()).or_insert(now);
                }
                "COMPLETED" | "FAILED" | "STOPPED" => {
                    map.entry("completed_at".to_string()).or_insert(now);
                }
                _ => {}
            }
        }
        self.write_json(&path, &record)
    }

    fn task_payload(&self, task_id: &str, payload: &Value) -> StationResult<()> {
        self.write_json(&self.task_dir(task_id).join("task_payload.json"), payload)
    }

    fn resource_check(&self, task_id: &str, report: &Value) -> StationResult<()> {
        let mut record = report.clone();
        if let Some(map) = record.as_object_mut() {
            map.entry("task_id".to_string())
                .or_insert_with(|| json!(task_id));
            map.entry("timestamp".to_string())
                .or_insert_with(|| json!(Utc::now().to_rfc3339()));
        }
        self.write_json(&self.task_dir(task_id).join("resource_check.json"), &record)
    }

    fn task_discharge(&self, task_id: Option<&str>, log: &Value) -> StationResult<()> {
        match task_id {
            Some(id) => self.write_json(&self.task_dir(id).join("unload_info.json"), log),
            None => self.write_json(
                &self.root.join("operations").join("unload_unassigned.json"),
                log,
            ),
        }
    }

    fn batch_in_log(&self, entry: &Value) -> StationResult<()> {
        self.append_jsonl("batch_in.jsonl", entry)
    }

    fn batch_out_log(&self, entry: &Value) -> StationResult<()> {
        self.append_jsonl("batch_out.jsonl", entry)
    }

    fn retention_sweep(&self, days: i64) -> StationResult<usize> {
        let cutoff = Utc::now() - Duration::days(days.max(0));
        let tasks_dir = self.root.join("tasks");
        let mut removed = 0usize;

        for entry in fs::read_dir(&tasks_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let info_path = entry.path().join("task_info.json");
            let Some(info) = self.read_json(&info_path)? else {
                continue;
            };
            let status = info.get("status").and_then(Value::as_str).unwrap_or("");
            if !matches!(status, "COMPLETED" | "FAILED" | "STOPPED") {
                continue;
            }
            let Some(finished) = info
                .get("completed_at")
                .and_then(Value::as_str)
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            else {
                continue;
            };
            if finished.with_timezone(&Utc) < cutoff {
                match fs::remove_dir_all(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "sweep failed"),
                }
            }
        }
        Ok(removed)
    }

    fn load_snapshot(&self, kind: SnapshotKind) -> StationResult<Option<Value>> {
        self.read_json(&self.snapshots_dir().join(kind.file_name()))
    }

    fn load_task_record(&self, task_id: &str) -> StationResult<Option<Value>> {
        self.read_json(&self.task_dir(task_id).join("task_info.json"))
    }
}
