//! Typed client for the station upper-computer HTTP JSON API
//!
//! Thin by design: each method maps one endpoint, unwraps the vendor's
//! `result`/`data` envelopes and surfaces business codes as typed faults.
//! A 401 clears the cached token, re-logs-in once with the stored
//! credentials and replays the request exactly once; any further 401
//! propagates as an auth fault.

use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::StationConfig;
use crate::constants::GLOVEBOX_ENV_DEVICE_CODE;
use crate::error::{StationError, StationResult};
use crate::payload::TaskPayload;

/// Vendor business code for success
const CODE_OK: i64 = 200;
/// Vendor business code for a resource shortage
pub const CODE_RESOURCE_SHORTAGE: i64 = 1200;

/// Glovebox atmosphere snapshot
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct GloveboxEnv {
    pub time: Option<String>,
    pub box_pressure: Option<f64>,
    pub water_ppm: Option<f64>,
    pub oxygen_ppm: Option<f64>,
}

/// One page of the station chemical registry
#[derive(Debug, Clone, Default)]
pub struct ChemicalPage {
    pub items: Vec<Value>,
    pub total: Option<i64>,
}

pub struct StationClient {
    http: reqwest::Client,
    config: StationConfig,
    /// Cached (token_kind, access_token); None while unauthenticated
    token: Mutex<Option<(String, String)>>,
}

impl StationClient {
    pub fn new(config: StationConfig) -> StationResult<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs_f64(config.timeout_s))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| StationError::Config(format!("http client init failed: {}", e)))?;
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn has_token(&self) -> bool {
        self.token.lock().is_some()
    }

    pub fn clear_token(&self) {
        *self.token.lock() = None;
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Log in and cache the bearer token.
    pub async fn login(&self) -> StationResult<(String, String)> {
        let endpoint = self.url("/api/Token");
        let body = json!({
            "username": self.config.username,
            "password": self.config.password,
        });
        let response = self
            .http
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| StationError::Network {
                endpoint: endpoint.clone(),
                source: e,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(StationError::Auth(format!(
                "login rejected with HTTP {}",
                status.as_u16()
            )));
        }
        let data: Value = response.json().await.map_err(|e| StationError::Response {
            endpoint: endpoint.clone(),
            detail: e.to_string(),
        })?;
        let token = data
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| StationError::Auth("login response lacks access_token".into()))?
            .to_string();
        let kind = data
            .get("token_type")
            .and_then(Value::as_str)
            .unwrap_or("Bearer")
            .to_string();
        debug!(token_kind = %kind, "login succeeded");
        *self.token.lock() = Some((kind.clone(), token.clone()));
        Ok((kind, token))
    }

    /// Log in only when no token is cached.
    pub async fn ensure_login(&self) -> StationResult<()> {
        if !self.has_token() {
            self.login().await?;
        }
        Ok(())
    }

    /// Send one authenticated request; does not retry on its own.
    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
        query: Option<&[(&str, String)]>,
    ) -> StationResult<(StatusCode, Value)> {
        let endpoint = self.url(path);
        let mut request = self.http.request(method.clone(), &endpoint);
        if let Some((kind, token)) = self.token.lock().clone() {
            request = request.header("Authorization", format!("{} {}", kind, token));
        }
        if let Some(q) = query {
            request = request.query(q);
        }
        if let Some(b) = body {
            debug!(%endpoint, body = %mask_sensitive(b), "station request");
            request = request.json(b);
        } else {
            debug!(%endpoint, "station request");
        }

        let response = request.send().await.map_err(|e| StationError::Network {
            endpoint: endpoint.clone(),
            source: e,
        })?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Ok((status, Value::Null));
        }
        if status.as_u16() >= 400 {
            return Err(StationError::Http {
                endpoint,
                status: status.as_u16(),
            });
        }
        let data: Value = response.json().await.map_err(|e| StationError::Response {
            endpoint: endpoint.clone(),
            detail: format!("body is not JSON: {}", e),
        })?;
        debug!(%endpoint, response = %mask_sensitive(&data), "station response");
        Ok((status, data))
    }

    /// Authenticated request with the single re-login retry and business
    /// code checking. Codes listed in `soft_codes` return their body
    /// instead of faulting.
    async fn call_with_codes(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: Option<&[(&str, String)]>,
        soft_codes: &[i64],
    ) -> StationResult<Value> {
        self.ensure_login().await?;

        let (status, mut data) = self.send_once(&method, path, body, query).await?;
        if status == StatusCode::UNAUTHORIZED {
            warn!(%path, "authorization expired, re-logging in once");
            self.clear_token();
            self.login().await?;
            let (retry_status, retry_data) = self.send_once(&method, path, body, query).await?;
            if retry_status == StatusCode::UNAUTHORIZED {
                return Err(StationError::Auth(
                    "request kept returning 401 after re-login".into(),
                ));
            }
            data = retry_data;
        }

        if let Some(code) = data.get("code").and_then(Value::as_i64) {
            if code != CODE_OK && !soft_codes.contains(&code) {
                let msg = data
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                return Err(StationError::Api { code, msg });
            }
        }
        Ok(data)
    }

    async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> StationResult<Value> {
        self.call_with_codes(method, path, body, None, &[]).await
    }

    // ----- device & state -----

    /// Trigger full-station initialization.
    pub async fn device_init(&self) -> StationResult<Value> {
        self.call(Method::POST, "/api/DeviceInit", Some(&json!({})))
            .await
    }

    /// Whole-station state code.
    pub async fn station_state(&self) -> StationResult<i64> {
        let data = self.call(Method::GET, "/api/station/state", None).await?;
        extract_i64(&data, &["state", "status"]).ok_or_else(|| StationError::Response {
            endpoint: "/api/station/state".to_string(),
            detail: "no state/status field".to_string(),
        })
    }

    /// Full device module listing.
    pub async fn get_all_device_info(&self) -> StationResult<Value> {
        self.call(Method::POST, "/api/getAllDeviceInfo", Some(&json!({})))
            .await
    }

    /// Glovebox atmosphere from the runtime batch query.
    pub async fn glovebox_env(&self) -> StationResult<GloveboxEnv> {
        let body = json!({ "device_code_list": [GLOVEBOX_ENV_DEVICE_CODE] });
        let data = self
            .call(Method::POST, "/api/BatchListDeviceRuntimes", Some(&body))
            .await?;
        let list = envelope(&data);
        let first = list
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| StationError::Response {
                endpoint: "/api/BatchListDeviceRuntimes".to_string(),
                detail: "no glovebox runtime entry".to_string(),
            })?;
        Ok(GloveboxEnv {
            time: first
                .get("time")
                .and_then(Value::as_str)
                .map(str::to_string),
            box_pressure: loose_f64(first.get("box_pressure")),
            water_ppm: loose_f64(first.get("water_content")),
            oxygen_ppm: loose_f64(first.get("oxygen_content")),
        })
    }

    /// Station-wide setup parameters (GetSetUp).
    pub async fn get_set_up(&self) -> StationResult<Value> {
        self.call(Method::POST, "/api/GetSetUp", Some(&json!({})))
            .await
    }

    /// Home or push out a W-1 shelf pair; `num` selects the pair (1, 3, 5, 7).
    pub async fn single_control_w1_shelf(
        &self,
        station: &str,
        action: &str,
        num: i64,
    ) -> StationResult<Value> {
        if action != "home" && action != "outside" {
            return Err(StationError::Validation(format!(
                "shelf action must be 'home' or 'outside', got '{}'",
                action
            )));
        }
        if ![1, 3, 5, 7].contains(&num) {
            return Err(StationError::Validation(format!(
                "shelf num must be 1, 3, 5 or 7, got {}",
                num
            )));
        }
        let body = json!({ "action": action, "op": action, "num": num });
        self.call_with_codes(
            Method::POST,
            "/api/SingleControlW1Shelf",
            Some(&body),
            Some(&[("station", station.to_string())]),
            &[],
        )
        .await
    }

    // ----- resources & trays -----

    /// Flattened resource list, one entry per tray body or well.
    pub async fn get_resource_list(&self) -> StationResult<Vec<Value>> {
        let data = self
            .call(Method::POST, "/api/GetResourceInfo", Some(&json!({})))
            .await?;
        extract_resource_list(&data).ok_or_else(|| StationError::Response {
            endpoint: "/api/GetResourceInfo".to_string(),
            detail: "no resource_list field".to_string(),
        })
    }

    pub async fn batch_in_tray(&self, resource_req_list: &[Value]) -> StationResult<Value> {
        let body = json!({ "resource_req_list": resource_req_list });
        self.call(Method::POST, "/api/BatchInTray", Some(&body)).await
    }

    pub async fn batch_out_tray(
        &self,
        layout_list: &[Value],
        move_type: &str,
    ) -> StationResult<Value> {
        let body = json!({ "layout_list": layout_list, "move_type": move_type });
        self.call(Method::POST, "/api/BatchOutTray", Some(&body)).await
    }

    // ----- chemical registry -----

    pub async fn chemical_list(
        &self,
        query_key: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> StationResult<ChemicalPage> {
        let mut query: Vec<(&str, String)> = vec![
            ("sort", "desc".to_string()),
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(key) = query_key {
            query.push(("query_key", key.to_string()));
        }
        let data = self
            .call_with_codes(
                Method::GET,
                "/api/v1/knowledge/getChemicalList",
                None,
                Some(&query),
                &[],
            )
            .await?;
        let container = envelope(&data);
        let items = container
            .get("chemical_list")
            .or_else(|| data.get("chemical_list"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = extract_i64(&data, &["total", "chemical_sums"]);
        Ok(ChemicalPage { items, total })
    }

    pub async fn add_chemical(&self, payload: &Value) -> StationResult<Value> {
        self.call(Method::POST, "/api/v1/knowledge/addChemical", Some(payload))
            .await
    }

    pub async fn update_chemical(&self, payload: &Value) -> StationResult<Value> {
        self.call(Method::POST, "/api/v1/knowledge/updateChemical", Some(payload))
            .await
    }

    pub async fn delete_chemical(&self, chemical_id: i64) -> StationResult<Value> {
        self.call_with_codes(
            Method::POST,
            "/api/v1/knowledge/deleteChemical",
            None,
            Some(&[("chemical_id", chemical_id.to_string())]),
            &[],
        )
        .await
    }

    // ----- tasks -----

    /// Create a task; returns the station-assigned id when present.
    ///
    /// A duplicate task name is surfaced as a validation fault so callers
    /// can rename instead of dying on an opaque HTTP error.
    pub async fn add_task(&self, payload: &TaskPayload) -> StationResult<(Option<i64>, Value)> {
        let body = serde_json::to_value(payload).map_err(|e| StationError::Validation(format!(
            "task payload not serializable: {}",
            e
        )))?;
        let data = match self.call(Method::POST, "/api/AddTask", Some(&body)).await {
            Err(StationError::Http { status: 409, .. }) => {
                return Err(StationError::Validation(format!(
                    "task name '{}' already exists on the station; pick a new name",
                    payload.task_name
                )))
            }
            other => other?,
        };
        let task_id = extract_i64(&data, &["task_id"]);
        Ok((task_id, data))
    }

    /// Start a task. A vendor 1200 means the deck lacks material and is
    /// reported as a typed shortage, not a crash.
    pub async fn start_task(&self, task_id: i64) -> StationResult<Value> {
        let body = json!({ "task_id": task_id });
        match self.call(Method::POST, "/api/StartTask", Some(&body)).await {
            Err(StationError::Api { code, msg }) if code == CODE_RESOURCE_SHORTAGE => {
                Err(StationError::ResourceShortage(msg))
            }
            other => other,
        }
    }

    pub async fn stop_task(&self, task_id: i64) -> StationResult<Value> {
        self.call(Method::POST, "/api/StopTask", Some(&json!({ "task_id": task_id })))
            .await
    }

    pub async fn cancel_task(&self, task_id: i64) -> StationResult<Value> {
        self.call(Method::POST, "/api/CancelTask", Some(&json!({ "task_id": task_id })))
            .await
    }

    pub async fn delete_task(&self, task_id: i64) -> StationResult<Value> {
        self.call(Method::POST, "/api/DeleteTask", Some(&json!({ "task_id": task_id })))
            .await
    }

    pub async fn get_task_info(&self, task_id: i64) -> StationResult<Value> {
        self.call(Method::POST, "/api/GetTaskInfo", Some(&json!({ "task_id": task_id })))
            .await
    }

    /// Step-level progress trace for a running task.
    pub async fn get_task_op_info(&self, task_id: i64) -> StationResult<Value> {
        self.call(
            Method::POST,
            "/api/GetTaskOpInfo",
            Some(&json!({ "task_id": task_id })),
        )
        .await
    }

    pub async fn get_task_list(
        &self,
        sort: &str,
        offset: i64,
        limit: i64,
        status: Option<&[i64]>,
    ) -> StationResult<Value> {
        let mut body = json!({ "sort": sort, "offset": offset, "limit": limit });
        if let Some(filter) = status {
            body["status"] = json!(filter);
        }
        self.call(Method::POST, "/api/GetTaskList", Some(&body)).await
    }

    /// Station-side resource audit; code 1200 is a soft verdict and returns
    /// the full body for the caller to interpret.
    pub async fn check_task_resource(&self, task_id: i64) -> StationResult<Value> {
        self.call_with_codes(
            Method::POST,
            "/api/CheckTaskResource",
            Some(&json!({ "task_id": task_id })),
            None,
            &[CODE_RESOURCE_SHORTAGE],
        )
        .await
    }
}

/// Unwrap the vendor's `result`/`data` envelope, if any.
pub(crate) fn envelope(data: &Value) -> &Value {
    for key in ["result", "data"] {
        if let Some(inner) = data.get(key) {
            if !inner.is_null() {
                return inner;
            }
        }
    }
    data
}

/// First integer found under any of `keys`, at the top level or inside the
/// envelope.
pub(crate) fn extract_i64(data: &Value, keys: &[&str]) -> Option<i64> {
    for source in [data, envelope(data)] {
        for key in keys {
            if let Some(found) = source.get(*key).and_then(loose_i64_ref) {
                return Some(found);
            }
        }
    }
    None
}

fn extract_resource_list(data: &Value) -> Option<Vec<Value>> {
    for source in [data, envelope(data)] {
        if let Some(list) = source.get("resource_list").and_then(Value::as_array) {
            return Some(list.clone());
        }
        if let Some(list) = source.as_array() {
            return Some(list.clone());
        }
    }
    None
}

fn loose_i64_ref(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn loose_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Redact credentials and tokens before they reach a log line.
fn mask_sensitive(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut masked = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                let lower = key.to_ascii_lowercase();
                if lower == "password" || lower == "access_token" || lower == "authorization" {
                    masked.insert(key.clone(), Value::String("***".to_string()));
                } else {
                    masked.insert(key.clone(), mask_sensitive(inner));
                }
            }
            Value::Object(masked)
        }
        Value::Array(items) => Value::Array(items.iter().map(mask_sensitive).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_unwraps_result_and_data() {
        let wrapped = json!({ "result": { "state": 1 } });
        assert_eq!(envelope(&wrapped)["state"], 1);
        let data = json!({ "data": { "state": 2 } });
        assert_eq!(envelope(&data)["state"], 2);
        let flat = json!({ "state": 3 });
        assert_eq!(envelope(&flat)["state"], 3);
    }

    #[test]
    fn extract_i64_handles_nesting_and_strings() {
        assert_eq!(extract_i64(&json!({ "task_id": 7 }), &["task_id"]), Some(7));
        assert_eq!(
            extract_i64(&json!({ "result": { "task_id": "8" } }), &["task_id"]),
            Some(8)
        );
        assert_eq!(extract_i64(&json!({}), &["task_id"]), None);
    }

    #[test]
    fn masking_hides_credentials() {
        let body = json!({
            "username": "admin",
            "password": "secret",
            "nested": { "access_token": "tok" }
        });
        let masked = mask_sensitive(&body);
        assert_eq!(masked["password"], "***");
        assert_eq!(masked["nested"]["access_token"], "***");
        assert_eq!(masked["username"], "admin");
    }
}
