//! Station client and coordinator flows against a mock upper computer

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use synthstation::coordinator::{DischargeOptions, PollOptions, StartOptions};
use synthstation::{Coordinator, NullSink, StationConfig, StationError, TaskStatus};

fn config_for(server: &MockServer) -> StationConfig {
    StationConfig {
        base_url: server.uri(),
        username: "admin".to_string(),
        password: "admin".to_string(),
        timeout_s: 5.0,
        enable_data_logging: false,
        ..StationConfig::default()
    }
}

fn coordinator_for(server: &MockServer) -> Coordinator {
    Coordinator::new(config_for(server), Arc::new(NullSink)).unwrap()
}

fn fast_poll() -> PollOptions {
    PollOptions {
        interval: Duration::from_millis(10),
        deadline: Duration::from_secs(5),
    }
}

async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/Token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok-1",
            "token_type": "Bearer"
        })))
        .mount(server)
        .await;
}

async fn mount_idle_state(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/station/state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "state": 0
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn relogin_once_on_401_and_continue() {
    let server = MockServer::start().await;
    mount_login(&server).await;

    // First poll hits an expired session; the retry succeeds.
    Mock::given(method("POST"))
        .and(path("/api/GetTaskInfo"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/GetTaskInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "status": 2
        })))
        .mount(&server)
        .await;

    let coordinator = coordinator_for(&server);
    let progress = coordinator
        .wait_task_with_progress(Some(7), &fast_poll())
        .await
        .unwrap();
    assert_eq!(progress.status, TaskStatus::Completed);

    // Initial login plus exactly one re-login.
    let logins = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/api/Token")
        .count();
    assert_eq!(logins, 2);
}

#[tokio::test]
async fn second_401_surfaces_as_auth_fault() {
    let server = MockServer::start().await;
    mount_login(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/GetTaskInfo"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let coordinator = coordinator_for(&server);
    let err = coordinator
        .wait_task_with_progress(Some(7), &fast_poll())
        .await
        .unwrap_err();
    assert!(matches!(err, StationError::Auth(_)));
}

#[tokio::test]
async fn progress_stream_emits_each_step_once() {
    let server = MockServer::start().await;
    mount_login(&server).await;

    // Two running polls, then completed.
    Mock::given(method("POST"))
        .and(path("/api/GetTaskInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "status": 1
        })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/GetTaskInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "status": 2
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/GetTaskOpInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "done_units": [
                { "unit-a": [["add powder", "A"], ["weigh", ""]] }
            ],
            "running_units": [
                { "unit-b": [["pipette", "B"]] }
            ]
        })))
        .mount(&server)
        .await;

    let coordinator = coordinator_for(&server);
    let progress = coordinator
        .wait_task_with_progress(Some(7), &fast_poll())
        .await
        .unwrap();

    assert_eq!(progress.status, TaskStatus::Completed);
    // The op info was served twice but every step appears exactly once.
    assert_eq!(
        progress.steps,
        vec![
            "unit-a: add powder -> A",
            "unit-a: weigh",
            "unit-b: pipette -> B",
        ]
    );
}

#[tokio::test]
async fn discharge_routes_task_trays_then_empties_around_airlock() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    mount_idle_state(&server).await;

    // Completed task 7 used trays T-1-1 and T-1-2.
    Mock::given(method("POST"))
        .and(path("/api/GetTaskInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "result": {
                "status": 2,
                "layout_list": [
                    { "unit_type": "exp_add_powder", "layout_code": "T-1-1:0" },
                    { "unit_type": "exp_add_powder", "layout_code": "T-1-2:3" }
                ]
            }
        })))
        .mount(&server)
        .await;

    // Inventory: task trays present, three empty positions (one in the
    // airlock), and a 125 mL bottle on W-1-3 that must stay put.
    Mock::given(method("POST"))
        .and(path("/api/GetResourceInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "resource_list": [
                { "layout_code": "T-1-1:-1", "resource_type": 201000726 },
                { "layout_code": "T-1-1:0" },
                { "layout_code": "T-1-2:-1", "resource_type": 201000726 },
                { "layout_code": "T-1-2:0" },
                { "layout_code": "N-2:-1", "resource_type": 201000711 },
                { "layout_code": "W-3-1:-1", "resource_type": 201000502 },
                { "layout_code": "MSB-1:-1", "resource_type": 201000502 },
                { "layout_code": "W-1-3:-1", "resource_type": 220000023 },
                { "layout_code": "W-1-3:0", "substance": "toluene",
                  "available_volume": 80.0, "unit": "mL" }
            ]
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/BatchOutTray"))
        .and(body_partial_json(json!({ "move_type": "main_out" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": 200 })))
        .mount(&server)
        .await;

    let coordinator = coordinator_for(&server);
    let outcome = coordinator
        .discharge_task_and_empty_trays(Some(7), &DischargeOptions {
            poll: fast_poll(),
            ..DischargeOptions::default()
        })
        .await
        .unwrap();

    let routed: Vec<(String, String)> = outcome
        .assignments
        .iter()
        .map(|a| (a.source.clone(), a.dst.clone()))
        .collect();
    assert_eq!(
        routed,
        vec![
            ("T-1-1".to_string(), "TB-2-1".to_string()),
            ("T-1-2".to_string(), "TB-2-2".to_string()),
            ("N-2".to_string(), "TB-2-3".to_string()),
            ("W-3-1".to_string(), "TB-2-4".to_string()),
        ]
    );
    // Task trays carry the task id; plain empties do not.
    assert_eq!(outcome.assignments[0].task_id, Some(7));
    assert_eq!(outcome.assignments[2].task_id, None);
}

#[tokio::test]
async fn start_task_rejects_wet_glovebox() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    mount_idle_state(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/BatchListDeviceRuntimes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "result": [
                { "time": "12:00", "box_pressure": 50.0,
                  "water_content": 20.0, "oxygen_content": 1.0 }
            ]
        })))
        .mount(&server)
        .await;

    let coordinator = coordinator_for(&server);
    let err = coordinator
        .start_task(Some(7), &StartOptions::default())
        .await
        .unwrap_err();
    match err {
        StationError::Validation(msg) => assert!(msg.contains("water")),
        other => panic!("expected validation fault, got {:?}", other),
    }
}

#[tokio::test]
async fn start_task_maps_vendor_1200_to_shortage() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    mount_idle_state(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/StartTask"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 1200,
            "msg": "insufficient material"
        })))
        .mount(&server)
        .await;

    let coordinator = coordinator_for(&server);
    let opts = StartOptions {
        check_glovebox_env: false,
        ..StartOptions::default()
    };
    let err = coordinator.start_task(Some(7), &opts).await.unwrap_err();
    assert!(matches!(err, StationError::ResourceShortage(_)));
}

#[tokio::test]
async fn duplicate_task_name_is_actionable() {
    let server = MockServer::start().await;
    mount_login(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/AddTask"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let coordinator = coordinator_for(&server);
    let payload = synthstation::TaskPayload::new("repeat run", 12);
    let err = coordinator.submit_task(payload).await.unwrap_err();
    match err {
        StationError::Validation(msg) => assert!(msg.contains("repeat run")),
        other => panic!("expected validation fault, got {:?}", other),
    }
}

#[tokio::test]
async fn check_task_resource_returns_soft_1200_body() {
    let server = MockServer::start().await;
    mount_login(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/CheckTaskResource"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 1200,
            "msg": "short",
            "prompt_msg": { "resource_type": "2mL reaction tube", "number": 3 }
        })))
        .mount(&server)
        .await;

    let coordinator = coordinator_for(&server);
    let verdict = coordinator.client().check_task_resource(7).await.unwrap();
    assert_eq!(verdict["code"], 1200);
    assert_eq!(verdict["prompt_msg"]["number"], 3);
}

#[tokio::test]
async fn wait_idle_times_out_with_stage_name() {
    let server = MockServer::start().await;
    mount_login(&server).await;

    Mock::given(method("GET"))
        .and(path("/api/station/state"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 200,
            "state": 1
        })))
        .mount(&server)
        .await;

    let coordinator = coordinator_for(&server);
    let err = coordinator
        .wait_idle(
            "loading gate",
            &PollOptions {
                interval: Duration::from_millis(10),
                deadline: Duration::from_millis(50),
            },
        )
        .await
        .unwrap_err();
    match err {
        StationError::Timeout { stage, last_state } => {
            assert_eq!(stage, "loading gate");
            assert_eq!(last_state, Some(1));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}
