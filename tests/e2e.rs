//! End-to-end protocol scenarios driven through the HTTP router against the
//! in-memory repository.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use common::{MacAddr, OtaStatus};
use http_body_util::BodyExt;
use otahub::config::Config;
use otahub::store::Repository;
use otahub::store::MemoryRepository;
use otahub::AppState;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

const MAC: &str = "AABBCCDDEEFF";

struct TestServer {
    app: Router,
    state: AppState,
    repo: Arc<MemoryRepository>,
    _firmware_dir: tempfile::TempDir,
}

async fn server() -> TestServer {
    server_with(|_| {}).await
}

async fn server_with(tweak: impl FnOnce(&mut Config)) -> TestServer {
    let firmware_dir = tempfile::tempdir().unwrap();
    let mut config = Config {
        firmware_dir: firmware_dir.path().to_path_buf(),
        ..Config::default()
    };
    tweak(&mut config);

    let repo = Arc::new(MemoryRepository::new());
    let state = otahub::build_state_with(config, repo.clone()).await.unwrap();
    let app = otahub::api::router(state.clone());
    TestServer {
        app,
        state,
        repo,
        _firmware_dir: firmware_dir,
    }
}

impl TestServer {
    async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = match body {
            Some(json) => Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, None).await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(body)).await
    }

    async fn upload_firmware(&self, version: &str, bytes: &[u8]) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/firmware?version={version}&filename=app.bin"))
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(bytes.to_vec()))
            .unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    async fn register_device(&self, mac: &str, name: &str, group: &str) {
        let (status, _) = self
            .post(
                "/api/devices",
                json!({"mac": mac, "name": name, "group": group}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    async fn device(&self, mac: &str) -> common::Device {
        self.repo
            .device_by_mac(&MacAddr::parse(mac).unwrap())
            .await
            .unwrap()
            .unwrap()
    }

    /// Queue tasks run in the background; wait for the device to reach the
    /// expected otaStatus and for its task to fully retire.
    async fn wait_for_status(&self, mac: &str, expected: OtaStatus) {
        let parsed = MacAddr::parse(mac).unwrap();
        for _ in 0..200 {
            if self.device(mac).await.ota_status == expected
                && !self.state.queue.is_device_updating(&parsed).await
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!(
            "device {mac} never reached {expected:?}, is {:?}",
            self.device(mac).await.ota_status
        );
    }
}

#[tokio::test]
async fn test_register_deploy_stream_report_success() {
    let server = server().await;
    server.register_device(MAC, "n1", "APS").await;
    server.upload_firmware("v1.0.0", b"image-one").await;
    server.upload_firmware("v1.1.0", b"image-two").await;

    // Deploy queues the device.
    let (status, body) = server
        .post("/api/deploy", json!({"deviceIds": [MAC], "version": "v1.1.0"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["status"], "queued");

    server.wait_for_status(MAC, OtaStatus::Pending).await;
    let device = server.device(MAC).await;
    assert_eq!(device.target_version, "v1.1.0");
    assert_eq!(device.previous_version, "");

    // The device polls and is redirected to the image.
    let (status, _) = server
        .get(&format!("/ota/check?deviceId={MAC}&version=v1.0.0"))
        .await;
    assert_eq!(status, StatusCode::FOUND);

    let device = server.device(MAC).await;
    assert_eq!(device.ota_status, OtaStatus::Updating);
    assert_eq!(device.current_version, "v1.0.0");
    let deadline = device.expected_checkin_by.unwrap();
    let expected = Utc::now() + Duration::minutes(10);
    assert!((deadline - expected).num_seconds().abs() < 10);

    // The device flashes and reports back.
    let (status, body) = server
        .post(
            "/ota/report",
            json!({"deviceId": MAC, "status": "updated", "version": "v1.1.0"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let device = server.device(MAC).await;
    assert_eq!(device.current_version, "v1.1.0");
    assert_eq!(device.previous_version, "v1.0.0");
    assert_eq!(device.ota_status, OtaStatus::Updated);
}

#[tokio::test]
async fn test_idempotent_check_on_updated_device() {
    let server = server().await;
    server.register_device(MAC, "n1", "APS").await;

    let mac = MacAddr::parse(MAC).unwrap();
    server
        .repo
        .update_device(
            &mac,
            Box::new(|d| {
                d.current_version = "v2.0.0".into();
                d.target_version = "v2.0.0".into();
                d.ota_status = OtaStatus::Updating;
                Ok(())
            }),
        )
        .await
        .unwrap();

    let (status, body) = server
        .get(&format!("/ota/check?deviceId={MAC}&version=v2.0.0"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["updateAvailable"], false);
    assert_eq!(body["currentVersion"], "v2.0.0");

    let device = server.device(MAC).await;
    assert_eq!(device.ota_status, OtaStatus::Updated);
}

#[tokio::test]
async fn test_duplicate_deploy_suppressed() {
    let server = server().await;
    server.register_device(MAC, "n1", "APS").await;
    server.upload_firmware("v2.0.0", b"image").await;

    let (_, body) = server
        .post("/api/deploy", json!({"deviceIds": [MAC], "version": "v2.0.0"}))
        .await;
    assert_eq!(body["results"][0]["status"], "queued");
    server.wait_for_status(MAC, OtaStatus::Pending).await;
    let before = server.device(MAC).await;

    let (_, body) = server
        .post("/api/deploy", json!({"deviceIds": [MAC], "version": "v2.0.0"}))
        .await;
    assert_eq!(body["results"][0]["status"], "failed");
    assert_eq!(
        body["results"][0]["message"],
        "Same version was recently deployed to this device"
    );

    let after = server.device(MAC).await;
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_watchdog_flags_and_recovers() {
    let server = server().await;
    server.register_device(MAC, "n1", "APS").await;
    server.upload_firmware("v2.0.0", b"image").await;

    server
        .post("/api/deploy", json!({"deviceIds": [MAC], "version": "v2.0.0"}))
        .await;
    server.wait_for_status(MAC, OtaStatus::Pending).await;
    let (status, _) = server.get(&format!("/ota/check?deviceId={MAC}")).await;
    assert_eq!(status, StatusCode::FOUND);
    assert_eq!(server.device(MAC).await.ota_status, OtaStatus::Updating);

    // Eleven minutes pass without a check-in.
    let mac = MacAddr::parse(MAC).unwrap();
    server
        .repo
        .update_device(
            &mac,
            Box::new(|d| {
                d.update_started_at = Some(Utc::now() - Duration::minutes(11));
                d.expected_checkin_by = Some(Utc::now() - Duration::minutes(1));
                Ok(())
            }),
        )
        .await
        .unwrap();

    server.state.watchdog.scan().await.unwrap();
    let device = server.device(MAC).await;
    assert!(device.is_at_risk);

    let (_, body) = server.get("/api/at-risk").await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    // The device finally reports in; the next scan clears the flag.
    server
        .post(
            "/ota/report",
            json!({"deviceId": MAC, "status": "updated", "version": "v2.0.0"}),
        )
        .await;
    server.state.watchdog.scan().await.unwrap();
    let device = server.device(MAC).await;
    assert!(!device.is_at_risk);
    assert_eq!(device.current_version, "v2.0.0");
}

#[tokio::test]
async fn test_staged_rollout_expansion() {
    let server = server().await;
    for i in 0..20 {
        server
            .register_device(&format!("AABBCCDDEE{i:02X}"), &format!("dev-{i}"), "fleet")
            .await;
    }
    server.upload_firmware("v3.0.0", b"image").await;

    let (status, body) = server
        .post(
            "/api/rollouts",
            json!({"version": "v3.0.0", "stagePercentages": [5, 25, 50, 100]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["devicesQueued"], 1);
    assert_eq!(body["currentStage"], 1);
    let id = body["id"].as_i64().unwrap();

    let (_, body) = server.post(&format!("/api/rollouts/{id}/advance"), json!({})).await;
    assert_eq!(body["devicesQueued"], 4);
    assert_eq!(body["currentStage"], 2);

    let (_, body) = server.post(&format!("/api/rollouts/{id}/advance"), json!({})).await;
    assert_eq!(body["devicesQueued"], 5);

    let (_, body) = server.post(&format!("/api/rollouts/{id}/advance"), json!({})).await;
    assert_eq!(body["devicesQueued"], 10);
    assert_eq!(body["status"], "completing");
}

#[tokio::test]
async fn test_config_push_and_ack() {
    let server = server().await;
    server.register_device(MAC, "n1", "APS").await;

    let (status, body) = server
        .post(
            "/api/configs",
            json!({"name": "prod", "configData": {"ota": {"checkIntervalMs": 3600000}}}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);
    let id = body["id"].as_i64().unwrap();

    let (status, _) = server
        .post(
            &format!("/api/configs/{id}/push"),
            json!({"macAddresses": [MAC]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = server.get(&format!("/ota/config?mac={MAC}")).await;
    assert_eq!(body["hasConfig"], true);
    assert_eq!(body["configVersion"], 1);
    assert_eq!(body["configData"]["ota"]["checkIntervalMs"], 3600000);

    let (status, _) = server
        .post("/ota/config/ack", json!({"mac": MAC, "configVersion": 1}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = server.get(&format!("/ota/config?mac={MAC}")).await;
    assert_eq!(body["hasConfig"], false);

    assert_eq!(server.device(MAC).await.config_version, 1);
}

#[tokio::test]
async fn test_one_shot_update_streams_bytes_with_headers() {
    let server = server().await;
    server.register_device(MAC, "n1", "APS").await;
    server.upload_firmware("v1.1.0", b"streamed-image-bytes").await;
    server
        .post("/api/deploy", json!({"deviceIds": [MAC], "version": "v1.1.0"}))
        .await;
    server.wait_for_status(MAC, OtaStatus::Pending).await;

    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("/ota/update?deviceId={MAC}"))
        .body(Body::empty())
        .unwrap();
    let response = server.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("X-Firmware-Version").unwrap(),
        "v1.1.0"
    );
    assert!(response.headers().contains_key("X-Checksum"));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"streamed-image-bytes");

    // A device already on target gets 304 and no bytes.
    server
        .post(
            "/ota/report",
            json!({"deviceId": MAC, "status": "updated", "version": "v1.1.0"}),
        )
        .await;
    let (status, _) = server.get(&format!("/ota/update?deviceId={MAC}")).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn test_heartbeat_registers_and_scores() {
    let server = server().await;

    let (status, _) = server
        .post(
            "/ota/heartbeat",
            json!({"mac": "11:22:33:44:55:66", "signalStrength": -75, "freeHeap": 15000, "uptime": 42}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let device = server.device("112233445566").await;
    // -15 for rssi, -20 for heap.
    assert_eq!(device.health_score, 65);
    assert_eq!(device.status, common::ConnStatus::Online);

    let (_, body) = server.get("/api/devices/11-22-33-44-55-66/heartbeats").await;
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_check_rate_limit_returns_429() {
    let server = server_with(|c| c.check_rate_per_minute = 2).await;
    server.register_device(MAC, "n1", "APS").await;

    for _ in 0..2 {
        let (status, _) = server.get(&format!("/ota/check?deviceId={MAC}")).await;
        assert_ne!(status, StatusCode::TOO_MANY_REQUESTS);
    }
    let before = server.device(MAC).await;
    let (status, _) = server.get(&format!("/ota/check?deviceId={MAC}")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    // 429 causes no state change.
    let after = server.device(MAC).await;
    assert_eq!(before.last_ota_check, after.last_ota_check);
}

#[tokio::test]
async fn test_unknown_mac_is_404_and_bad_mac_is_400() {
    let server = server().await;

    let (status, _) = server.get("/ota/check?deviceId=112233445566").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server.get("/ota/check?deviceId=nonsense").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server
        .post("/api/deploy", json!({"deviceIds": [MAC], "version": "not-a-version"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_device_requires_reason() {
    let server = server().await;
    server.register_device(MAC, "n1", "APS").await;

    let (status, _) = server
        .request(
            Method::DELETE,
            &format!("/api/devices/{MAC}"),
            Some(json!({"reason": ""})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server
        .request(
            Method::DELETE,
            &format!("/api/devices/{MAC}"),
            Some(json!({"reason": "decommissioned bench unit"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = server.get(&format!("/api/devices/{MAC}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_firmware_download_guards_traversal() {
    let server = server().await;
    server.upload_firmware("v1.0.0", b"image").await;

    let (status, _) = server.get("/firmware/..%2F..%2Fetc%2Fpasswd").await;
    assert!(matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND
    ));

    let (status, _) = server.get("/firmware/default_v1.0.0.ino.bin").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_commands_drain_and_ack_via_http() {
    let server = server().await;
    server.register_device(MAC, "n1", "APS").await;

    let (status, body) = server
        .post(
            &format!("/api/devices/{MAC}/commands"),
            json!({"command": "reboot", "payload": {"delayMs": 100}}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let command_id = body["id"].as_i64().unwrap();

    let (_, body) = server.get(&format!("/ota/commands?mac={MAC}")).await;
    assert_eq!(body["commands"][0]["command"], "reboot");
    assert_eq!(body["commands"][0]["payload"]["delayMs"], 100);

    // Drained means gone on the next poll.
    let (_, body) = server.get(&format!("/ota/commands?mac={MAC}")).await;
    assert!(body["commands"].as_array().unwrap().is_empty());

    let (status, _) = server
        .post(
            &format!("/ota/commands/{command_id}/ack"),
            json!({"status": "acknowledged", "response": "ok"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_login_checks_configured_credentials() {
    let server = server().await;

    let (status, _) = server
        .post("/api/login", json!({"username": "admin", "password": "admin"}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = server
        .post("/api/login", json!({"username": "admin", "password": "wrong"}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_audit_trail_records_operator_actions() {
    let server = server().await;
    server.register_device(MAC, "n1", "APS").await;
    server.upload_firmware("v1.0.0", b"image").await;

    // Audit writes are fire-and-forget; give them a beat to land.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let (status, body) = server.get("/api/audit?limit=10").await;
    assert_eq!(status, StatusCode::OK);
    let actions: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["action"].as_str().unwrap())
        .collect();
    assert!(actions.contains(&"device.register"));
    assert!(actions.contains(&"firmware.upload"));
}
