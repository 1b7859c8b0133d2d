//! The device-facing OTA state machine: `check`, `report`, `progress`,
//! `heartbeat`, plus the operator `reset`. HTTP mapping lives in
//! `api::ota`; this service returns typed outcomes.
//!
//! otaStatus transitions: idle → pending on deploy (queue); pending →
//! updating on the first check that returns an update; updating → updated on
//! a successful report (or an idempotent check already on target); updating
//! → failed on a failed report or watchdog timeout; failed|updated → idle on
//! reset.

use crate::hub::Hub;
use crate::store::{NewDeviceLog, NewDevice, NewHeartbeat, Repository, StoreError};
use crate::webhooks::{WebhookDispatcher, WebhookEvent};
use chrono::{Duration, Utc};
use common::{
    ConnStatus, Device, DeviceLog, Firmware, FirmwareVersion, HeartbeatRequest, LogAction,
    LogStatus, MacAddr, OtaStatus, ProgressRequest, ReportStatus, ServerEvent,
};
use std::sync::Arc;
use tracing::{info, warn};

/// How long after entering `updating` the device must check back in.
pub const EXPECTED_CHECKIN_MINS: i64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum OtaError {
    #[error("device not registered")]
    DeviceNotRegistered,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What `check` decided for a device.
#[derive(Debug)]
pub enum CheckOutcome {
    /// No update; the device is on (or has just been marked on) its target.
    UpToDate { current_version: String },
    /// A target is set but its firmware record is gone.
    FirmwareMissing { target: String },
    /// Stream (or redirect to) this image.
    UpdateAvailable { firmware: Firmware },
}

pub struct OtaService {
    repo: Arc<dyn Repository>,
    hub: Arc<Hub>,
    webhooks: Arc<WebhookDispatcher>,
}

impl OtaService {
    pub fn new(
        repo: Arc<dyn Repository>,
        hub: Arc<Hub>,
        webhooks: Arc<WebhookDispatcher>,
    ) -> Self {
        OtaService { repo, hub, webhooks }
    }

    /// The poll half of the protocol. Refreshes liveness bookkeeping, then
    /// either confirms the device is current or moves it to `updating` and
    /// hands back the target image.
    pub async fn check(
        &self,
        mac: &MacAddr,
        reported_version: Option<FirmwareVersion>,
    ) -> Result<CheckOutcome, OtaError> {
        let now = Utc::now();
        let reported = reported_version.map(|v| v.as_str().to_string());
        let prior_status = self.require_device(mac).await?.ota_status;

        let device = self
            .repo
            .update_device(
                mac,
                Box::new(move |d| {
                    d.last_ota_check = Some(now);
                    d.last_seen = Some(now);
                    d.status = ConnStatus::Online;
                    if let Some(v) = reported {
                        d.current_version = v;
                    }
                    Ok(())
                }),
            )
            .await?;

        if device.target_version.is_empty() || device.target_version == device.current_version {
            self.append_log(mac, LogAction::Report, LogStatus::Updated, None, None, None)
                .await;
            let device = self
                .repo
                .update_device(
                    mac,
                    Box::new(|d| {
                        d.ota_status = OtaStatus::Updated;
                        Ok(())
                    }),
                )
                .await?;
            if prior_status != OtaStatus::Updated {
                self.broadcast_device(&device).await;
            }
            return Ok(CheckOutcome::UpToDate {
                current_version: device.current_version,
            });
        }

        let target = match FirmwareVersion::parse(&device.target_version) {
            Ok(v) => v,
            Err(_) => {
                warn!("device {mac} has unparseable target {:?}", device.target_version);
                return Ok(CheckOutcome::FirmwareMissing {
                    target: device.target_version,
                });
            }
        };
        let Some(firmware) = self.repo.firmware_by_version(&target).await? else {
            return Ok(CheckOutcome::FirmwareMissing {
                target: device.target_version,
            });
        };

        let device = self
            .repo
            .update_device(
                mac,
                Box::new(move |d| {
                    d.ota_status = OtaStatus::Updating;
                    d.update_started_at = Some(now);
                    d.expected_checkin_by =
                        Some(now + Duration::minutes(EXPECTED_CHECKIN_MINS));
                    d.update_attempts += 1;
                    Ok(())
                }),
            )
            .await?;

        self.append_log(
            mac,
            LogAction::Check,
            LogStatus::Success,
            Some(device.current_version.clone()),
            Some(device.target_version.clone()),
            None,
        )
        .await;
        self.broadcast_device(&device).await;
        info!("device {mac} updating {} -> {}", device.current_version, device.target_version);

        Ok(CheckOutcome::UpdateAvailable { firmware })
    }

    /// Device verdict on a finished (or aborted) flash.
    pub async fn report(
        &self,
        mac: &MacAddr,
        status: ReportStatus,
        version: Option<FirmwareVersion>,
        message: Option<String>,
    ) -> Result<Device, OtaError> {
        let prior = self.require_device(mac).await?;
        let now = Utc::now();

        let device = match status {
            ReportStatus::Success | ReportStatus::Updated => {
                let reported = version.map(|v| v.as_str().to_string());
                let device = self
                    .repo
                    .update_device(
                        mac,
                        Box::new(move |d| {
                            d.previous_version = d.current_version.clone();
                            d.current_version = reported
                                .clone()
                                .unwrap_or_else(|| d.target_version.clone());
                            d.ota_status = OtaStatus::Updated;
                            d.status = ConnStatus::Online;
                            d.last_seen = Some(now);
                            d.update_started_at = None;
                            d.expected_checkin_by = None;
                            d.is_at_risk = false;
                            d.consecutive_failures = 0;
                            Ok(())
                        }),
                    )
                    .await?;

                self.append_log(
                    mac,
                    LogAction::Report,
                    LogStatus::Success,
                    Some(prior.current_version.clone()),
                    Some(device.current_version.clone()),
                    message,
                )
                .await;
                self.webhooks.dispatch(
                    WebhookEvent::UpdateSuccess,
                    serde_json::json!({
                        "mac": mac,
                        "fromVersion": prior.current_version,
                        "toVersion": device.current_version,
                    }),
                );
                info!(
                    "device {mac} updated {} -> {}",
                    prior.current_version, device.current_version
                );
                device
            }
            ReportStatus::Failed => {
                let device = self
                    .repo
                    .update_device(
                        mac,
                        Box::new(move |d| {
                            d.ota_status = OtaStatus::Failed;
                            d.consecutive_failures += 1;
                            d.status = ConnStatus::Online;
                            d.last_seen = Some(now);
                            Ok(())
                        }),
                    )
                    .await?;

                self.append_log(
                    mac,
                    LogAction::Report,
                    LogStatus::Failed,
                    Some(prior.current_version.clone()),
                    Some(prior.target_version.clone()),
                    message.clone(),
                )
                .await;
                self.webhooks.dispatch(
                    WebhookEvent::UpdateFailed,
                    serde_json::json!({
                        "mac": mac,
                        "targetVersion": prior.target_version,
                        "message": message,
                    }),
                );
                warn!("device {mac} reported update failure");
                device
            }
        };

        self.broadcast_device(&device).await;
        Ok(device)
    }

    /// Download progress passthrough: fan-out only, no persistent mutation.
    pub async fn progress(&self, req: &ProgressRequest) -> Result<(), OtaError> {
        self.require_device(&req.device_id).await?;

        self.hub
            .broadcast(ServerEvent::UpdateProgress {
                device_id: req.device_id.clone(),
                progress: req.progress,
                bytes_received: req.bytes_received,
                total_bytes: req.total_bytes,
            })
            .await;
        self.broadcast_log_line(
            &req.device_id,
            LogAction::Download,
            LogStatus::Pending,
            format!("download progress {}%", req.progress),
        )
        .await;
        Ok(())
    }

    /// Health sample. Unknown MACs are registered first-seen; metrics update
    /// the device row and recompute the health score.
    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<Device, OtaError> {
        let mac = &req.mac;
        if self.repo.device_by_mac(mac).await?.is_none() {
            let device = self
                .repo
                .insert_device(NewDevice {
                    mac: mac.clone(),
                    name: mac.to_string(),
                    group: "default".into(),
                    location: None,
                })
                .await?;
            self.append_log(mac, LogAction::Register, LogStatus::Success, None, None, None)
                .await;
            self.webhooks.dispatch(
                WebhookEvent::DeviceRegistered,
                serde_json::json!({"mac": mac, "id": device.id}),
            );
            info!("registered first-seen device {mac}");
        }

        self.repo
            .insert_heartbeat(NewHeartbeat {
                mac: mac.clone(),
                rssi: req.signal_strength,
                free_heap: req.free_heap,
                uptime: req.uptime,
                cpu_temp: req.cpu_temp,
            })
            .await?;

        let now = Utc::now();
        let (rssi, heap, uptime) = (req.signal_strength, req.free_heap, req.uptime);
        let device = self
            .repo
            .update_device(
                mac,
                Box::new(move |d| {
                    d.last_heartbeat = Some(now);
                    d.last_seen = Some(now);
                    d.status = ConnStatus::Online;
                    if rssi.is_some() {
                        d.signal_strength = rssi;
                    }
                    if heap.is_some() {
                        d.free_heap = heap;
                    }
                    if uptime.is_some() {
                        d.uptime = uptime;
                    }
                    d.health_score = health_score(d.signal_strength, d.free_heap);
                    d.consecutive_failures = 0;
                    Ok(())
                }),
            )
            .await?;

        self.broadcast_device(&device).await;
        self.broadcast_log_line(
            mac,
            LogAction::Check,
            LogStatus::Success,
            format!(
                "heartbeat rssi={:?} freeHeap={:?} health={}",
                device.signal_strength, device.free_heap, device.health_score
            ),
        )
        .await;
        Ok(device)
    }

    /// Remote-console passthrough to subscribed operators.
    pub async fn console(&self, mac: &MacAddr, line: String) -> Result<(), OtaError> {
        self.require_device(mac).await?;
        self.hub
            .broadcast_console(
                mac,
                ServerEvent::ConsoleOutput {
                    device_id: mac.clone(),
                    line,
                    timestamp: Utc::now(),
                },
            )
            .await;
        Ok(())
    }

    /// Operator reset: back to `idle` with no target.
    pub async fn reset(&self, mac: &MacAddr) -> Result<Device, OtaError> {
        let device = self
            .repo
            .update_device(
                mac,
                Box::new(|d| {
                    d.ota_status = OtaStatus::Idle;
                    d.target_version.clear();
                    d.update_started_at = None;
                    d.expected_checkin_by = None;
                    d.is_at_risk = false;
                    Ok(())
                }),
            )
            .await
            .map_err(map_missing)?;

        self.append_log(mac, LogAction::Reset, LogStatus::Success, None, None, None)
            .await;
        self.broadcast_device(&device).await;
        Ok(device)
    }

    async fn require_device(&self, mac: &MacAddr) -> Result<Device, OtaError> {
        self.repo
            .device_by_mac(mac)
            .await?
            .ok_or(OtaError::DeviceNotRegistered)
    }

    async fn broadcast_device(&self, device: &Device) {
        self.hub
            .broadcast(ServerEvent::DeviceUpdate {
                device: device.clone().with_derived_status(Utc::now()),
            })
            .await;
    }

    /// Persists a device-log entry and fans it out to log subscribers.
    /// Log-append failures never fail the protocol operation.
    async fn append_log(
        &self,
        mac: &MacAddr,
        action: LogAction,
        status: LogStatus,
        from_version: Option<String>,
        to_version: Option<String>,
        message: Option<String>,
    ) {
        let result = self
            .repo
            .append_log(NewDeviceLog {
                mac: mac.clone(),
                action,
                status,
                from_version,
                to_version,
                message,
            })
            .await;
        match result {
            Ok(entry) => {
                self.hub
                    .broadcast_log(
                        mac,
                        ServerEvent::DeviceLog {
                            device_id: mac.clone(),
                            entry,
                        },
                    )
                    .await;
            }
            Err(err) => warn!("device log append for {mac} failed: {err}"),
        }
    }

    /// Synthesized (non-persisted) log line, for high-frequency events.
    async fn broadcast_log_line(
        &self,
        mac: &MacAddr,
        action: LogAction,
        status: LogStatus,
        message: String,
    ) {
        let entry = DeviceLog {
            id: 0,
            mac: mac.clone(),
            action,
            status,
            from_version: None,
            to_version: None,
            message: Some(message),
            cleared: false,
            created_at: Utc::now(),
        };
        self.hub
            .broadcast_log(
                mac,
                ServerEvent::DeviceLog {
                    device_id: mac.clone(),
                    entry,
                },
            )
            .await;
    }
}

fn map_missing(err: StoreError) -> OtaError {
    match err {
        StoreError::NotFound(_) => OtaError::DeviceNotRegistered,
        other => OtaError::Store(other),
    }
}

/// Health score: start at 100, subtract banded penalties for weak signal and
/// low heap, floor at zero.
pub fn health_score(rssi: Option<i32>, free_heap: Option<u64>) -> u8 {
    let mut score: i32 = 100;
    if let Some(rssi) = rssi {
        if rssi < -80 {
            score -= 30;
        } else if rssi < -70 {
            score -= 15;
        } else if rssi < -60 {
            score -= 5;
        }
    }
    if let Some(heap) = free_heap {
        if heap < 10_000 {
            score -= 40;
        } else if heap < 20_000 {
            score -= 20;
        } else if heap < 30_000 {
            score -= 10;
        }
    }
    score.clamp(0, 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRepository;

    fn mac(s: &str) -> MacAddr {
        MacAddr::parse(s).unwrap()
    }

    fn version(s: &str) -> FirmwareVersion {
        FirmwareVersion::parse(s).unwrap()
    }

    async fn setup() -> (Arc<MemoryRepository>, OtaService) {
        let repo = Arc::new(MemoryRepository::new());
        let hub = Arc::new(Hub::new(8));
        let webhooks = Arc::new(WebhookDispatcher::new(repo.clone()));
        let service = OtaService::new(repo.clone(), hub, webhooks);
        repo.insert_device(NewDevice {
            mac: mac("AABBCCDDEEFF"),
            name: "n1".into(),
            group: "APS".into(),
            location: None,
        })
        .await
        .unwrap();
        (repo, service)
    }

    async fn stage_firmware(repo: &MemoryRepository, v: &str) {
        repo.insert_firmware(crate::store::NewFirmware {
            version: version(v),
            filename: format!("default_{v}.ino.bin"),
            size: 4,
            checksum: "aa".repeat(32),
            notes: None,
        })
        .await
        .unwrap();
    }

    async fn set_target(repo: &MemoryRepository, m: &MacAddr, current: &str, target: &str) {
        let (current, target) = (current.to_string(), target.to_string());
        repo.update_device(
            m,
            Box::new(move |d| {
                d.current_version = current;
                d.target_version = target;
                d.ota_status = OtaStatus::Pending;
                Ok(())
            }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_check_moves_pending_device_to_updating() {
        let (repo, service) = setup().await;
        let m = mac("AABBCCDDEEFF");
        stage_firmware(&repo, "v1.1.0").await;
        set_target(&repo, &m, "", "v1.1.0").await;

        let outcome = service.check(&m, Some(version("v1.0.0"))).await.unwrap();
        assert!(matches!(outcome, CheckOutcome::UpdateAvailable { .. }));

        let device = repo.device_by_mac(&m).await.unwrap().unwrap();
        assert_eq!(device.ota_status, OtaStatus::Updating);
        assert_eq!(device.current_version, "v1.0.0");
        assert_eq!(device.update_attempts, 1);

        let deadline = device.expected_checkin_by.unwrap();
        let expected = Utc::now() + Duration::minutes(EXPECTED_CHECKIN_MINS);
        assert!((deadline - expected).num_seconds().abs() < 5);

        // updating always implies a real target.
        assert!(!device.target_version.is_empty());
        assert_ne!(device.target_version, device.current_version);
    }

    #[tokio::test]
    async fn test_check_is_idempotent_when_on_target() {
        let (repo, service) = setup().await;
        let m = mac("AABBCCDDEEFF");
        set_target(&repo, &m, "v2.0.0", "v2.0.0").await;

        let outcome = service.check(&m, Some(version("v2.0.0"))).await.unwrap();
        match outcome {
            CheckOutcome::UpToDate { current_version } => {
                assert_eq!(current_version, "v2.0.0")
            }
            other => panic!("expected UpToDate, got {other:?}"),
        }

        let device = repo.device_by_mac(&m).await.unwrap().unwrap();
        assert_eq!(device.ota_status, OtaStatus::Updated);
    }

    #[tokio::test]
    async fn test_check_with_missing_firmware_reports_error_without_updating() {
        let (repo, service) = setup().await;
        let m = mac("AABBCCDDEEFF");
        set_target(&repo, &m, "v1.0.0", "v9.9.9").await;

        let outcome = service.check(&m, None).await.unwrap();
        assert!(matches!(outcome, CheckOutcome::FirmwareMissing { .. }));

        let device = repo.device_by_mac(&m).await.unwrap().unwrap();
        assert_ne!(device.ota_status, OtaStatus::Updating);
    }

    #[tokio::test]
    async fn test_check_unknown_mac() {
        let (_, service) = setup().await;
        let err = service.check(&mac("112233445566"), None).await;
        assert!(matches!(err, Err(OtaError::DeviceNotRegistered)));
    }

    #[tokio::test]
    async fn test_report_success_rotates_version_triple() {
        let (repo, service) = setup().await;
        let m = mac("AABBCCDDEEFF");
        stage_firmware(&repo, "v1.1.0").await;
        set_target(&repo, &m, "v1.0.0", "v1.1.0").await;
        service.check(&m, None).await.unwrap();

        let device = service
            .report(&m, ReportStatus::Updated, Some(version("v1.1.0")), None)
            .await
            .unwrap();

        assert_eq!(device.current_version, "v1.1.0");
        assert_eq!(device.previous_version, "v1.0.0");
        assert_eq!(device.ota_status, OtaStatus::Updated);
        assert!(device.update_started_at.is_none());
        assert!(device.expected_checkin_by.is_none());
        assert!(!device.is_at_risk);
    }

    #[tokio::test]
    async fn test_report_success_defaults_to_target_version() {
        let (repo, service) = setup().await;
        let m = mac("AABBCCDDEEFF");
        set_target(&repo, &m, "v1.0.0", "v1.2.0").await;

        let device = service
            .report(&m, ReportStatus::Success, None, None)
            .await
            .unwrap();
        assert_eq!(device.current_version, "v1.2.0");
    }

    #[tokio::test]
    async fn test_report_failure_marks_failed() {
        let (repo, service) = setup().await;
        let m = mac("AABBCCDDEEFF");
        set_target(&repo, &m, "v1.0.0", "v1.1.0").await;

        let device = service
            .report(&m, ReportStatus::Failed, None, Some("flash verify failed".into()))
            .await
            .unwrap();

        assert_eq!(device.ota_status, OtaStatus::Failed);
        assert_eq!(device.consecutive_failures, 1);
        assert_eq!(device.current_version, "v1.0.0");

        let logs = repo.logs_for(&m, 10).await.unwrap();
        assert_eq!(logs[0].status, LogStatus::Failed);
        assert_eq!(logs[0].message.as_deref(), Some("flash verify failed"));
    }

    #[tokio::test]
    async fn test_heartbeat_registers_first_seen_device() {
        let (repo, service) = setup().await;
        let m = mac("112233445566");

        service
            .heartbeat(&HeartbeatRequest {
                mac: m.clone(),
                signal_strength: Some(-65),
                free_heap: Some(25_000),
                uptime: Some(120),
                cpu_temp: None,
            })
            .await
            .unwrap();

        let device = repo.device_by_mac(&m).await.unwrap().unwrap();
        assert_eq!(device.name, "112233445566");
        assert_eq!(device.signal_strength, Some(-65));
        // -5 for rssi in (-70, -60], -10 for heap in [20k, 30k).
        assert_eq!(device.health_score, 85);
        assert_eq!(device.online_status(Utc::now()), ConnStatus::Online);

        let rows = repo.heartbeats_for(&m, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_returns_device_to_idle() {
        let (repo, service) = setup().await;
        let m = mac("AABBCCDDEEFF");
        set_target(&repo, &m, "v1.0.0", "v1.1.0").await;

        let device = service.reset(&m).await.unwrap();
        assert_eq!(device.ota_status, OtaStatus::Idle);
        assert_eq!(device.target_version, "");
    }

    #[test]
    fn test_health_score_bands() {
        assert_eq!(health_score(None, None), 100);
        assert_eq!(health_score(Some(-50), Some(100_000)), 100);
        assert_eq!(health_score(Some(-65), Some(100_000)), 95);
        assert_eq!(health_score(Some(-75), Some(100_000)), 85);
        assert_eq!(health_score(Some(-85), Some(100_000)), 70);
        assert_eq!(health_score(Some(-85), Some(5_000)), 30);
        // Bounded below by zero even for pathological inputs.
        assert_eq!(health_score(Some(-120), Some(0)), 30);
        assert!(health_score(Some(i32::MIN), Some(0)) <= 100);
    }
}
