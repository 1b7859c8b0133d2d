//! Operator device CRUD, deploy, recovery actions and fleet queries.

use crate::audit::AuditEntry;
use crate::error::ApiError;
use crate::store::{NewDevice, NewDeviceLog};
use crate::webhooks::WebhookEvent;
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use common::{
    ConnStatus, DeleteDeviceRequest, DeployRequest, DeployResponse, DeployResult, Device,
    DeviceHeartbeat, DeviceLog, EnqueueCommandRequest, FleetStats, LogAction, LogStatus,
    MacAddr, OkResponse, QueueStatus, RegisterDeviceRequest, ServerEvent, Severity,
    UpdateDeviceRequest,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

const MAX_DELETE_REASON_CHARS: usize = 500;

#[derive(Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Device>>, ApiError> {
    let now = Utc::now();
    let devices = state
        .repo
        .list_devices()
        .await?
        .into_iter()
        .map(|d| d.with_derived_status(now))
        .collect();
    Ok(Json(devices))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<Device>, ApiError> {
    let mac = MacAddr::parse(&mac)?;
    let device = state
        .repo
        .device_by_mac(&mac)
        .await?
        .ok_or_else(|| ApiError::not_found("device not found"))?;
    Ok(Json(device.with_derived_status(Utc::now())))
}

/// MAC-based first-seen registration: an existing MAC gets its metadata
/// refreshed instead of a conflict.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Result<Json<Device>, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("device name must not be empty"));
    }

    let existing = state.repo.device_by_mac(&req.mac).await?;
    let device = match existing {
        Some(_) => {
            let (name, group, location) = (req.name.clone(), req.group.clone(), req.location.clone());
            state
                .repo
                .update_device(
                    &req.mac,
                    Box::new(move |d| {
                        d.name = name;
                        if let Some(group) = group {
                            d.group = group;
                        }
                        if location.is_some() {
                            d.location = location;
                        }
                        Ok(())
                    }),
                )
                .await?
        }
        None => {
            let device = state
                .repo
                .insert_device(NewDevice {
                    mac: req.mac.clone(),
                    name: req.name.clone(),
                    group: req.group.clone().unwrap_or_else(|| "default".into()),
                    location: req.location.clone(),
                })
                .await?;
            let _ = state
                .repo
                .append_log(NewDeviceLog {
                    mac: req.mac.clone(),
                    action: LogAction::Register,
                    status: LogStatus::Success,
                    from_version: None,
                    to_version: None,
                    message: None,
                })
                .await;
            state.webhooks.dispatch(
                WebhookEvent::DeviceRegistered,
                json!({"mac": req.mac, "name": req.name}),
            );
            device
        }
    };

    state.audit.record(
        AuditEntry::new("device.register", "device")
            .entity(&device.mac, &device.name)
            .details(json!({"group": device.group})),
    );
    state
        .hub
        .broadcast(ServerEvent::DeviceUpdate {
            device: device.clone().with_derived_status(Utc::now()),
        })
        .await;
    Ok(Json(device))
}

pub async fn update(
    State(state): State<AppState>,
    Path(mac): Path<String>,
    Json(req): Json<UpdateDeviceRequest>,
) -> Result<Json<Device>, ApiError> {
    let mac = MacAddr::parse(&mac)?;
    let device = state
        .repo
        .update_device(
            &mac,
            Box::new(move |d| {
                if let Some(name) = req.name {
                    d.name = name;
                }
                if let Some(group) = req.group {
                    d.group = group;
                }
                if let Some(location) = req.location {
                    d.location = Some(location);
                }
                Ok(())
            }),
        )
        .await?;

    state.audit.record(
        AuditEntry::new("device.update", "device").entity(&device.mac, &device.name),
    );
    Ok(Json(device))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(mac): Path<String>,
    Json(req): Json<DeleteDeviceRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let mac = MacAddr::parse(&mac)?;
    let reason = req.reason.trim();
    if reason.is_empty() {
        return Err(ApiError::bad_request("a deletion reason is required"));
    }
    if reason.chars().count() > MAX_DELETE_REASON_CHARS {
        return Err(ApiError::bad_request("deletion reason is too long"));
    }

    let device = state
        .repo
        .device_by_mac(&mac)
        .await?
        .ok_or_else(|| ApiError::not_found("device not found"))?;

    let _ = state
        .repo
        .append_log(NewDeviceLog {
            mac: mac.clone(),
            action: LogAction::Delete,
            status: LogStatus::Success,
            from_version: None,
            to_version: None,
            message: Some(reason.to_string()),
        })
        .await;
    state.repo.delete_device(&mac).await?;

    state.audit.record(
        AuditEntry::new("device.delete", "device")
            .entity(&device.mac, &device.name)
            .details(json!({"reason": reason}))
            .severity(Severity::Warning),
    );
    Ok(Json(OkResponse::ok()))
}

pub async fn logs(
    State(state): State<AppState>,
    Path(mac): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<DeviceLog>>, ApiError> {
    let mac = MacAddr::parse(&mac)?;
    Ok(Json(
        state
            .repo
            .logs_for(&mac, query.limit.unwrap_or(100))
            .await?,
    ))
}

pub async fn clear_logs(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    let mac = MacAddr::parse(&mac)?;
    state.repo.clear_logs(&mac).await?;
    state
        .audit
        .record(AuditEntry::new("device.clear_logs", "device").entity(&mac, mac.as_str()));
    Ok(Json(OkResponse::ok()))
}

pub async fn heartbeats(
    State(state): State<AppState>,
    Path(mac): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<DeviceHeartbeat>>, ApiError> {
    let mac = MacAddr::parse(&mac)?;
    Ok(Json(
        state
            .repo
            .heartbeats_for(&mac, query.limit.unwrap_or(100))
            .await?,
    ))
}

pub async fn reset(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<Device>, ApiError> {
    let mac = MacAddr::parse(&mac)?;
    let device = state.ota.reset(&mac).await?;
    state.audit.record(
        AuditEntry::new("device.reset", "device").entity(&device.mac, &device.name),
    );
    Ok(Json(device))
}

pub async fn rollback(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<Device>, ApiError> {
    let mac = MacAddr::parse(&mac)?;
    let device = state.watchdog.force_rollback(&mac).await?;
    state.audit.record(
        AuditEntry::new("device.force_rollback", "device")
            .entity(&device.mac, &device.name)
            .details(json!({"targetVersion": device.target_version}))
            .severity(Severity::Warning),
    );
    Ok(Json(device))
}

pub async fn clear_at_risk(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<Device>, ApiError> {
    let mac = MacAddr::parse(&mac)?;
    let device = state.watchdog.clear_at_risk(&mac).await?;
    state.audit.record(
        AuditEntry::new("device.clear_at_risk", "device").entity(&device.mac, &device.name),
    );
    Ok(Json(device))
}

pub async fn send_command(
    State(state): State<AppState>,
    Path(mac): Path<String>,
    Json(req): Json<EnqueueCommandRequest>,
) -> Result<Json<common::DeviceCommand>, ApiError> {
    let mac = MacAddr::parse(&mac)?;
    let command = state
        .pipe
        .enqueue_command(&mac, req.command, req.payload)
        .await?;
    state.audit.record(
        AuditEntry::new("device.command", "device")
            .entity(&mac, mac.as_str())
            .details(json!({"command": command.command})),
    );
    Ok(Json(command))
}

pub async fn at_risk(State(state): State<AppState>) -> Result<Json<Vec<Device>>, ApiError> {
    let now = Utc::now();
    let devices = state
        .repo
        .list_devices()
        .await?
        .into_iter()
        .filter(|d| d.is_at_risk)
        .map(|d| d.with_derived_status(now))
        .collect();
    Ok(Json(devices))
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<FleetStats>, ApiError> {
    let now = Utc::now();
    let devices = state.repo.list_devices().await?;

    let mut ota_status: HashMap<String, usize> = HashMap::new();
    let mut versions: HashMap<String, usize> = HashMap::new();
    let mut online = 0;
    let mut at_risk = 0;

    for device in &devices {
        *ota_status
            .entry(ota_status_label(device.ota_status).to_string())
            .or_default() += 1;
        if !device.current_version.is_empty() {
            *versions.entry(device.current_version.clone()).or_default() += 1;
        }
        if device.online_status(now) == ConnStatus::Online {
            online += 1;
        }
        if device.is_at_risk {
            at_risk += 1;
        }
    }

    Ok(Json(FleetStats {
        total_devices: devices.len(),
        online,
        offline: devices.len() - online,
        at_risk,
        ota_status,
        versions,
    }))
}

pub async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.queue.status().await)
}

fn ota_status_label(status: common::OtaStatus) -> &'static str {
    use common::OtaStatus::*;
    match status {
        Idle => "idle",
        Pending => "pending",
        Updating => "updating",
        Updated => "updated",
        Failed => "failed",
    }
}

/// `POST /api/deploy` — per-device admission results; a rejected device never
/// blocks the rest of the batch.
pub async fn deploy(
    State(state): State<AppState>,
    Json(req): Json<DeployRequest>,
) -> Result<Json<DeployResponse>, ApiError> {
    if req.device_ids.is_empty() {
        return Err(ApiError::bad_request("deviceIds must not be empty"));
    }
    if state.repo.firmware_by_version(&req.version).await?.is_none() {
        return Err(ApiError::not_found(format!(
            "firmware {} not found",
            req.version
        )));
    }

    let mut results = Vec::with_capacity(req.device_ids.len());
    for mac in &req.device_ids {
        let result = state
            .queue
            .queue_update(mac.clone(), req.version.clone())
            .await;
        results.push(match result {
            Ok(()) => DeployResult {
                mac: mac.clone(),
                status: "queued".into(),
                message: None,
            },
            Err(err) => DeployResult {
                mac: mac.clone(),
                status: "failed".into(),
                message: Some(err.to_string()),
            },
        });
    }

    state.audit.record(
        AuditEntry::new("device.deploy", "firmware")
            .entity(req.version.as_str(), req.version.as_str())
            .details(json!({
                "devices": req.device_ids,
                "queued": results.iter().filter(|r| r.status == "queued").count(),
            })),
    );
    Ok(Json(DeployResponse { results }))
}
