//! Device-config CRUD and push-to-devices endpoints.

use crate::audit::AuditEntry;
use crate::error::ApiError;
use crate::store::NewDeviceConfig;
use crate::AppState;
use axum::extract::{Path, State};
use axum::Json;
use common::{
    CreateConfigRequest, DeviceConfig, OkResponse, PushConfigRequest, UpdateConfigRequest,
};
use serde_json::json;

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateConfigRequest>,
) -> Result<Json<DeviceConfig>, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("config name must not be empty"));
    }
    if !req.config_data.is_object() {
        return Err(ApiError::bad_request("configData must be a JSON object"));
    }

    let config = state
        .repo
        .insert_config(NewDeviceConfig {
            name: req.name,
            config_data: req.config_data,
        })
        .await?;

    state
        .audit
        .record(AuditEntry::new("config.create", "config").entity(config.id, &config.name));
    Ok(Json(config))
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<DeviceConfig>>, ApiError> {
    Ok(Json(state.repo.list_configs().await?))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DeviceConfig>, ApiError> {
    state
        .repo
        .config_by_id(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("config not found"))
}

/// Any successful update bumps the monotonic config version; devices with a
/// pending assignment keep the version they were assigned.
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateConfigRequest>,
) -> Result<Json<DeviceConfig>, ApiError> {
    if let Some(data) = &req.config_data {
        if !data.is_object() {
            return Err(ApiError::bad_request("configData must be a JSON object"));
        }
    }

    let config = state
        .repo
        .update_config(
            id,
            Box::new(move |c| {
                if let Some(name) = req.name {
                    c.name = name;
                }
                if let Some(data) = req.config_data {
                    c.config_data = data;
                }
                c.version += 1;
                Ok(())
            }),
        )
        .await?;

    state
        .audit
        .record(AuditEntry::new("config.update", "config").entity(config.id, &config.name));
    Ok(Json(config))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<OkResponse>, ApiError> {
    state.repo.delete_config(id).await?;
    state
        .audit
        .record(AuditEntry::new("config.delete", "config").entity(id, format!("config {id}")));
    Ok(Json(OkResponse::ok()))
}

/// `POST /api/configs/:id/push {macAddresses}` — assigns the config to each
/// device; per-device failures don't abort the batch.
pub async fn push(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<PushConfigRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.mac_addresses.is_empty() {
        return Err(ApiError::bad_request("macAddresses must not be empty"));
    }

    let mut assigned = 0;
    let mut failures = Vec::new();
    for mac in &req.mac_addresses {
        match state.pipe.assign_config(mac, id).await {
            Ok(_) => assigned += 1,
            Err(err) => failures.push(json!({"mac": mac, "error": err.to_string()})),
        }
    }

    state.audit.record(
        AuditEntry::new("config.push", "config")
            .entity(id, format!("config {id}"))
            .details(json!({"assigned": assigned, "failed": failures.len()})),
    );
    Ok(Json(json!({
        "success": failures.is_empty(),
        "assigned": assigned,
        "failures": failures,
    })))
}
