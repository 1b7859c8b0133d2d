//! Staged rollout lifecycle endpoints.

use crate::audit::AuditEntry;
use crate::error::ApiError;
use crate::AppState;
use axum::extract::{Path, State};
use axum::Json;
use common::{CreateRolloutRequest, OkResponse, StagedRollout};
use serde::Serialize;
use serde_json::json;

/// Create/advance responses carry how many devices the operation queued so
/// operators can see each expansion land.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutResponse {
    #[serde(flatten)]
    pub rollout: StagedRollout,
    pub devices_queued: usize,
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateRolloutRequest>,
) -> Result<Json<RolloutResponse>, ApiError> {
    let version = req.version.clone();
    let (rollout, devices_queued) = state.rollouts.create(req).await?;

    state.audit.record(
        AuditEntry::new("rollout.create", "rollout")
            .entity(rollout.id, version.as_str())
            .details(json!({
                "stagePercentages": rollout.stage_percentages,
                "totalDevices": rollout.total_devices,
                "devicesQueued": devices_queued,
            })),
    );
    Ok(Json(RolloutResponse {
        rollout,
        devices_queued,
    }))
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<StagedRollout>>, ApiError> {
    Ok(Json(state.rollouts.list().await?))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<StagedRollout>, ApiError> {
    Ok(Json(state.rollouts.get(id).await?))
}

pub async fn advance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<RolloutResponse>, ApiError> {
    let (rollout, devices_queued) = state.rollouts.advance(id).await?;
    state.audit.record(
        AuditEntry::new("rollout.advance", "rollout")
            .entity(rollout.id, rollout.version.as_str())
            .details(json!({
                "stage": rollout.current_stage,
                "devicesQueued": devices_queued,
            })),
    );
    Ok(Json(RolloutResponse {
        rollout,
        devices_queued,
    }))
}

pub async fn pause(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<StagedRollout>, ApiError> {
    let rollout = state.rollouts.pause(id).await?;
    state.audit.record(
        AuditEntry::new("rollout.pause", "rollout").entity(rollout.id, rollout.version.as_str()),
    );
    Ok(Json(rollout))
}

pub async fn resume(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<StagedRollout>, ApiError> {
    let rollout = state.rollouts.resume(id).await?;
    state.audit.record(
        AuditEntry::new("rollout.resume", "rollout").entity(rollout.id, rollout.version.as_str()),
    );
    Ok(Json(rollout))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<OkResponse>, ApiError> {
    state.rollouts.cancel(id).await?;
    state
        .audit
        .record(AuditEntry::new("rollout.cancel", "rollout").entity(id, format!("rollout {id}")));
    Ok(Json(OkResponse::ok()))
}
