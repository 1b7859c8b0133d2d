//! Operator firmware management: streaming upload, listing, diff, delete.

use crate::audit::AuditEntry;
use crate::error::ApiError;
use crate::webhooks::WebhookEvent;
use crate::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::Json;
use common::{Firmware, FirmwareDiff, FirmwareVersion, OkResponse, Severity};
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use std::io;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQuery {
    pub version: FirmwareVersion,
    #[serde(default = "default_filename")]
    pub filename: String,
    pub notes: Option<String>,
}

fn default_filename() -> String {
    "firmware.bin".into()
}

/// `POST /api/firmware?version=v1.2.0&filename=blink.bin` with the raw image
/// as the request body.
pub async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Body,
) -> Result<Json<Firmware>, ApiError> {
    let stream = body
        .into_data_stream()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err));

    let firmware = state
        .firmware
        .upload(query.version, &query.filename, query.notes, stream)
        .await?;

    state.webhooks.dispatch(
        WebhookEvent::FirmwareUploaded,
        json!({
            "version": firmware.version,
            "size": firmware.size,
            "checksum": firmware.checksum,
        }),
    );
    state.audit.record(
        AuditEntry::new("firmware.upload", "firmware")
            .entity(firmware.id, firmware.version.as_str())
            .details(json!({"size": firmware.size, "filename": firmware.filename})),
    );
    Ok(Json(firmware))
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Firmware>>, ApiError> {
    Ok(Json(state.firmware.list().await?))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> Result<Json<Firmware>, ApiError> {
    let version = FirmwareVersion::parse(&version)?;
    state
        .firmware
        .get(&version)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("firmware {version} not found")))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    let version = FirmwareVersion::parse(&version)?;
    state.firmware.delete(&version).await?;
    state.audit.record(
        AuditEntry::new("firmware.delete", "firmware")
            .entity(version.as_str(), version.as_str())
            .severity(Severity::Warning),
    );
    Ok(Json(OkResponse::ok()))
}

/// `GET /api/firmware/:a/diff/:b` — byte-level comparison.
pub async fn diff(
    State(state): State<AppState>,
    Path((a, b)): Path<(String, String)>,
) -> Result<Json<FirmwareDiff>, ApiError> {
    let a = FirmwareVersion::parse(&a)?;
    let b = FirmwareVersion::parse(&b)?;
    Ok(Json(state.firmware.diff(&a, &b).await?))
}
