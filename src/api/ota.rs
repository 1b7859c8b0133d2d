//! Device-facing HTTP handlers: the check/stream/report protocol plus the
//! pull endpoints for configs and commands.

use crate::error::ApiError;
use crate::ota::CheckOutcome;
use crate::store::{NewDeviceLog, Repository};
use crate::AppState;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use common::{
    CheckQuery, CheckResponse, CommandAckRequest, ConfigAckRequest, ConsoleRequest, Firmware,
    HeartbeatRequest, LogAction, LogStatus, MacAddr, MacQuery, OkResponse,
    PendingCommandsResponse, PendingConfigResponse, ProgressRequest, ReportRequest,
};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::warn;

/// `GET /ota/check` — poll for an update; 302 to the image when one is due.
pub async fn check(
    State(state): State<AppState>,
    Query(query): Query<CheckQuery>,
) -> Result<Response, ApiError> {
    if !state.limits.check.allow(query.device_id.as_str()) {
        return Err(ApiError::RateLimited);
    }

    match state.ota.check(&query.device_id, query.version).await? {
        CheckOutcome::UpToDate { current_version } => Ok(Json(CheckResponse {
            update_available: false,
            current_version: Some(current_version),
            error: None,
        })
        .into_response()),
        CheckOutcome::FirmwareMissing { target } => Ok(Json(CheckResponse {
            update_available: false,
            current_version: None,
            error: Some(format!("firmware {target} not available")),
        })
        .into_response()),
        CheckOutcome::UpdateAvailable { firmware } => Ok(Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, format!("/firmware/{}", firmware.filename))
            .body(Body::empty())
            .expect("static redirect headers")),
    }
}

/// `GET /ota/update` — check and stream in one round trip; 304 when current.
pub async fn update(
    State(state): State<AppState>,
    Query(query): Query<CheckQuery>,
) -> Result<Response, ApiError> {
    if !state.limits.allow_download() {
        return Err(ApiError::RateLimited);
    }

    match state.ota.check(&query.device_id, query.version).await? {
        CheckOutcome::UpToDate { .. } | CheckOutcome::FirmwareMissing { .. } => {
            Ok(StatusCode::NOT_MODIFIED.into_response())
        }
        CheckOutcome::UpdateAvailable { firmware } => {
            let read = state.firmware.stream(&firmware.version).await?;
            Ok(firmware_response(
                &read.firmware,
                logged_stream(read.stream, state.clone(), query.device_id.clone()),
            ))
        }
    }
}

/// `GET /firmware/:filename` — the redirect target of `check`, traversal
/// guarded inside the store.
pub async fn firmware_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    if !state.limits.allow_download() {
        return Err(ApiError::RateLimited);
    }

    let (firmware, stream) = state.firmware.open_by_filename(&filename).await?;
    Ok(firmware_response(&firmware, stream))
}

/// `POST /ota/report` — device verdict after flashing.
pub async fn report(
    State(state): State<AppState>,
    Json(req): Json<ReportRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    state
        .ota
        .report(&req.device_id, req.status, req.version, req.message)
        .await?;
    Ok(Json(OkResponse::ok()))
}

/// `POST /ota/progress` — fan-out only.
pub async fn progress(
    State(state): State<AppState>,
    Json(req): Json<ProgressRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    if req.progress > 100 {
        return Err(ApiError::bad_request("progress must be within 0..=100"));
    }
    state.ota.progress(&req).await?;
    Ok(Json(OkResponse::ok()))
}

/// `POST /ota/heartbeat` — health sample, registers first-seen MACs.
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    state.ota.heartbeat(&req).await?;
    Ok(Json(OkResponse::ok()))
}

/// `POST /ota/console` — remote-console line, fanned out to subscribers.
pub async fn console(
    State(state): State<AppState>,
    Json(req): Json<ConsoleRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    state.ota.console(&req.device_id, req.line).await?;
    Ok(Json(OkResponse::ok()))
}

/// `GET /ota/config?mac=` — pending config, if any.
pub async fn pending_config(
    State(state): State<AppState>,
    Query(query): Query<MacQuery>,
) -> Result<Json<PendingConfigResponse>, ApiError> {
    Ok(Json(state.pipe.pending_config(&query.mac).await?))
}

/// `POST /ota/config/ack`.
pub async fn ack_config(
    State(state): State<AppState>,
    Json(req): Json<ConfigAckRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    state.pipe.ack_config(&req.mac, req.config_version).await?;
    Ok(Json(OkResponse::ok()))
}

/// `GET /ota/commands?mac=` — drains pending commands to `sent`.
pub async fn pending_commands(
    State(state): State<AppState>,
    Query(query): Query<MacQuery>,
) -> Result<Json<PendingCommandsResponse>, ApiError> {
    let commands = state.pipe.drain_pending(&query.mac).await?;
    Ok(Json(PendingCommandsResponse { commands }))
}

/// `POST /ota/commands/:id/ack`.
pub async fn ack_command(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<CommandAckRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    state.pipe.acknowledge(id, &req.status, req.response).await?;
    Ok(Json(OkResponse::ok()))
}

fn firmware_response<S>(firmware: &Firmware, stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
{
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, firmware.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", firmware.filename),
        )
        .header("X-Firmware-Version", firmware.version.as_str())
        .header("X-Checksum", firmware.checksum.as_str())
        .body(Body::from_stream(stream))
        .expect("static firmware response headers")
}

/// Wraps the firmware byte stream so completion or failure appends a
/// `download` log entry without ever blocking the response path.
fn logged_stream<S>(inner: S, state: AppState, mac: MacAddr) -> TailLogged<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    TailLogged {
        inner,
        on_done: Some(Box::new(move |outcome| {
            let repo = state.repo.clone();
            tokio::spawn(async move {
                let (status, message) = match outcome {
                    Ok(()) => (LogStatus::Success, None),
                    Err(err) => (LogStatus::Failed, Some(err)),
                };
                append_download_log(repo, mac, status, message).await;
            });
        })),
    }
}

async fn append_download_log(
    repo: Arc<dyn Repository>,
    mac: MacAddr,
    status: LogStatus,
    message: Option<String>,
) {
    let result = repo
        .append_log(NewDeviceLog {
            mac: mac.clone(),
            action: LogAction::Download,
            status,
            from_version: None,
            to_version: None,
            message,
        })
        .await;
    if let Err(err) = result {
        warn!("download log append for {mac} failed: {err}");
    }
}

/// Byte-stream adapter that fires a completion hook exactly once: on clean
/// end, on stream error, or on drop (client disconnect).
struct TailLogged<S> {
    inner: S,
    on_done: Option<Box<dyn FnOnce(Result<(), String>) + Send>>,
}

impl<S> Stream for TailLogged<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(None) => {
                if let Some(done) = self.on_done.take() {
                    done(Ok(()));
                }
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(err))) => {
                if let Some(done) = self.on_done.take() {
                    done(Err(err.to_string()));
                }
                Poll::Ready(Some(Err(err)))
            }
            other => other,
        }
    }
}

impl<S> Drop for TailLogged<S> {
    fn drop(&mut self) {
        if let Some(done) = self.on_done.take() {
            done(Err("stream aborted before completion".into()));
        }
    }
}
