use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;
use tracing::error;

use crate::firmware::FirmwareError;
use crate::ota::OtaError;
use crate::pipe::PipeError;
use crate::queue::QueueError;
use crate::rollout::RolloutError;
use crate::store::StoreError;

/// The HTTP error envelope. Every handler failure maps onto one of these;
/// the response body is `{"error": ..., "timestamp": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("invalid credentials")]
    Unauthorized,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ApiError::BadRequest(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError::NotFound(msg.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal error: {self:#}");
        }
        // Internal detail stays in the log; the caller gets a short string.
        let message = match &self {
            ApiError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        let body = Json(json!({
            "error": message,
            "timestamp": Utc::now(),
        }));
        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            StoreError::Invalid(msg) => ApiError::BadRequest(msg),
            StoreError::Internal(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::DeviceNotFound => ApiError::NotFound("device not found".into()),
            QueueError::AlreadyUpdating | QueueError::DuplicateRecent => {
                ApiError::Conflict(err.to_string())
            }
            QueueError::Internal(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

impl From<OtaError> for ApiError {
    fn from(err: OtaError) -> Self {
        match err {
            OtaError::DeviceNotRegistered => ApiError::NotFound(err.to_string()),
            OtaError::Store(inner) => inner.into(),
        }
    }
}

impl From<PipeError> for ApiError {
    fn from(err: PipeError) -> Self {
        match err {
            PipeError::DeviceNotRegistered
            | PipeError::ConfigNotFound
            | PipeError::CommandNotFound => ApiError::NotFound(err.to_string()),
            PipeError::Invalid(msg) => ApiError::BadRequest(msg),
            PipeError::Store(inner) => inner.into(),
        }
    }
}

impl From<RolloutError> for ApiError {
    fn from(err: RolloutError) -> Self {
        match err {
            RolloutError::Invalid(msg) => ApiError::BadRequest(msg),
            RolloutError::NotFound | RolloutError::FirmwareMissing(_) => {
                ApiError::NotFound(err.to_string())
            }
            RolloutError::WrongState(_) => ApiError::Conflict(err.to_string()),
            RolloutError::Store(inner) => inner.into(),
        }
    }
}

impl From<FirmwareError> for ApiError {
    fn from(err: FirmwareError) -> Self {
        match err {
            FirmwareError::VersionExists(_) => ApiError::Conflict(err.to_string()),
            FirmwareError::NotFound(_) => ApiError::NotFound(err.to_string()),
            FirmwareError::TooLarge
            | FirmwareError::BadExtension(_)
            | FirmwareError::PathTraversal => ApiError::BadRequest(err.to_string()),
            FirmwareError::Io(inner) => ApiError::Internal(inner.into()),
            FirmwareError::Store(inner) => inner.into(),
        }
    }
}

impl From<common::InvalidMac> for ApiError {
    fn from(err: common::InvalidMac) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<common::InvalidVersion> for ApiError {
    fn from(err: common::InvalidVersion) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}
