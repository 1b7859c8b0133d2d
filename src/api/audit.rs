//! Audit-trail queries.

use crate::error::ApiError;
use crate::store::AuditFilter;
use crate::AppState;
use axum::extract::{Query, State};
use axum::Json;
use common::{AuditRecord, Severity};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    pub limit: Option<usize>,
    pub severity: Option<String>,
    pub entity_type: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditRecord>>, ApiError> {
    let severity = match query.severity.as_deref() {
        None => None,
        Some("info") => Some(Severity::Info),
        Some("warning") => Some(Severity::Warning),
        Some("critical") => Some(Severity::Critical),
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "unknown severity {other:?}"
            )))
        }
    };

    let records = state
        .repo
        .list_audit(AuditFilter {
            severity,
            entity_type: query.entity_type,
            limit: query.limit,
        })
        .await?;
    Ok(Json(records))
}
