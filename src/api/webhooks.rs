//! Webhook CRUD plus the synthetic-delivery test endpoint.

use crate::audit::AuditEntry;
use crate::error::ApiError;
use crate::store::NewWebhook;
use crate::AppState;
use axum::extract::{Path, State};
use axum::Json;
use common::{CreateWebhookRequest, OkResponse, UpdateWebhookRequest, Webhook};
use serde_json::json;

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateWebhookRequest>,
) -> Result<Json<Webhook>, ApiError> {
    if !req.url.starts_with("http://") && !req.url.starts_with("https://") {
        return Err(ApiError::bad_request("webhook url must be http(s)"));
    }
    if req.events.is_empty() {
        return Err(ApiError::bad_request("subscribe to at least one event"));
    }

    let hook = state
        .repo
        .insert_webhook(NewWebhook {
            name: req.name,
            url: req.url,
            secret: req.secret,
            events: req.events,
            active: req.active,
        })
        .await?;

    state.audit.record(
        AuditEntry::new("webhook.create", "webhook")
            .entity(hook.id, &hook.name)
            .details(json!({"url": hook.url, "events": hook.events, "secret": hook.secret})),
    );
    Ok(Json(hook))
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Webhook>>, ApiError> {
    Ok(Json(state.repo.list_webhooks().await?))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateWebhookRequest>,
) -> Result<Json<Webhook>, ApiError> {
    let hook = state
        .repo
        .update_webhook(
            id,
            Box::new(move |h| {
                if let Some(name) = req.name {
                    h.name = name;
                }
                if let Some(url) = req.url {
                    h.url = url;
                }
                if let Some(secret) = req.secret {
                    h.secret = secret;
                }
                if let Some(events) = req.events {
                    h.events = events;
                }
                if let Some(active) = req.active {
                    h.active = active;
                }
                Ok(())
            }),
        )
        .await?;

    state
        .audit
        .record(AuditEntry::new("webhook.update", "webhook").entity(hook.id, &hook.name));
    Ok(Json(hook))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<OkResponse>, ApiError> {
    state.repo.delete_webhook(id).await?;
    state
        .audit
        .record(AuditEntry::new("webhook.delete", "webhook").entity(id, format!("webhook {id}")));
    Ok(Json(OkResponse::ok()))
}

/// `POST /api/webhooks/:id/test` — synchronous synthetic delivery so the
/// operator sees the endpoint's response code immediately.
pub async fn test(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let hook = state
        .repo
        .webhook_by_id(id)
        .await?
        .ok_or_else(|| ApiError::not_found("webhook not found"))?;

    let status = state.webhooks.send_test(&hook).await;
    state
        .audit
        .record(AuditEntry::new("webhook.test", "webhook").entity(hook.id, &hook.name));
    Ok(Json(json!({
        "success": status.map_or(false, |s| (200..300).contains(&s)),
        "statusCode": status,
    })))
}
