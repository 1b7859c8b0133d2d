//! Outbound lifecycle notifications. Delivery is fire-and-forget: the caller
//! never waits on or fails because of a webhook. Failures are surfaced
//! through each hook's `failureCount` and status fields.

use crate::store::Repository;
use chrono::Utc;
use common::Webhook;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebhookEvent {
    UpdateSuccess,
    UpdateFailed,
    DeviceAtRisk,
    DeviceRegistered,
    FirmwareUploaded,
    RolloutCompleted,
}

impl WebhookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::UpdateSuccess => "update.success",
            WebhookEvent::UpdateFailed => "update.failed",
            WebhookEvent::DeviceAtRisk => "device.at_risk",
            WebhookEvent::DeviceRegistered => "device.registered",
            WebhookEvent::FirmwareUploaded => "firmware.uploaded",
            WebhookEvent::RolloutCompleted => "rollout.completed",
        }
    }
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    repo: Arc<dyn Repository>,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .expect("reqwest client");
        WebhookDispatcher { repo, client }
    }

    /// Enumerates subscribed hooks and posts to each in the background.
    pub fn dispatch(&self, event: WebhookEvent, data: serde_json::Value) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.dispatch_now(event, data).await;
        });
    }

    async fn dispatch_now(&self, event: WebhookEvent, data: serde_json::Value) {
        let hooks = match self.repo.list_webhooks().await {
            Ok(hooks) => hooks,
            Err(err) => {
                error!("webhook dispatch: listing hooks failed: {err}");
                return;
            }
        };

        for hook in hooks
            .into_iter()
            .filter(|h| h.active && h.subscribes_to(event.as_str()))
        {
            self.deliver(&hook, event.as_str(), data.clone(), false).await;
        }
    }

    /// Sends a synthetic `update.success` carrying `{"test": true}` to one
    /// hook regardless of its event subscriptions.
    pub async fn send_test(&self, hook: &Webhook) -> Option<u16> {
        self.deliver(hook, WebhookEvent::UpdateSuccess.as_str(), json!({"test": true}), true)
            .await
    }

    async fn deliver(
        &self,
        hook: &Webhook,
        event: &str,
        data: serde_json::Value,
        test: bool,
    ) -> Option<u16> {
        let timestamp = Utc::now();
        let payload = json!({
            "event": event,
            "timestamp": timestamp,
            "data": data,
        });
        let body = payload.to_string();

        let mut request = self
            .client
            .post(&hook.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Event", event)
            .header("X-Webhook-Timestamp", timestamp.to_rfc3339());
        if test {
            request = request.header("X-Webhook-Test", "true");
        }
        if let Some(secret) = &hook.secret {
            request = request.header("X-Webhook-Signature", sign(secret, &body));
        }

        let outcome = request.body(body).send().await;
        let status = match &outcome {
            Ok(response) => Some(response.status().as_u16()),
            Err(err) => {
                warn!("webhook {} ({}) delivery failed: {err}", hook.name, hook.url);
                None
            }
        };
        let success = status.map_or(false, |s| (200..300).contains(&s));

        let update = self
            .repo
            .update_webhook(
                hook.id,
                Box::new(move |h| {
                    h.last_triggered_at = Some(timestamp);
                    h.last_status_code = status;
                    if success {
                        h.failure_count = 0;
                    } else {
                        h.failure_count += 1;
                    }
                    Ok(())
                }),
            )
            .await;
        if let Err(err) = update {
            error!("webhook {} status bookkeeping failed: {err}", hook.id);
        }

        status
    }
}

/// `sha256=<hex hmac>` over the exact payload body.
pub fn sign(secret: &str, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
