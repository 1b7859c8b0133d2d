//! Audit trail for operator-initiated actions. Recording is fire-and-forget:
//! a failed write is logged and swallowed so it can never fail the operation
//! being audited. Sensitive fields are redacted before anything is stored.

use crate::store::{NewAuditRecord, Repository};
use common::Severity;
use serde_json::Value;
use std::sync::Arc;
use tracing::error;

const REDACTED: &str = "[REDACTED]";

#[derive(Clone)]
pub struct AuditRecorder {
    repo: Arc<dyn Repository>,
}

/// Builder-ish description of one auditable action.
#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub username: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub entity_name: Option<String>,
    pub details: Option<Value>,
    pub ip: Option<String>,
    pub severity: Severity,
}

impl AuditEntry {
    pub fn new(action: &str, entity_type: &str) -> Self {
        AuditEntry {
            username: "admin".into(),
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id: None,
            entity_name: None,
            details: None,
            ip: None,
            severity: Severity::Info,
        }
    }

    pub fn entity(mut self, id: impl ToString, name: impl Into<String>) -> Self {
        self.entity_id = Some(id.to_string());
        self.entity_name = Some(name.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

impl AuditRecorder {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        AuditRecorder { repo }
    }

    pub fn record(&self, entry: AuditEntry) {
        let recorder = self.clone();
        tokio::spawn(async move {
            recorder.record_now(entry).await;
        });
    }

    pub async fn record_now(&self, mut entry: AuditEntry) {
        if let Some(details) = entry.details.as_mut() {
            redact(details);
        }

        let result = self
            .repo
            .insert_audit(NewAuditRecord {
                username: entry.username,
                action: entry.action.clone(),
                entity_type: entry.entity_type,
                entity_id: entry.entity_id,
                entity_name: entry.entity_name,
                details: entry.details,
                ip: entry.ip,
                severity: entry.severity,
            })
            .await;
        if let Err(err) = result {
            error!("audit write for {:?} failed: {err}", entry.action);
        }
    }
}

/// Replaces the value of any key that looks like a credential.
pub fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if is_sensitive(key) {
                    *val = Value::String(REDACTED.into());
                } else {
                    redact(val);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact(item);
            }
        }
        _ => {}
    }
}

fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.contains("secret")
        || key.contains("password")
        || key.contains("token")
        || key.contains("apikey")
        || key.contains("api_key")
        || key.contains("api-key")
        || key.contains("authorization")
}
