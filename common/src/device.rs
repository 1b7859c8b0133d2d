use crate::mac::MacAddr;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How long after the last contact a device still counts as online.
pub const ONLINE_THRESHOLD_SECS: i64 = 5 * 60;

/// Per-device OTA lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OtaStatus {
    Idle,
    Pending,
    Updating,
    Updated,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnStatus {
    Online,
    Offline,
}

/// A registered fleet device.
///
/// The version triple (`current`/`previous`/`target`) uses empty strings for
/// "no version", matching what first-seen devices report. The stored `status`
/// is a hint; readers derive online/offline from `last_seen` via
/// [`Device::online_status`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: i64,
    pub mac: MacAddr,
    pub name: String,
    pub group: String,
    pub current_version: String,
    pub previous_version: String,
    pub target_version: String,
    pub ota_status: OtaStatus,
    pub status: ConnStatus,
    pub health_score: u8,
    pub signal_strength: Option<i32>,
    pub free_heap: Option<u64>,
    pub uptime: Option<u64>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub update_started_at: Option<DateTime<Utc>>,
    pub expected_checkin_by: Option<DateTime<Utc>>,
    pub update_attempts: u32,
    pub is_at_risk: bool,
    pub location: Option<String>,
    pub config_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_ota_check: Option<DateTime<Utc>>,
}

impl Device {
    pub fn online_status(&self, now: DateTime<Utc>) -> ConnStatus {
        match self.last_seen {
            Some(seen) if now - seen <= Duration::seconds(ONLINE_THRESHOLD_SECS) => {
                ConnStatus::Online
            }
            _ => ConnStatus::Offline,
        }
    }

    /// Copy with `status` re-derived from `last_seen`. Applied on every read
    /// path so a stale stored status is never surfaced.
    pub fn with_derived_status(mut self, now: DateTime<Utc>) -> Self {
        self.status = self.online_status(now);
        self
    }
}

/// Append-only device event log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogAction {
    Register,
    Check,
    Download,
    Deploy,
    Report,
    Rollback,
    Reset,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogStatus {
    Pending,
    Success,
    Failed,
    Updated,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLog {
    pub id: i64,
    pub mac: MacAddr,
    pub action: LogAction,
    pub status: LogStatus,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub message: Option<String>,
    pub cleared: bool,
    pub created_at: DateTime<Utc>,
}

/// One time-series health sample, retained for historical queries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHeartbeat {
    pub id: i64,
    pub mac: MacAddr,
    pub rssi: Option<i32>,
    pub free_heap: Option<u64>,
    pub uptime: Option<u64>,
    pub cpu_temp: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Failed,
    Expired,
}

/// A remote command queued for pull-based delivery to a device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommand {
    pub id: i64,
    pub mac: MacAddr,
    pub command: String,
    pub payload: Option<serde_json::Value>,
    pub status: CommandStatus,
    pub expires_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssignmentStatus {
    Pending,
    Applied,
    Failed,
}

/// Named runtime configuration blob with a monotonic version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub id: i64,
    pub name: String,
    pub config_data: serde_json::Value,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-device assignment of a [`DeviceConfig`], acked by the device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigAssignment {
    pub mac: MacAddr,
    pub config_id: i64,
    pub config_version: i64,
    pub status: AssignmentStatus,
    pub assigned_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One operator-initiated action, recorded by the audit trail.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: i64,
    pub username: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub entity_name: Option<String>,
    pub details: Option<serde_json::Value>,
    pub ip: Option<String>,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

/// An outbound notification target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub secret: Option<String>,
    /// Subscribed event names; `["*"]` subscribes to everything.
    pub events: Vec<String>,
    pub active: bool,
    pub last_status_code: Option<u16>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == "*" || e == event)
    }
}
