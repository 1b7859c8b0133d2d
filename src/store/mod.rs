//! Storage port. The rest of the server only ever talks to [`Repository`];
//! the in-process [`MemoryRepository`] implements it and doubles as the test
//! backend. All mutations go through closure-based `update_*` methods that
//! commit atomically: if the closure errors, nothing is written.

mod memory;

pub use memory::MemoryRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    AuditRecord, ConfigAssignment, Device, DeviceCommand, DeviceConfig, DeviceHeartbeat,
    DeviceLog, Firmware, FirmwareVersion, LogAction, LogStatus, MacAddr, Severity,
    StagedRollout, Webhook,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Invalid(String),
    #[error("storage failure: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// In-place entity mutation, applied transactionally by the repository.
pub type Mutation<T> = Box<dyn FnOnce(&mut T) -> Result<(), StoreError> + Send>;

#[derive(Clone, Debug)]
pub struct NewDevice {
    pub mac: MacAddr,
    pub name: String,
    pub group: String,
    pub location: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewDeviceLog {
    pub mac: MacAddr,
    pub action: LogAction,
    pub status: LogStatus,
    pub from_version: Option<String>,
    pub to_version: Option<String>,
    pub message: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewFirmware {
    pub version: FirmwareVersion,
    pub filename: String,
    pub size: u64,
    pub checksum: String,
    pub notes: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewHeartbeat {
    pub mac: MacAddr,
    pub rssi: Option<i32>,
    pub free_heap: Option<u64>,
    pub uptime: Option<u64>,
    pub cpu_temp: Option<f64>,
}

#[derive(Clone, Debug)]
pub struct NewRollout {
    pub version: FirmwareVersion,
    pub stage_percentages: Vec<u8>,
    pub total_devices: usize,
    pub auto_expand: bool,
    pub expand_after_minutes: i64,
    pub failure_threshold: u8,
    pub status: common::RolloutStatus,
}

#[derive(Clone, Debug)]
pub struct NewAuditRecord {
    pub username: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub entity_name: Option<String>,
    pub details: Option<serde_json::Value>,
    pub ip: Option<String>,
    pub severity: Severity,
}

#[derive(Clone, Debug)]
pub struct NewWebhook {
    pub name: String,
    pub url: String,
    pub secret: Option<String>,
    pub events: Vec<String>,
    pub active: bool,
}

#[derive(Clone, Debug)]
pub struct NewDeviceConfig {
    pub name: String,
    pub config_data: serde_json::Value,
}

#[derive(Clone, Debug)]
pub struct NewCommand {
    pub mac: MacAddr,
    pub command: String,
    pub payload: Option<serde_json::Value>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct AuditFilter {
    pub severity: Option<Severity>,
    pub entity_type: Option<String>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    // Devices
    async fn insert_device(&self, new: NewDevice) -> StoreResult<Device>;
    async fn device_by_mac(&self, mac: &MacAddr) -> StoreResult<Option<Device>>;
    async fn device_by_id(&self, id: i64) -> StoreResult<Option<Device>>;
    /// All devices in stable id order (creation order).
    async fn list_devices(&self) -> StoreResult<Vec<Device>>;
    async fn update_device(&self, mac: &MacAddr, mutate: Mutation<Device>)
        -> StoreResult<Device>;
    async fn delete_device(&self, mac: &MacAddr) -> StoreResult<()>;

    // Device logs
    async fn append_log(&self, entry: NewDeviceLog) -> StoreResult<DeviceLog>;
    async fn logs_for(&self, mac: &MacAddr, limit: usize) -> StoreResult<Vec<DeviceLog>>;
    async fn clear_logs(&self, mac: &MacAddr) -> StoreResult<()>;

    // Firmware
    async fn insert_firmware(&self, new: NewFirmware) -> StoreResult<Firmware>;
    async fn firmware_by_version(&self, version: &FirmwareVersion)
        -> StoreResult<Option<Firmware>>;
    async fn firmware_by_id(&self, id: i64) -> StoreResult<Option<Firmware>>;
    async fn list_firmware(&self) -> StoreResult<Vec<Firmware>>;
    async fn delete_firmware(&self, version: &FirmwareVersion) -> StoreResult<()>;
    async fn record_download(&self, version: &FirmwareVersion) -> StoreResult<()>;

    // Heartbeats
    async fn insert_heartbeat(&self, new: NewHeartbeat) -> StoreResult<DeviceHeartbeat>;
    async fn heartbeats_for(
        &self,
        mac: &MacAddr,
        limit: usize,
    ) -> StoreResult<Vec<DeviceHeartbeat>>;

    // Rollouts
    async fn insert_rollout(&self, new: NewRollout) -> StoreResult<StagedRollout>;
    async fn rollout_by_id(&self, id: i64) -> StoreResult<Option<StagedRollout>>;
    async fn list_rollouts(&self) -> StoreResult<Vec<StagedRollout>>;
    async fn update_rollout(
        &self,
        id: i64,
        mutate: Mutation<StagedRollout>,
    ) -> StoreResult<StagedRollout>;
    async fn delete_rollout(&self, id: i64) -> StoreResult<()>;

    // Audit
    async fn insert_audit(&self, new: NewAuditRecord) -> StoreResult<AuditRecord>;
    async fn list_audit(&self, filter: AuditFilter) -> StoreResult<Vec<AuditRecord>>;

    // Webhooks
    async fn insert_webhook(&self, new: NewWebhook) -> StoreResult<Webhook>;
    async fn webhook_by_id(&self, id: i64) -> StoreResult<Option<Webhook>>;
    async fn list_webhooks(&self) -> StoreResult<Vec<Webhook>>;
    async fn update_webhook(&self, id: i64, mutate: Mutation<Webhook>) -> StoreResult<Webhook>;
    async fn delete_webhook(&self, id: i64) -> StoreResult<()>;

    // Device configs & assignments
    async fn insert_config(&self, new: NewDeviceConfig) -> StoreResult<DeviceConfig>;
    async fn config_by_id(&self, id: i64) -> StoreResult<Option<DeviceConfig>>;
    async fn list_configs(&self) -> StoreResult<Vec<DeviceConfig>>;
    async fn update_config(
        &self,
        id: i64,
        mutate: Mutation<DeviceConfig>,
    ) -> StoreResult<DeviceConfig>;
    /// Cascades: assignments referencing the config are removed.
    async fn delete_config(&self, id: i64) -> StoreResult<()>;
    async fn upsert_assignment(&self, assignment: ConfigAssignment)
        -> StoreResult<ConfigAssignment>;
    async fn assignment_for(&self, mac: &MacAddr) -> StoreResult<Option<ConfigAssignment>>;
    async fn update_assignment(
        &self,
        mac: &MacAddr,
        mutate: Mutation<ConfigAssignment>,
    ) -> StoreResult<ConfigAssignment>;

    // Commands
    async fn insert_command(&self, new: NewCommand) -> StoreResult<DeviceCommand>;
    async fn command_by_id(&self, id: i64) -> StoreResult<Option<DeviceCommand>>;
    async fn pending_commands(&self, mac: &MacAddr) -> StoreResult<Vec<DeviceCommand>>;
    async fn update_command(
        &self,
        id: i64,
        mutate: Mutation<DeviceCommand>,
    ) -> StoreResult<DeviceCommand>;
    /// One sweep marking every overdue pending command expired. Returns how
    /// many were transitioned.
    async fn expire_commands(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

