use super::{
    AuditFilter, Mutation, NewAuditRecord, NewCommand, NewDevice, NewDeviceConfig, NewDeviceLog,
    NewFirmware, NewHeartbeat, NewRollout, NewWebhook, Repository, StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    AuditRecord, CommandStatus, ConfigAssignment, ConnStatus, Device, DeviceCommand,
    DeviceConfig, DeviceHeartbeat, DeviceLog, Firmware, FirmwareVersion, MacAddr, OtaStatus,
    StagedRollout, Webhook,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// The in-process repository. One write lock covers every read-modify-write,
/// which is what serializes per-device state transitions; mutation closures
/// run against a clone and are only committed on `Ok`.
pub struct MemoryRepository {
    inner: RwLock<Inner>,
    #[cfg(test)]
    fail_next_log: std::sync::atomic::AtomicBool,
}

#[derive(Default)]
struct Inner {
    devices: HashMap<MacAddr, Device>,
    logs: Vec<DeviceLog>,
    firmware: HashMap<String, Firmware>,
    heartbeats: Vec<DeviceHeartbeat>,
    rollouts: HashMap<i64, StagedRollout>,
    audit: Vec<AuditRecord>,
    webhooks: HashMap<i64, Webhook>,
    configs: HashMap<i64, DeviceConfig>,
    assignments: HashMap<MacAddr, ConfigAssignment>,
    commands: HashMap<i64, DeviceCommand>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        MemoryRepository {
            inner: RwLock::new(Inner::default()),
            #[cfg(test)]
            fail_next_log: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Makes the next `append_log` call fail, for exercising transactional
    /// rollback paths.
    #[cfg(test)]
    pub fn fail_next_log(&self) {
        self.fail_next_log
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn insert_device(&self, new: NewDevice) -> StoreResult<Device> {
        let mut inner = self.inner.write().await;
        if inner.devices.contains_key(&new.mac) {
            return Err(StoreError::Conflict(format!(
                "device {} already registered",
                new.mac
            )));
        }

        let now = Utc::now();
        let device = Device {
            id: inner.next_id(),
            mac: new.mac.clone(),
            name: new.name,
            group: new.group,
            current_version: String::new(),
            previous_version: String::new(),
            target_version: String::new(),
            ota_status: OtaStatus::Idle,
            status: ConnStatus::Offline,
            health_score: 100,
            signal_strength: None,
            free_heap: None,
            uptime: None,
            last_heartbeat: None,
            consecutive_failures: 0,
            update_started_at: None,
            expected_checkin_by: None,
            update_attempts: 0,
            is_at_risk: false,
            location: new.location,
            config_version: 0,
            created_at: now,
            updated_at: now,
            last_seen: None,
            last_ota_check: None,
        };
        inner.devices.insert(new.mac, device.clone());
        Ok(device)
    }

    async fn device_by_mac(&self, mac: &MacAddr) -> StoreResult<Option<Device>> {
        let inner = self.inner.read().await;
        Ok(inner.devices.get(mac).cloned())
    }

    async fn device_by_id(&self, id: i64) -> StoreResult<Option<Device>> {
        let inner = self.inner.read().await;
        Ok(inner.devices.values().find(|d| d.id == id).cloned())
    }

    async fn list_devices(&self) -> StoreResult<Vec<Device>> {
        let inner = self.inner.read().await;
        let mut devices: Vec<_> = inner.devices.values().cloned().collect();
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }

    async fn update_device(
        &self,
        mac: &MacAddr,
        mutate: Mutation<Device>,
    ) -> StoreResult<Device> {
        let mut inner = self.inner.write().await;
        let current = inner
            .devices
            .get(mac)
            .ok_or(StoreError::NotFound("device"))?;

        let mut updated = current.clone();
        mutate(&mut updated)?;

        // lastSeen is monotonic: concurrent writers take the max.
        if updated.last_seen < current.last_seen {
            updated.last_seen = current.last_seen;
        }
        updated.updated_at = Utc::now();

        inner.devices.insert(mac.clone(), updated.clone());
        Ok(updated)
    }

    async fn delete_device(&self, mac: &MacAddr) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .devices
            .remove(mac)
            .ok_or(StoreError::NotFound("device"))?;
        inner.assignments.remove(mac);
        inner.commands.retain(|_, c| c.mac != *mac);
        Ok(())
    }

    async fn append_log(&self, entry: NewDeviceLog) -> StoreResult<DeviceLog> {
        #[cfg(test)]
        if self
            .fail_next_log
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(StoreError::Internal("injected log failure".into()));
        }

        let mut inner = self.inner.write().await;
        let log = DeviceLog {
            id: inner.next_id(),
            mac: entry.mac,
            action: entry.action,
            status: entry.status,
            from_version: entry.from_version,
            to_version: entry.to_version,
            message: entry.message,
            cleared: false,
            created_at: Utc::now(),
        };
        inner.logs.push(log.clone());
        Ok(log)
    }

    async fn logs_for(&self, mac: &MacAddr, limit: usize) -> StoreResult<Vec<DeviceLog>> {
        let inner = self.inner.read().await;
        let mut logs: Vec<_> = inner
            .logs
            .iter()
            .filter(|l| l.mac == *mac && !l.cleared)
            .cloned()
            .collect();
        logs.reverse(); // newest first
        logs.truncate(limit);
        Ok(logs)
    }

    async fn clear_logs(&self, mac: &MacAddr) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        for log in inner.logs.iter_mut().filter(|l| l.mac == *mac) {
            log.cleared = true;
        }
        Ok(())
    }

    async fn insert_firmware(&self, new: NewFirmware) -> StoreResult<Firmware> {
        let mut inner = self.inner.write().await;
        let key = new.version.as_str().to_string();
        if inner.firmware.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "firmware {} already exists",
                new.version
            )));
        }

        let firmware = Firmware {
            id: inner.next_id(),
            version: new.version,
            filename: new.filename,
            size: new.size,
            checksum: new.checksum,
            notes: new.notes,
            download_count: 0,
            created_at: Utc::now(),
        };
        inner.firmware.insert(key, firmware.clone());
        Ok(firmware)
    }

    async fn firmware_by_version(
        &self,
        version: &FirmwareVersion,
    ) -> StoreResult<Option<Firmware>> {
        let inner = self.inner.read().await;
        Ok(inner.firmware.get(version.as_str()).cloned())
    }

    async fn firmware_by_id(&self, id: i64) -> StoreResult<Option<Firmware>> {
        let inner = self.inner.read().await;
        Ok(inner.firmware.values().find(|f| f.id == id).cloned())
    }

    async fn list_firmware(&self) -> StoreResult<Vec<Firmware>> {
        let inner = self.inner.read().await;
        let mut firmware: Vec<_> = inner.firmware.values().cloned().collect();
        firmware.sort_by(|a, b| b.version.semver().cmp(&a.version.semver()));
        Ok(firmware)
    }

    async fn delete_firmware(&self, version: &FirmwareVersion) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .firmware
            .remove(version.as_str())
            .ok_or(StoreError::NotFound("firmware"))?;
        Ok(())
    }

    async fn record_download(&self, version: &FirmwareVersion) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let fw = inner
            .firmware
            .get_mut(version.as_str())
            .ok_or(StoreError::NotFound("firmware"))?;
        fw.download_count += 1;
        Ok(())
    }

    async fn insert_heartbeat(&self, new: NewHeartbeat) -> StoreResult<DeviceHeartbeat> {
        let mut inner = self.inner.write().await;
        let hb = DeviceHeartbeat {
            id: inner.next_id(),
            mac: new.mac,
            rssi: new.rssi,
            free_heap: new.free_heap,
            uptime: new.uptime,
            cpu_temp: new.cpu_temp,
            created_at: Utc::now(),
        };
        inner.heartbeats.push(hb.clone());
        Ok(hb)
    }

    async fn heartbeats_for(
        &self,
        mac: &MacAddr,
        limit: usize,
    ) -> StoreResult<Vec<DeviceHeartbeat>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<_> = inner
            .heartbeats
            .iter()
            .filter(|h| h.mac == *mac)
            .cloned()
            .collect();
        rows.reverse();
        rows.truncate(limit);
        Ok(rows)
    }

    async fn insert_rollout(&self, new: NewRollout) -> StoreResult<StagedRollout> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let rollout = StagedRollout {
            id: inner.next_id(),
            version: new.version,
            current_stage: 1,
            stage_percentages: new.stage_percentages,
            status: new.status,
            total_devices: new.total_devices,
            updated_devices: 0,
            failed_devices: 0,
            auto_expand: new.auto_expand,
            expand_after_minutes: new.expand_after_minutes,
            failure_threshold: new.failure_threshold,
            last_expanded: Some(now),
            created_at: now,
        };
        inner.rollouts.insert(rollout.id, rollout.clone());
        Ok(rollout)
    }

    async fn rollout_by_id(&self, id: i64) -> StoreResult<Option<StagedRollout>> {
        let inner = self.inner.read().await;
        Ok(inner.rollouts.get(&id).cloned())
    }

    async fn list_rollouts(&self) -> StoreResult<Vec<StagedRollout>> {
        let inner = self.inner.read().await;
        let mut rollouts: Vec<_> = inner.rollouts.values().cloned().collect();
        rollouts.sort_by_key(|r| r.id);
        Ok(rollouts)
    }

    async fn update_rollout(
        &self,
        id: i64,
        mutate: Mutation<StagedRollout>,
    ) -> StoreResult<StagedRollout> {
        let mut inner = self.inner.write().await;
        let current = inner
            .rollouts
            .get(&id)
            .ok_or(StoreError::NotFound("rollout"))?;

        let mut updated = current.clone();
        mutate(&mut updated)?;
        inner.rollouts.insert(id, updated.clone());
        Ok(updated)
    }

    async fn delete_rollout(&self, id: i64) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .rollouts
            .remove(&id)
            .ok_or(StoreError::NotFound("rollout"))?;
        Ok(())
    }

    async fn insert_audit(&self, new: NewAuditRecord) -> StoreResult<AuditRecord> {
        let mut inner = self.inner.write().await;
        let record = AuditRecord {
            id: inner.next_id(),
            username: new.username,
            action: new.action,
            entity_type: new.entity_type,
            entity_id: new.entity_id,
            entity_name: new.entity_name,
            details: new.details,
            ip: new.ip,
            severity: new.severity,
            created_at: Utc::now(),
        };
        inner.audit.push(record.clone());
        Ok(record)
    }

    async fn list_audit(&self, filter: AuditFilter) -> StoreResult<Vec<AuditRecord>> {
        let inner = self.inner.read().await;
        let mut records: Vec<_> = inner
            .audit
            .iter()
            .filter(|r| filter.severity.map_or(true, |s| r.severity == s))
            .filter(|r| {
                filter
                    .entity_type
                    .as_deref()
                    .map_or(true, |t| r.entity_type == t)
            })
            .cloned()
            .collect();
        records.reverse();
        records.truncate(filter.limit.unwrap_or(100));
        Ok(records)
    }

    async fn insert_webhook(&self, new: NewWebhook) -> StoreResult<Webhook> {
        let mut inner = self.inner.write().await;
        let hook = Webhook {
            id: inner.next_id(),
            name: new.name,
            url: new.url,
            secret: new.secret,
            events: new.events,
            active: new.active,
            last_status_code: None,
            last_triggered_at: None,
            failure_count: 0,
            created_at: Utc::now(),
        };
        inner.webhooks.insert(hook.id, hook.clone());
        Ok(hook)
    }

    async fn webhook_by_id(&self, id: i64) -> StoreResult<Option<Webhook>> {
        let inner = self.inner.read().await;
        Ok(inner.webhooks.get(&id).cloned())
    }

    async fn list_webhooks(&self) -> StoreResult<Vec<Webhook>> {
        let inner = self.inner.read().await;
        let mut hooks: Vec<_> = inner.webhooks.values().cloned().collect();
        hooks.sort_by_key(|w| w.id);
        Ok(hooks)
    }

    async fn update_webhook(&self, id: i64, mutate: Mutation<Webhook>) -> StoreResult<Webhook> {
        let mut inner = self.inner.write().await;
        let current = inner
            .webhooks
            .get(&id)
            .ok_or(StoreError::NotFound("webhook"))?;

        let mut updated = current.clone();
        mutate(&mut updated)?;
        inner.webhooks.insert(id, updated.clone());
        Ok(updated)
    }

    async fn delete_webhook(&self, id: i64) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .webhooks
            .remove(&id)
            .ok_or(StoreError::NotFound("webhook"))?;
        Ok(())
    }

    async fn insert_config(&self, new: NewDeviceConfig) -> StoreResult<DeviceConfig> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let config = DeviceConfig {
            id: inner.next_id(),
            name: new.name,
            config_data: new.config_data,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        inner.configs.insert(config.id, config.clone());
        Ok(config)
    }

    async fn config_by_id(&self, id: i64) -> StoreResult<Option<DeviceConfig>> {
        let inner = self.inner.read().await;
        Ok(inner.configs.get(&id).cloned())
    }

    async fn list_configs(&self) -> StoreResult<Vec<DeviceConfig>> {
        let inner = self.inner.read().await;
        let mut configs: Vec<_> = inner.configs.values().cloned().collect();
        configs.sort_by_key(|c| c.id);
        Ok(configs)
    }

    async fn update_config(
        &self,
        id: i64,
        mutate: Mutation<DeviceConfig>,
    ) -> StoreResult<DeviceConfig> {
        let mut inner = self.inner.write().await;
        let current = inner
            .configs
            .get(&id)
            .ok_or(StoreError::NotFound("config"))?;

        let mut updated = current.clone();
        mutate(&mut updated)?;
        updated.updated_at = Utc::now();
        inner.configs.insert(id, updated.clone());
        Ok(updated)
    }

    async fn delete_config(&self, id: i64) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .configs
            .remove(&id)
            .ok_or(StoreError::NotFound("config"))?;
        inner.assignments.retain(|_, a| a.config_id != id);
        Ok(())
    }

    async fn upsert_assignment(
        &self,
        assignment: ConfigAssignment,
    ) -> StoreResult<ConfigAssignment> {
        let mut inner = self.inner.write().await;
        inner
            .assignments
            .insert(assignment.mac.clone(), assignment.clone());
        Ok(assignment)
    }

    async fn assignment_for(&self, mac: &MacAddr) -> StoreResult<Option<ConfigAssignment>> {
        let inner = self.inner.read().await;
        Ok(inner.assignments.get(mac).cloned())
    }

    async fn update_assignment(
        &self,
        mac: &MacAddr,
        mutate: Mutation<ConfigAssignment>,
    ) -> StoreResult<ConfigAssignment> {
        let mut inner = self.inner.write().await;
        let current = inner
            .assignments
            .get(mac)
            .ok_or(StoreError::NotFound("config assignment"))?;

        let mut updated = current.clone();
        mutate(&mut updated)?;
        inner.assignments.insert(mac.clone(), updated.clone());
        Ok(updated)
    }

    async fn insert_command(&self, new: NewCommand) -> StoreResult<DeviceCommand> {
        let mut inner = self.inner.write().await;
        let command = DeviceCommand {
            id: inner.next_id(),
            mac: new.mac,
            command: new.command,
            payload: new.payload,
            status: CommandStatus::Pending,
            expires_at: new.expires_at,
            sent_at: None,
            acknowledged_at: None,
            response: None,
            created_at: Utc::now(),
        };
        inner.commands.insert(command.id, command.clone());
        Ok(command)
    }

    async fn command_by_id(&self, id: i64) -> StoreResult<Option<DeviceCommand>> {
        let inner = self.inner.read().await;
        Ok(inner.commands.get(&id).cloned())
    }

    async fn pending_commands(&self, mac: &MacAddr) -> StoreResult<Vec<DeviceCommand>> {
        let inner = self.inner.read().await;
        let mut commands: Vec<_> = inner
            .commands
            .values()
            .filter(|c| c.mac == *mac && c.status == CommandStatus::Pending)
            .cloned()
            .collect();
        commands.sort_by_key(|c| c.id);
        Ok(commands)
    }

    async fn update_command(
        &self,
        id: i64,
        mutate: Mutation<DeviceCommand>,
    ) -> StoreResult<DeviceCommand> {
        let mut inner = self.inner.write().await;
        let current = inner
            .commands
            .get(&id)
            .ok_or(StoreError::NotFound("command"))?;

        let mut updated = current.clone();
        mutate(&mut updated)?;
        inner.commands.insert(id, updated.clone());
        Ok(updated)
    }

    async fn expire_commands(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let mut expired = 0;
        for command in inner.commands.values_mut() {
            if command.status == CommandStatus::Pending && command.expires_at < now {
                command.status = CommandStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::LogAction;
    use common::LogStatus;

    fn mac(s: &str) -> MacAddr {
        MacAddr::parse(s).unwrap()
    }

    fn new_device(m: &str) -> NewDevice {
        NewDevice {
            mac: mac(m),
            name: "bench-1".into(),
            group: "lab".into(),
            location: None,
        }
    }

    #[tokio::test]
    async fn test_lookup_is_canonical_across_representations() {
        let repo = MemoryRepository::new();
        repo.insert_device(new_device("aa:bb:cc:dd:ee:ff")).await.unwrap();

        for raw in ["AA-BB-CC-DD-EE-FF", "aabbccddeeff", "AABBCCDDEEFF"] {
            let found = repo.device_by_mac(&mac(raw)).await.unwrap();
            assert!(found.is_some(), "lookup via {raw:?}");
        }
    }

    #[tokio::test]
    async fn test_duplicate_mac_rejected() {
        let repo = MemoryRepository::new();
        repo.insert_device(new_device("AABBCCDDEEFF")).await.unwrap();
        let err = repo.insert_device(new_device("aa:bb:cc:dd:ee:ff")).await;
        assert!(matches!(err, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_failed_mutation_commits_nothing() {
        let repo = MemoryRepository::new();
        repo.insert_device(new_device("AABBCCDDEEFF")).await.unwrap();

        let result = repo
            .update_device(
                &mac("AABBCCDDEEFF"),
                Box::new(|d| {
                    d.ota_status = OtaStatus::Updating;
                    d.target_version = "v9.9.9".into();
                    Err(StoreError::Invalid("mid-transaction failure".into()))
                }),
            )
            .await;
        assert!(result.is_err());

        let device = repo.device_by_mac(&mac("AABBCCDDEEFF")).await.unwrap().unwrap();
        assert_eq!(device.ota_status, OtaStatus::Idle);
        assert_eq!(device.target_version, "");
    }

    #[tokio::test]
    async fn test_last_seen_takes_the_max() {
        let repo = MemoryRepository::new();
        repo.insert_device(new_device("AABBCCDDEEFF")).await.unwrap();
        let m = mac("AABBCCDDEEFF");

        let later = Utc::now();
        let earlier = later - chrono::Duration::minutes(3);

        repo.update_device(
            &m,
            Box::new(move |d| {
                d.last_seen = Some(later);
                Ok(())
            }),
        )
        .await
        .unwrap();

        let device = repo
            .update_device(
                &m,
                Box::new(move |d| {
                    d.last_seen = Some(earlier);
                    Ok(())
                }),
            )
            .await
            .unwrap();

        assert_eq!(device.last_seen, Some(later));
    }

    #[tokio::test]
    async fn test_cleared_logs_are_hidden() {
        let repo = MemoryRepository::new();
        let m = mac("AABBCCDDEEFF");
        repo.append_log(NewDeviceLog {
            mac: m.clone(),
            action: LogAction::Check,
            status: LogStatus::Success,
            from_version: None,
            to_version: None,
            message: None,
        })
        .await
        .unwrap();

        assert_eq!(repo.logs_for(&m, 10).await.unwrap().len(), 1);
        repo.clear_logs(&m).await.unwrap();
        assert!(repo.logs_for(&m, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_config_delete_cascades_to_assignments() {
        let repo = MemoryRepository::new();
        let config = repo
            .insert_config(NewDeviceConfig {
                name: "prod".into(),
                config_data: serde_json::json!({"ota": {"checkIntervalMs": 3_600_000}}),
            })
            .await
            .unwrap();

        let m = mac("AABBCCDDEEFF");
        repo.upsert_assignment(ConfigAssignment {
            mac: m.clone(),
            config_id: config.id,
            config_version: config.version,
            status: common::AssignmentStatus::Pending,
            assigned_at: Utc::now(),
            applied_at: None,
        })
        .await
        .unwrap();

        repo.delete_config(config.id).await.unwrap();
        assert!(repo.assignment_for(&m).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expire_commands_sweep() {
        let repo = MemoryRepository::new();
        let m = mac("AABBCCDDEEFF");
        let now = Utc::now();

        repo.insert_command(NewCommand {
            mac: m.clone(),
            command: "reboot".into(),
            payload: None,
            expires_at: now - chrono::Duration::seconds(1),
        })
        .await
        .unwrap();
        repo.insert_command(NewCommand {
            mac: m.clone(),
            command: "ping".into(),
            payload: None,
            expires_at: now + chrono::Duration::minutes(5),
        })
        .await
        .unwrap();

        assert_eq!(repo.expire_commands(now).await.unwrap(), 1);
        let pending = repo.pending_commands(&m).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].command, "ping");
    }
}
