//! Single-flight update admission. At most one update task runs per MAC, a
//! `(MAC, version)` pair is rejected for five minutes after a deploy, and
//! task bodies run under a bounded-concurrency semaphore with snapshot
//! rollback on failure.

use crate::hub::Hub;
use crate::store::{NewDeviceLog, Repository, StoreError};
use chrono::{DateTime, Duration, Utc};
use common::{
    Device, FirmwareVersion, LogAction, LogStatus, MacAddr, OtaStatus, QueueStatus, ServerEvent,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info};

/// Window in which re-deploying the same version to a MAC is refused.
const DUPLICATE_WINDOW_MINS: i64 = 5;
/// Deploy history older than this is pruned after each task.
const HISTORY_RETENTION_MINS: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Device is already updating")]
    AlreadyUpdating,
    #[error("Same version was recently deployed to this device")]
    DuplicateRecent,
    #[error("device not found")]
    DeviceNotFound,
    #[error("update transaction failed: {0}")]
    Internal(String),
}

struct RecentDeploy {
    version: FirmwareVersion,
    at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    active: HashSet<MacAddr>,
    history: HashMap<MacAddr, RecentDeploy>,
}

/// Clones share the active set, history and semaphore; handing one to a
/// spawned task is how accepted work leaves the request path.
#[derive(Clone)]
pub struct UpdateQueue {
    repo: Arc<dyn Repository>,
    hub: Arc<Hub>,
    permits: Arc<Semaphore>,
    concurrency: usize,
    state: Arc<Mutex<QueueState>>,
}

impl UpdateQueue {
    pub fn new(repo: Arc<dyn Repository>, hub: Arc<Hub>, concurrency: usize) -> Self {
        UpdateQueue {
            repo,
            hub,
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Admission check plus task spawn. Returns as soon as the task is
    /// accepted; the body runs in the background under the concurrency cap.
    pub async fn queue_update(
        &self,
        mac: MacAddr,
        version: FirmwareVersion,
    ) -> Result<(), QueueError> {
        if self
            .repo
            .device_by_mac(&mac)
            .await
            .map_err(|e| QueueError::Internal(e.to_string()))?
            .is_none()
        {
            return Err(QueueError::DeviceNotFound);
        }

        {
            let mut state = self.state.lock().await;
            if state.active.contains(&mac) {
                return Err(QueueError::AlreadyUpdating);
            }
            if let Some(recent) = state.history.get(&mac) {
                let fresh =
                    Utc::now() - recent.at < Duration::minutes(DUPLICATE_WINDOW_MINS);
                if fresh && recent.version == version {
                    return Err(QueueError::DuplicateRecent);
                }
            }
            state.active.insert(mac.clone());
        }

        let queue = self.clone();
        tokio::spawn(async move {
            queue.run(mac, version).await;
        });
        Ok(())
    }

    async fn run(self, mac: MacAddr, version: FirmwareVersion) {
        let _permit = self
            .permits
            .acquire()
            .await
            .expect("queue semaphore closed");

        if let Err(err) = self.execute(&mac, &version).await {
            error!("update task for {mac} failed: {err}");
        }

        let mut state = self.state.lock().await;
        state.active.remove(&mac);
        let cutoff = Utc::now() - Duration::minutes(HISTORY_RETENTION_MINS);
        state.history.retain(|_, r| r.at > cutoff);
    }

    /// The task body: snapshot, transition to pending, log, record history.
    /// Any failure restores the snapshot and marks the device failed.
    async fn execute(&self, mac: &MacAddr, version: &FirmwareVersion) -> Result<(), QueueError> {
        let prior = self
            .repo
            .device_by_mac(mac)
            .await
            .map_err(|e| QueueError::Internal(e.to_string()))?
            .ok_or(QueueError::DeviceNotFound)?;

        let result = self.transition(mac, version, &prior).await;
        match result {
            Ok(device) => {
                let mut state = self.state.lock().await;
                state.history.insert(
                    mac.clone(),
                    RecentDeploy {
                        version: version.clone(),
                        at: Utc::now(),
                    },
                );
                drop(state);

                self.hub
                    .broadcast(ServerEvent::DeviceUpdate {
                        device: device.with_derived_status(Utc::now()),
                    })
                    .await;
                info!("queued update of {mac} to {version}");
                Ok(())
            }
            Err(err) => {
                self.restore(mac, version, &prior, &err).await;
                Err(err)
            }
        }
    }

    async fn transition(
        &self,
        mac: &MacAddr,
        version: &FirmwareVersion,
        prior: &Device,
    ) -> Result<Device, QueueError> {
        let target = version.as_str().to_string();
        let device = self
            .repo
            .update_device(
                mac,
                Box::new(move |d| {
                    d.previous_version = d.current_version.clone();
                    d.target_version = target;
                    d.ota_status = OtaStatus::Pending;
                    Ok(())
                }),
            )
            .await
            .map_err(|e| QueueError::Internal(e.to_string()))?;

        self.repo
            .append_log(NewDeviceLog {
                mac: mac.clone(),
                action: LogAction::Deploy,
                status: LogStatus::Pending,
                from_version: Some(prior.current_version.clone()),
                to_version: Some(version.as_str().to_string()),
                message: None,
            })
            .await
            .map_err(|e| QueueError::Internal(e.to_string()))?;

        Ok(device)
    }

    /// Puts the version triple back exactly as snapshotted and flags the
    /// device failed so the operator sees the aborted deploy.
    async fn restore(
        &self,
        mac: &MacAddr,
        version: &FirmwareVersion,
        prior: &Device,
        err: &QueueError,
    ) {
        let snapshot = prior.clone();
        let restored = self
            .repo
            .update_device(
                mac,
                Box::new(move |d| {
                    d.previous_version = snapshot.previous_version;
                    d.current_version = snapshot.current_version;
                    d.target_version = snapshot.target_version;
                    d.ota_status = OtaStatus::Failed;
                    Ok(())
                }),
            )
            .await;
        if let Err(restore_err) = restored {
            error!("failed to restore {mac} after aborted deploy: {restore_err}");
        }

        let logged = self
            .repo
            .append_log(NewDeviceLog {
                mac: mac.clone(),
                action: LogAction::Deploy,
                status: LogStatus::Failed,
                from_version: Some(prior.current_version.clone()),
                to_version: Some(version.as_str().to_string()),
                message: Some(err.to_string()),
            })
            .await;
        if let Err(log_err) = logged {
            error!("failed to log aborted deploy for {mac}: {log_err}");
        }
    }

    pub async fn is_device_updating(&self, mac: &MacAddr) -> bool {
        self.state.lock().await.active.contains(mac)
    }

    pub async fn status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        let mut active_macs: Vec<_> = state.active.iter().cloned().collect();
        active_macs.sort();
        let running = self.concurrency - self.permits.available_permits();
        QueueStatus {
            queue_size: active_macs.len().saturating_sub(running),
            running,
            active_macs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryRepository, NewDevice};
    use std::time::Duration as StdDuration;

    fn mac(s: &str) -> MacAddr {
        MacAddr::parse(s).unwrap()
    }

    fn version(s: &str) -> FirmwareVersion {
        FirmwareVersion::parse(s).unwrap()
    }

    async fn setup() -> (Arc<MemoryRepository>, Arc<UpdateQueue>) {
        let repo = Arc::new(MemoryRepository::new());
        let hub = Arc::new(Hub::new(8));
        let queue = Arc::new(UpdateQueue::new(repo.clone(), hub, 5));
        repo.insert_device(NewDevice {
            mac: mac("AABBCCDDEEFF"),
            name: "n1".into(),
            group: "APS".into(),
            location: None,
        })
        .await
        .unwrap();
        (repo, queue)
    }

    async fn wait_for_idle(queue: &UpdateQueue, m: &MacAddr) {
        for _ in 0..100 {
            if !queue.is_device_updating(m).await {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        panic!("queue task did not finish");
    }

    #[tokio::test]
    async fn test_deploy_sets_pending_and_version_triple() {
        let (repo, queue) = setup().await;
        let m = mac("AABBCCDDEEFF");

        queue.queue_update(m.clone(), version("v1.1.0")).await.unwrap();
        wait_for_idle(&queue, &m).await;

        let device = repo.device_by_mac(&m).await.unwrap().unwrap();
        assert_eq!(device.ota_status, OtaStatus::Pending);
        assert_eq!(device.target_version, "v1.1.0");
        assert_eq!(device.previous_version, "");

        let logs = repo.logs_for(&m, 10).await.unwrap();
        assert_eq!(logs[0].action, LogAction::Deploy);
        assert_eq!(logs[0].status, LogStatus::Pending);
    }

    #[tokio::test]
    async fn test_unknown_device_is_rejected() {
        let (_, queue) = setup().await;
        let err = queue
            .queue_update(mac("112233445566"), version("v1.0.0"))
            .await;
        assert!(matches!(err, Err(QueueError::DeviceNotFound)));
    }

    #[tokio::test]
    async fn test_duplicate_version_within_window_is_rejected() {
        let (repo, queue) = setup().await;
        let m = mac("AABBCCDDEEFF");

        queue.queue_update(m.clone(), version("v2.0.0")).await.unwrap();
        wait_for_idle(&queue, &m).await;

        let before = repo.device_by_mac(&m).await.unwrap().unwrap();
        let err = queue.queue_update(m.clone(), version("v2.0.0")).await;
        assert!(matches!(err, Err(QueueError::DuplicateRecent)));
        assert_eq!(
            err.unwrap_err().to_string(),
            "Same version was recently deployed to this device"
        );

        // No state change from the rejected call.
        let after = repo.device_by_mac(&m).await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_different_version_is_admitted_within_window() {
        let (_, queue) = setup().await;
        let m = mac("AABBCCDDEEFF");

        queue.queue_update(m.clone(), version("v2.0.0")).await.unwrap();
        wait_for_idle(&queue, &m).await;
        queue.queue_update(m.clone(), version("v2.1.0")).await.unwrap();
        wait_for_idle(&queue, &m).await;
    }

    #[tokio::test]
    async fn test_active_mac_is_single_flight() {
        let repo = Arc::new(MemoryRepository::new());
        let hub = Arc::new(Hub::new(8));
        // Zero permits: admitted tasks stay parked, keeping the MAC active.
        let queue = Arc::new(UpdateQueue::new(repo.clone(), hub, 0));
        let m = mac("AABBCCDDEEFF");
        repo.insert_device(NewDevice {
            mac: m.clone(),
            name: "n1".into(),
            group: "APS".into(),
            location: None,
        })
        .await
        .unwrap();

        queue.queue_update(m.clone(), version("v2.0.0")).await.unwrap();
        let err = queue.queue_update(m.clone(), version("v2.0.0")).await;
        assert!(matches!(err, Err(QueueError::AlreadyUpdating)));

        let status = queue.status().await;
        assert_eq!(status.active_macs, vec![m]);
    }

    #[tokio::test]
    async fn test_log_failure_rolls_back_to_snapshot() {
        let (repo, queue) = setup().await;
        let m = mac("AABBCCDDEEFF");

        // Give the device a non-trivial prior triple.
        repo.update_device(
            &m,
            Box::new(|d| {
                d.current_version = "v1.0.0".into();
                d.previous_version = "v0.9.0".into();
                d.ota_status = OtaStatus::Updated;
                Ok(())
            }),
        )
        .await
        .unwrap();

        repo.fail_next_log();
        queue.queue_update(m.clone(), version("v1.1.0")).await.unwrap();
        wait_for_idle(&queue, &m).await;

        let device = repo.device_by_mac(&m).await.unwrap().unwrap();
        assert_eq!(device.current_version, "v1.0.0");
        assert_eq!(device.previous_version, "v0.9.0");
        assert_eq!(device.target_version, "");
        assert_eq!(device.ota_status, OtaStatus::Failed);

        // The aborted deploy left a failed log entry.
        let logs = repo.logs_for(&m, 10).await.unwrap();
        assert_eq!(logs[0].action, LogAction::Deploy);
        assert_eq!(logs[0].status, LogStatus::Failed);

        // And the failed attempt does not count as a recent deploy.
        queue.queue_update(m.clone(), version("v1.1.0")).await.unwrap();
        wait_for_idle(&queue, &m).await;
        let device = repo.device_by_mac(&m).await.unwrap().unwrap();
        assert_eq!(device.ota_status, OtaStatus::Pending);
    }
}
