//! Rollback-protection watchdog: a single periodic scan that flags devices
//! stuck mid-update as at-risk and clears the flag once they recover. Also
//! hosts the operator-driven recovery operations (`clear_at_risk`,
//! `force_rollback`).

use crate::hub::Hub;
use crate::store::{NewDeviceLog, Repository, StoreError};
use crate::webhooks::{WebhookDispatcher, WebhookEvent};
use chrono::{Duration, Utc};
use common::{
    ConnStatus, Device, LogAction, LogStatus, MacAddr, OtaStatus, ServerEvent,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Hard ceiling on time spent in `updating` before a device is flagged even
/// without an expected-checkin deadline.
pub const STUCK_UPDATE_MINS: i64 = 15;

pub struct Watchdog {
    repo: Arc<dyn Repository>,
    hub: Arc<Hub>,
    webhooks: Arc<WebhookDispatcher>,
    interval_secs: u64,
}

impl Watchdog {
    pub fn new(
        repo: Arc<dyn Repository>,
        hub: Arc<Hub>,
        webhooks: Arc<WebhookDispatcher>,
        interval_secs: u64,
    ) -> Self {
        Watchdog {
            repo,
            hub,
            webhooks,
            interval_secs,
        }
    }

    /// Cooperative loop; spawn once at startup.
    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(self.interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if let Err(err) = self.scan().await {
                error!("watchdog scan failed: {err}");
            }
        }
    }

    /// One pass over the fleet. Public so operator actions and tests can
    /// force an immediate evaluation.
    pub async fn scan(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        let devices = self.repo.list_devices().await?;
        let mut flagged: Vec<Device> = Vec::new();
        let mut recovered = 0usize;

        for device in devices {
            let overdue = device.ota_status == OtaStatus::Updating
                && device
                    .expected_checkin_by
                    .map_or(false, |deadline| deadline < now);
            let stuck = device.ota_status == OtaStatus::Updating
                && device
                    .update_started_at
                    .map_or(false, |started| now - started > Duration::minutes(STUCK_UPDATE_MINS));

            if (overdue || stuck) && !device.is_at_risk {
                let updated = self
                    .repo
                    .update_device(
                        &device.mac,
                        Box::new(|d| {
                            d.is_at_risk = true;
                            Ok(())
                        }),
                    )
                    .await?;
                warn!(
                    "device {} missed its update check-in (target {})",
                    device.mac, device.target_version
                );
                if overdue {
                    self.webhooks.dispatch(
                        WebhookEvent::DeviceAtRisk,
                        serde_json::json!({
                            "mac": device.mac,
                            "targetVersion": device.target_version,
                            "expectedCheckinBy": device.expected_checkin_by,
                        }),
                    );
                }
                flagged.push(updated);
            } else if device.is_at_risk
                && device.ota_status != OtaStatus::Updating
                && device.online_status(now) == ConnStatus::Online
            {
                self.repo
                    .update_device(
                        &device.mac,
                        Box::new(|d| {
                            d.is_at_risk = false;
                            d.update_started_at = None;
                            d.expected_checkin_by = None;
                            Ok(())
                        }),
                    )
                    .await?;
                info!("device {} recovered, clearing at-risk flag", device.mac);
                recovered += 1;
            }
        }

        if !flagged.is_empty() {
            let devices: Vec<Device> = self
                .repo
                .list_devices()
                .await?
                .into_iter()
                .map(|d| d.with_derived_status(now))
                .collect();
            self.hub
                .broadcast(ServerEvent::DevicesList { devices })
                .await;
            for device in flagged {
                self.hub
                    .broadcast(ServerEvent::AtRiskAlert {
                        device: device.with_derived_status(now),
                    })
                    .await;
            }
        }
        if recovered > 0 {
            info!("watchdog cleared {recovered} recovered device(s)");
        }
        Ok(())
    }

    /// Operator override: drop the at-risk flag without waiting for a tick.
    pub async fn clear_at_risk(&self, mac: &MacAddr) -> Result<Device, StoreError> {
        let device = self
            .repo
            .update_device(
                mac,
                Box::new(|d| {
                    d.is_at_risk = false;
                    d.update_started_at = None;
                    d.expected_checkin_by = None;
                    Ok(())
                }),
            )
            .await?;
        self.hub
            .broadcast(ServerEvent::DeviceUpdate {
                device: device.clone().with_derived_status(Utc::now()),
            })
            .await;
        Ok(device)
    }

    /// Queues the device back onto its previous version. Requires a real
    /// previous version distinct from the current one.
    pub async fn force_rollback(&self, mac: &MacAddr) -> Result<Device, StoreError> {
        let device = self
            .repo
            .update_device(
                mac,
                Box::new(|d| {
                    if d.previous_version.is_empty()
                        || d.previous_version == d.current_version
                    {
                        return Err(StoreError::Conflict(
                            "no previous version to roll back to".into(),
                        ));
                    }
                    d.target_version = d.previous_version.clone();
                    d.ota_status = OtaStatus::Pending;
                    d.is_at_risk = false;
                    d.update_started_at = None;
                    d.expected_checkin_by = None;
                    Ok(())
                }),
            )
            .await?;

        let logged = self
            .repo
            .append_log(NewDeviceLog {
                mac: mac.clone(),
                action: LogAction::Rollback,
                status: LogStatus::Pending,
                from_version: Some(device.current_version.clone()),
                to_version: Some(device.target_version.clone()),
                message: None,
            })
            .await;
        if let Err(err) = logged {
            warn!("rollback log append for {mac} failed: {err}");
        }

        self.hub
            .broadcast(ServerEvent::DeviceUpdate {
                device: device.clone().with_derived_status(Utc::now()),
            })
            .await;
        info!("forced rollback of {mac} to {}", device.target_version);
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryRepository, NewDevice};

    fn mac(s: &str) -> MacAddr {
        MacAddr::parse(s).unwrap()
    }

    async fn setup() -> (Arc<MemoryRepository>, Watchdog) {
        let repo = Arc::new(MemoryRepository::new());
        let hub = Arc::new(Hub::new(8));
        let webhooks = Arc::new(WebhookDispatcher::new(repo.clone()));
        let watchdog = Watchdog::new(repo.clone(), hub, webhooks, 60);
        repo.insert_device(NewDevice {
            mac: mac("AABBCCDDEEFF"),
            name: "n1".into(),
            group: "APS".into(),
            location: None,
        })
        .await
        .unwrap();
        (repo, watchdog)
    }

    async fn make_updating(repo: &MemoryRepository, m: &MacAddr, overdue_mins: i64) {
        repo.update_device(
            m,
            Box::new(move |d| {
                d.current_version = "v1.0.0".into();
                d.target_version = "v2.0.0".into();
                d.ota_status = OtaStatus::Updating;
                d.update_started_at = Some(Utc::now() - Duration::minutes(overdue_mins + 10));
                d.expected_checkin_by = Some(Utc::now() - Duration::minutes(overdue_mins));
                Ok(())
            }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_overdue_device_is_flagged_within_one_scan() {
        let (repo, watchdog) = setup().await;
        let m = mac("AABBCCDDEEFF");
        make_updating(&repo, &m, 1).await;

        watchdog.scan().await.unwrap();
        let device = repo.device_by_mac(&m).await.unwrap().unwrap();
        assert!(device.is_at_risk);
    }

    #[tokio::test]
    async fn test_device_within_deadline_is_not_flagged() {
        let (repo, watchdog) = setup().await;
        let m = mac("AABBCCDDEEFF");
        repo.update_device(
            &m,
            Box::new(|d| {
                d.target_version = "v2.0.0".into();
                d.ota_status = OtaStatus::Updating;
                d.update_started_at = Some(Utc::now());
                d.expected_checkin_by = Some(Utc::now() + Duration::minutes(10));
                Ok(())
            }),
        )
        .await
        .unwrap();

        watchdog.scan().await.unwrap();
        let device = repo.device_by_mac(&m).await.unwrap().unwrap();
        assert!(!device.is_at_risk);
    }

    #[tokio::test]
    async fn test_stuck_device_without_deadline_is_flagged() {
        let (repo, watchdog) = setup().await;
        let m = mac("AABBCCDDEEFF");
        repo.update_device(
            &m,
            Box::new(|d| {
                d.target_version = "v2.0.0".into();
                d.ota_status = OtaStatus::Updating;
                d.update_started_at =
                    Some(Utc::now() - Duration::minutes(STUCK_UPDATE_MINS + 1));
                d.expected_checkin_by = None;
                Ok(())
            }),
        )
        .await
        .unwrap();

        watchdog.scan().await.unwrap();
        let device = repo.device_by_mac(&m).await.unwrap().unwrap();
        assert!(device.is_at_risk);
    }

    #[tokio::test]
    async fn test_recovered_device_is_cleared_on_next_scan() {
        let (repo, watchdog) = setup().await;
        let m = mac("AABBCCDDEEFF");
        make_updating(&repo, &m, 1).await;
        watchdog.scan().await.unwrap();

        // The device comes back and reports in.
        repo.update_device(
            &m,
            Box::new(|d| {
                d.ota_status = OtaStatus::Updated;
                d.current_version = "v2.0.0".into();
                d.last_seen = Some(Utc::now());
                Ok(())
            }),
        )
        .await
        .unwrap();

        watchdog.scan().await.unwrap();
        let device = repo.device_by_mac(&m).await.unwrap().unwrap();
        assert!(!device.is_at_risk);
        assert!(device.update_started_at.is_none());
        assert!(device.expected_checkin_by.is_none());
    }

    #[tokio::test]
    async fn test_offline_at_risk_device_stays_flagged() {
        let (repo, watchdog) = setup().await;
        let m = mac("AABBCCDDEEFF");
        make_updating(&repo, &m, 1).await;
        watchdog.scan().await.unwrap();

        repo.update_device(
            &m,
            Box::new(|d| {
                d.ota_status = OtaStatus::Failed;
                d.last_seen = Some(Utc::now() - Duration::minutes(30));
                Ok(())
            }),
        )
        .await
        .unwrap();

        watchdog.scan().await.unwrap();
        let device = repo.device_by_mac(&m).await.unwrap().unwrap();
        assert!(device.is_at_risk);
    }

    #[tokio::test]
    async fn test_force_rollback_requires_distinct_previous() {
        let (repo, watchdog) = setup().await;
        let m = mac("AABBCCDDEEFF");

        let err = watchdog.force_rollback(&m).await;
        assert!(matches!(err, Err(StoreError::Conflict(_))));

        repo.update_device(
            &m,
            Box::new(|d| {
                d.previous_version = "v1.0.0".into();
                d.current_version = "v2.0.0".into();
                Ok(())
            }),
        )
        .await
        .unwrap();

        let device = watchdog.force_rollback(&m).await.unwrap();
        assert_eq!(device.target_version, "v1.0.0");
        assert_eq!(device.ota_status, OtaStatus::Pending);
        assert!(!device.is_at_risk);
    }
}
