//! Staged rollout controller: percentage-based expansion over a stable fleet
//! ordering, failure-threshold gating, pause/resume/cancel, and an optional
//! auto-expand tick. Cancel deletes the rollout record only; in-flight queue
//! tasks are never interrupted.

use crate::queue::UpdateQueue;
use crate::store::{NewRollout, Repository, StoreError};
use crate::webhooks::{WebhookDispatcher, WebhookEvent};
use chrono::{Duration, Utc};
use common::{
    CreateRolloutRequest, Device, FirmwareVersion, RolloutStatus, StagedRollout,
    DEFAULT_STAGE_PERCENTAGES,
};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

const DEFAULT_EXPAND_AFTER_MINS: i64 = 30;
const DEFAULT_FAILURE_THRESHOLD: u8 = 10;

#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    #[error("{0}")]
    Invalid(String),
    #[error("rollout not found")]
    NotFound,
    #[error("firmware {0} not found")]
    FirmwareMissing(FirmwareVersion),
    #[error("rollout is {0:?}")]
    WrongState(RolloutStatus),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct RolloutController {
    repo: Arc<dyn Repository>,
    queue: Arc<UpdateQueue>,
    webhooks: Arc<WebhookDispatcher>,
    tick_secs: u64,
}

impl RolloutController {
    pub fn new(
        repo: Arc<dyn Repository>,
        queue: Arc<UpdateQueue>,
        webhooks: Arc<WebhookDispatcher>,
        tick_secs: u64,
    ) -> Self {
        RolloutController {
            repo,
            queue,
            webhooks,
            tick_secs,
        }
    }

    /// Snapshots the fleet, queues stage one, and persists the rollout.
    /// Returns the record plus how many devices were actually admitted.
    pub async fn create(
        &self,
        req: CreateRolloutRequest,
    ) -> Result<(StagedRollout, usize), RolloutError> {
        let stages = req
            .stage_percentages
            .unwrap_or_else(|| DEFAULT_STAGE_PERCENTAGES.to_vec());
        validate_stages(&stages)?;

        if self
            .repo
            .firmware_by_version(&req.version)
            .await?
            .is_none()
        {
            return Err(RolloutError::FirmwareMissing(req.version));
        }

        let devices = self.repo.list_devices().await?;
        if devices.is_empty() {
            return Err(RolloutError::Invalid("no devices registered".into()));
        }

        let status = if stages.len() == 1 {
            RolloutStatus::Completing
        } else {
            RolloutStatus::Active
        };
        let rollout = self
            .repo
            .insert_rollout(NewRollout {
                version: req.version.clone(),
                stage_percentages: stages,
                total_devices: devices.len(),
                auto_expand: req.auto_expand,
                expand_after_minutes: req
                    .expand_after_minutes
                    .unwrap_or(DEFAULT_EXPAND_AFTER_MINS),
                failure_threshold: req.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD),
                status,
            })
            .await?;

        let cut = rollout.stage_cut(1);
        let queued = self.enqueue(&devices[..cut.min(devices.len())], &req.version).await;
        info!(
            "rollout {} created for {}: stage 1 covers {cut} of {} devices",
            rollout.id,
            req.version,
            devices.len()
        );
        Ok((rollout, queued))
    }

    /// Expands onto the next stage: the devices in `[prevCut, newCut)` of the
    /// stable ordering are queued.
    pub async fn advance(&self, id: i64) -> Result<(StagedRollout, usize), RolloutError> {
        let rollout = self.require(id).await?;
        if !matches!(
            rollout.status,
            RolloutStatus::Active | RolloutStatus::Completing
        ) {
            return Err(RolloutError::WrongState(rollout.status));
        }
        if rollout.is_last_stage(rollout.current_stage) {
            return Err(RolloutError::Invalid("rollout is on its final stage".into()));
        }

        let next = rollout.current_stage + 1;
        let prev_cut = rollout.stage_cut(rollout.current_stage);
        let new_cut = rollout.stage_cut(next);

        let devices = self.repo.list_devices().await?;
        let slice_end = new_cut.min(devices.len());
        let queued = if prev_cut < slice_end {
            self.enqueue(&devices[prev_cut..slice_end], &rollout.version)
                .await
        } else {
            0
        };

        let last = rollout.is_last_stage(next);
        let updated = self
            .repo
            .update_rollout(
                id,
                Box::new(move |r| {
                    r.current_stage = next;
                    r.last_expanded = Some(Utc::now());
                    if last {
                        r.status = RolloutStatus::Completing;
                    }
                    Ok(())
                }),
            )
            .await?;
        let updated = self.refresh_counts(updated).await?;

        info!(
            "rollout {id} advanced to stage {next} ({queued} newly queued, cut {new_cut})"
        );
        Ok((updated, queued))
    }

    pub async fn pause(&self, id: i64) -> Result<StagedRollout, RolloutError> {
        self.set_status(id, RolloutStatus::Active, RolloutStatus::Paused)
            .await
    }

    pub async fn resume(&self, id: i64) -> Result<StagedRollout, RolloutError> {
        self.set_status(id, RolloutStatus::Paused, RolloutStatus::Active)
            .await
    }

    /// Deletes the record. Queue tasks already admitted keep running.
    pub async fn cancel(&self, id: i64) -> Result<(), RolloutError> {
        self.require(id).await?;
        self.repo.delete_rollout(id).await?;
        info!("rollout {id} cancelled");
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<StagedRollout, RolloutError> {
        let rollout = self.require(id).await?;
        Ok(self.refresh_counts(rollout).await?)
    }

    pub async fn list(&self) -> Result<Vec<StagedRollout>, RolloutError> {
        let mut out = Vec::new();
        for rollout in self.repo.list_rollouts().await? {
            out.push(self.refresh_counts(rollout).await?);
        }
        Ok(out)
    }

    /// Background loop driving auto-expansion and completion detection.
    pub async fn run(self: Arc<Self>) {
        if self.tick_secs == 0 {
            return;
        }
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(self.tick_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if let Err(err) = self.tick().await {
                error!("rollout tick failed: {err}");
            }
        }
    }

    /// One controller pass: refresh counts, complete finished rollouts, and
    /// expand (or pause) auto-expand rollouts whose window has elapsed.
    pub async fn tick(&self) -> Result<(), RolloutError> {
        let now = Utc::now();
        for rollout in self.repo.list_rollouts().await? {
            let rollout = self.refresh_counts(rollout).await?;

            if rollout.status == RolloutStatus::Completing {
                let cut = rollout.stage_cut(rollout.current_stage);
                if rollout.updated_devices + rollout.failed_devices >= cut {
                    self.repo
                        .update_rollout(
                            rollout.id,
                            Box::new(|r| {
                                r.status = RolloutStatus::Completed;
                                Ok(())
                            }),
                        )
                        .await?;
                    self.webhooks.dispatch(
                        WebhookEvent::RolloutCompleted,
                        serde_json::json!({
                            "rolloutId": rollout.id,
                            "version": rollout.version,
                            "updatedDevices": rollout.updated_devices,
                            "failedDevices": rollout.failed_devices,
                        }),
                    );
                    info!("rollout {} completed", rollout.id);
                }
                continue;
            }

            if !(rollout.auto_expand && rollout.status == RolloutStatus::Active) {
                continue;
            }
            let due = rollout.last_expanded.map_or(true, |at| {
                now - at >= Duration::minutes(rollout.expand_after_minutes)
            });
            if !due || rollout.updated_devices == 0 {
                continue;
            }

            let failure_rate =
                rollout.failed_devices as f64 / rollout.updated_devices as f64;
            if failure_rate < rollout.failure_threshold as f64 / 100.0 {
                if let Err(err) = self.advance(rollout.id).await {
                    warn!("auto-expand of rollout {} failed: {err}", rollout.id);
                }
            } else {
                self.repo
                    .update_rollout(
                        rollout.id,
                        Box::new(|r| {
                            r.status = RolloutStatus::Paused;
                            Ok(())
                        }),
                    )
                    .await?;
                warn!(
                    "rollout {} paused: failure rate {:.1}% over threshold {}%",
                    rollout.id,
                    failure_rate * 100.0,
                    rollout.failure_threshold
                );
            }
        }
        Ok(())
    }

    async fn enqueue(&self, devices: &[Device], version: &FirmwareVersion) -> usize {
        let mut queued = 0;
        for device in devices {
            match self.queue.queue_update(device.mac.clone(), version.clone()).await {
                Ok(()) => queued += 1,
                Err(err) => {
                    warn!("rollout skipping {}: {err}", device.mac)
                }
            }
        }
        queued
    }

    /// Recomputes updated/failed over the devices the current stage targets
    /// and persists the counters.
    async fn refresh_counts(
        &self,
        rollout: StagedRollout,
    ) -> Result<StagedRollout, StoreError> {
        let devices = self.repo.list_devices().await?;
        let cut = rollout.stage_cut(rollout.current_stage).min(devices.len());
        let targeted = &devices[..cut];

        let version = rollout.version.as_str();
        let updated = targeted
            .iter()
            .filter(|d| d.current_version == version)
            .count();
        let failed = targeted
            .iter()
            .filter(|d| {
                d.ota_status == common::OtaStatus::Failed && d.target_version == version
            })
            .count();

        self.repo
            .update_rollout(
                rollout.id,
                Box::new(move |r| {
                    r.updated_devices = updated;
                    r.failed_devices = failed;
                    Ok(())
                }),
            )
            .await
    }

    async fn require(&self, id: i64) -> Result<StagedRollout, RolloutError> {
        self.repo
            .rollout_by_id(id)
            .await?
            .ok_or(RolloutError::NotFound)
    }

    async fn set_status(
        &self,
        id: i64,
        from: RolloutStatus,
        to: RolloutStatus,
    ) -> Result<StagedRollout, RolloutError> {
        let rollout = self.require(id).await?;
        if rollout.status != from {
            return Err(RolloutError::WrongState(rollout.status));
        }
        Ok(self
            .repo
            .update_rollout(
                id,
                Box::new(move |r| {
                    r.status = to;
                    Ok(())
                }),
            )
            .await?)
    }
}

fn validate_stages(stages: &[u8]) -> Result<(), RolloutError> {
    if stages.is_empty() {
        return Err(RolloutError::Invalid("at least one stage is required".into()));
    }
    if stages.iter().any(|&p| p == 0 || p > 100) {
        return Err(RolloutError::Invalid(
            "stage percentages must be within 1..=100".into(),
        ));
    }
    if stages.windows(2).any(|w| w[0] > w[1]) {
        return Err(RolloutError::Invalid(
            "stage percentages must be non-decreasing".into(),
        ));
    }
    if *stages.last().expect("non-empty") != 100 {
        return Err(RolloutError::Invalid("the final stage must be 100".into()));
    }
    Ok(())
}
