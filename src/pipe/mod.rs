//! Pull-based command and config delivery. Devices poll for pending work;
//! nothing here holds a connection open. Expiry is handled on drain plus one
//! periodic sweep for devices that never poll.

use crate::hub::Hub;
use crate::store::{NewCommand, Repository, StoreError};
use chrono::{Duration, Utc};
use common::{
    AssignmentStatus, CommandStatus, ConfigAssignment, DeviceCommand, MacAddr, PendingCommand,
    PendingConfigResponse, ServerEvent,
};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Commands not picked up within this window expire.
pub const COMMAND_TTL_MINS: i64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("device not registered")]
    DeviceNotRegistered,
    #[error("config not found")]
    ConfigNotFound,
    #[error("command not found")]
    CommandNotFound,
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct CommandPipe {
    repo: Arc<dyn Repository>,
    hub: Arc<Hub>,
    sweep_secs: u64,
}

impl CommandPipe {
    pub fn new(repo: Arc<dyn Repository>, hub: Arc<Hub>, sweep_secs: u64) -> Self {
        CommandPipe {
            repo,
            hub,
            sweep_secs,
        }
    }

    // --- Commands ---

    pub async fn enqueue_command(
        &self,
        mac: &MacAddr,
        command: String,
        payload: Option<serde_json::Value>,
    ) -> Result<DeviceCommand, PipeError> {
        self.require_device(mac).await?;
        if command.trim().is_empty() {
            return Err(PipeError::Invalid("command must not be empty".into()));
        }

        let queued = self
            .repo
            .insert_command(NewCommand {
                mac: mac.clone(),
                command,
                payload,
                expires_at: Utc::now() + Duration::minutes(COMMAND_TTL_MINS),
            })
            .await?;
        info!("queued command {:?} for {mac}", queued.command);
        Ok(queued)
    }

    /// Returns every live pending command, marking each `sent`. Overdue ones
    /// are transitioned to `expired` and withheld.
    pub async fn drain_pending(&self, mac: &MacAddr) -> Result<Vec<PendingCommand>, PipeError> {
        self.require_device(mac).await?;
        let now = Utc::now();
        let mut delivered = Vec::new();

        for command in self.repo.pending_commands(mac).await? {
            if command.expires_at < now {
                self.repo
                    .update_command(
                        command.id,
                        Box::new(|c| {
                            c.status = CommandStatus::Expired;
                            Ok(())
                        }),
                    )
                    .await?;
                debug!("command {} for {mac} expired before pickup", command.id);
                continue;
            }

            let sent = self
                .repo
                .update_command(
                    command.id,
                    Box::new(move |c| {
                        c.status = CommandStatus::Sent;
                        c.sent_at = Some(now);
                        Ok(())
                    }),
                )
                .await?;
            delivered.push(PendingCommand {
                id: sent.id,
                command: sent.command,
                payload: sent.payload,
            });
        }
        Ok(delivered)
    }

    pub async fn acknowledge(
        &self,
        id: i64,
        status: &str,
        response: Option<String>,
    ) -> Result<DeviceCommand, PipeError> {
        let new_status = match status {
            "acknowledged" | "success" => CommandStatus::Acknowledged,
            "failed" => CommandStatus::Failed,
            other => {
                return Err(PipeError::Invalid(format!(
                    "unsupported ack status {other:?}"
                )))
            }
        };

        let response_clone = response.clone();
        let command = self
            .repo
            .update_command(
                id,
                Box::new(move |c| {
                    c.status = new_status;
                    c.acknowledged_at = Some(Utc::now());
                    c.response = response_clone;
                    Ok(())
                }),
            )
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => PipeError::CommandNotFound,
                other => PipeError::Store(other),
            })?;

        self.hub
            .broadcast_console(
                &command.mac,
                ServerEvent::CommandAck {
                    device_id: command.mac.clone(),
                    command_id: command.id,
                    status: status_label(new_status).into(),
                    response: command.response.clone(),
                },
            )
            .await;
        Ok(command)
    }

    /// Periodic expiry sweep; covers devices that never drain.
    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(self.sweep_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            match self.repo.expire_commands(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => debug!("expired {n} unclaimed command(s)"),
                Err(err) => error!("command expiry sweep failed: {err}"),
            }
        }
    }

    // --- Configs ---

    /// Upserts the per-MAC assignment at the config's current version.
    pub async fn assign_config(
        &self,
        mac: &MacAddr,
        config_id: i64,
    ) -> Result<ConfigAssignment, PipeError> {
        self.require_device(mac).await?;
        let config = self
            .repo
            .config_by_id(config_id)
            .await?
            .ok_or(PipeError::ConfigNotFound)?;

        let assignment = self
            .repo
            .upsert_assignment(ConfigAssignment {
                mac: mac.clone(),
                config_id: config.id,
                config_version: config.version,
                status: AssignmentStatus::Pending,
                assigned_at: Utc::now(),
                applied_at: None,
            })
            .await?;
        info!("assigned config {} v{} to {mac}", config.name, config.version);
        Ok(assignment)
    }

    /// Device poll: anything assigned and not yet applied comes back with the
    /// config body inlined.
    pub async fn pending_config(
        &self,
        mac: &MacAddr,
    ) -> Result<PendingConfigResponse, PipeError> {
        self.require_device(mac).await?;

        let Some(assignment) = self.repo.assignment_for(mac).await? else {
            return Ok(PendingConfigResponse::none());
        };
        if assignment.status == AssignmentStatus::Applied {
            return Ok(PendingConfigResponse::none());
        }
        let Some(config) = self.repo.config_by_id(assignment.config_id).await? else {
            return Ok(PendingConfigResponse::none());
        };

        Ok(PendingConfigResponse {
            has_config: true,
            config_id: Some(config.id),
            config_version: Some(assignment.config_version),
            config_data: Some(config.config_data),
        })
    }

    /// Device ack: the assignment flips to applied and the device row records
    /// the config version it is now running.
    pub async fn ack_config(&self, mac: &MacAddr, config_version: i64) -> Result<(), PipeError> {
        self.require_device(mac).await?;

        self.repo
            .update_assignment(
                mac,
                Box::new(|a| {
                    a.status = AssignmentStatus::Applied;
                    a.applied_at = Some(Utc::now());
                    Ok(())
                }),
            )
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => PipeError::ConfigNotFound,
                other => PipeError::Store(other),
            })?;

        self.repo
            .update_device(
                mac,
                Box::new(move |d| {
                    d.config_version = config_version;
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    async fn require_device(&self, mac: &MacAddr) -> Result<(), PipeError> {
        if self.repo.device_by_mac(mac).await?.is_none() {
            return Err(PipeError::DeviceNotRegistered);
        }
        Ok(())
    }
}

fn status_label(status: CommandStatus) -> &'static str {
    match status {
        CommandStatus::Pending => "pending",
        CommandStatus::Sent => "sent",
        CommandStatus::Acknowledged => "acknowledged",
        CommandStatus::Failed => "failed",
        CommandStatus::Expired => "expired",
    }
}
