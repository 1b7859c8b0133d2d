use anyhow::Error;
use std::sync::Arc;

pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod firmware;
pub mod hub;
pub mod ota;
pub mod pipe;
pub mod queue;
pub mod ratelimit;
pub mod rollout;
pub mod store;
pub mod watchdog;
pub mod webhooks;

pub mod prelude {
    pub use crate::audit::*;
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::firmware::*;
    pub use crate::hub::*;
    pub use crate::ota::*;
    pub use crate::pipe::*;
    pub use crate::queue::*;
    pub use crate::rollout::*;
    pub use crate::store::*;
    pub use crate::watchdog::*;
    pub use crate::webhooks::*;
}

use audit::AuditRecorder;
use config::Config;
use firmware::FirmwareStore;
use hub::Hub;
use ota::OtaService;
use pipe::CommandPipe;
use queue::UpdateQueue;
use ratelimit::DeviceRateLimits;
use rollout::RolloutController;
use store::{MemoryRepository, Repository};
use watchdog::Watchdog;
use webhooks::WebhookDispatcher;

/// Everything a request handler can reach. Cheap to clone; each field is an
/// `Arc` onto the single shared instance.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repo: Arc<dyn Repository>,
    pub firmware: Arc<FirmwareStore>,
    pub queue: Arc<UpdateQueue>,
    pub hub: Arc<Hub>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub audit: Arc<AuditRecorder>,
    pub pipe: Arc<CommandPipe>,
    pub rollouts: Arc<RolloutController>,
    pub ota: Arc<OtaService>,
    pub watchdog: Arc<Watchdog>,
    pub limits: Arc<DeviceRateLimits>,
}

/// Wires the subsystem graph onto an in-memory repository.
pub async fn build_state(config: Config) -> Result<AppState, Error> {
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    build_state_with(config, repo).await
}

/// Same wiring with a caller-supplied repository implementation.
pub async fn build_state_with(
    config: Config,
    repo: Arc<dyn Repository>,
) -> Result<AppState, Error> {
    let config = Arc::new(config);
    let hub = Arc::new(Hub::new(config.ws_queue_depth));
    let webhooks = Arc::new(WebhookDispatcher::new(repo.clone()));
    let audit = Arc::new(AuditRecorder::new(repo.clone()));
    let firmware = Arc::new(
        FirmwareStore::new(repo.clone(), config.firmware_dir.clone()).await?,
    );
    let queue = Arc::new(UpdateQueue::new(
        repo.clone(),
        hub.clone(),
        config.queue_concurrency,
    ));
    let ota = Arc::new(OtaService::new(repo.clone(), hub.clone(), webhooks.clone()));
    let watchdog = Arc::new(Watchdog::new(
        repo.clone(),
        hub.clone(),
        webhooks.clone(),
        config.watchdog_interval_secs,
    ));
    let pipe = Arc::new(CommandPipe::new(
        repo.clone(),
        hub.clone(),
        config.command_sweep_secs,
    ));
    let rollouts = Arc::new(RolloutController::new(
        repo.clone(),
        queue.clone(),
        webhooks.clone(),
        config.rollout_tick_secs,
    ));
    let limits = Arc::new(DeviceRateLimits::new(
        config.check_rate_per_minute,
        config.download_rate_per_minute,
    ));

    Ok(AppState {
        config,
        repo,
        firmware,
        queue,
        hub,
        webhooks,
        audit,
        pipe,
        rollouts,
        ota,
        watchdog,
        limits,
    })
}

/// Spawns the long-running subsystem loops: watchdog, rollout expander and
/// command expiry sweep.
pub fn spawn_background(state: &AppState) {
    tokio::spawn(state.watchdog.clone().run());
    tokio::spawn(state.rollouts.clone().run());
    tokio::spawn(state.pipe.clone().run());
}
