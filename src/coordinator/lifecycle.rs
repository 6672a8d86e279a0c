use log::{error, info};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

use super::{CycleOutcome, PollCoordinator};
use crate::config::{ConfigError, MeterConfig};
use crate::kamstrup::transport::{Connector, SerialConnector};

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigError),
    /// The first poll did not return a single register. The owner may try
    /// again later.
    #[error("Meter {0} is not ready, the first poll returned no data")]
    NotReady(String),
}

/// A running meter integration: the coordinator plus its scheduler task.
pub struct Integration<C: Connector> {
    coordinator: Arc<PollCoordinator<C>>,
    scheduler: JoinHandle<()>,
}

impl Integration<SerialConnector> {
    /// Builds the coordinator for a serial meter and sets it up. Configuration
    /// errors are raised before the port is touched.
    ///
    /// The initial refresh runs before the caller can subscribe, so hosts that
    /// want its events construct the coordinator with
    /// `PollCoordinator::from_config`, subscribe and then call `setup`.
    pub async fn from_config(config: &MeterConfig) -> Result<Self, SetupError> {
        let coordinator = Arc::new(PollCoordinator::from_config(config)?);
        Self::setup(coordinator).await
    }
}

impl<C: Connector> Integration<C> {
    /// Runs the initial refresh and starts the scheduler if it delivered data.
    ///
    /// Subscribe to the coordinator before calling this to receive the
    /// events of the initial refresh as well.
    pub async fn setup(coordinator: Arc<PollCoordinator<C>>) -> Result<Self, SetupError> {
        info!("[{}] Initial refresh", coordinator.name());

        match coordinator.refresh().await {
            CycleOutcome::Updated(snapshot) => {
                info!("[{}] Meter ready with {} registers", coordinator.name(), snapshot.len());
            }
            CycleOutcome::Failed | CycleOutcome::Cancelled => {
                error!("[{}] Initial refresh returned no data", coordinator.name());
                return Err(SetupError::NotReady(coordinator.name().to_string()));
            }
        }

        let scheduler = coordinator.spawn_scheduler();
        return Ok(Integration { coordinator, scheduler });
    }

    pub fn coordinator(&self) -> &Arc<PollCoordinator<C>> {
        &self.coordinator
    }

    /// Cancels the scheduler and waits for it. A register exchange that is on
    /// the wire finishes first.
    pub async fn unload(self) {
        info!("[{}] Unloading", self.coordinator.name());
        self.coordinator.cancel();
        if let Err(e) = self.scheduler.await {
            error!("[{}] Scheduler task failed: {}", self.coordinator.name(), e);
        }
    }
}
