// redis-backup-sidecar/src/orchestrator/mod.rs
use std::convert::Infallible;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::backup::{ArchiveUploader, perform_backup_cycle};
use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::store::{SnapshotStore, StoreConnection, is_leader};

/// Opens store connections for the orchestrator.
#[async_trait]
pub trait Connector: Send + Sync {
    type Store: SnapshotStore;

    async fn connect(&self, config: &AppConfig) -> Result<Self::Store>;
}

/// Connects to the live store.
pub struct RedisConnector;

#[async_trait]
impl Connector for RedisConnector {
    type Store = StoreConnection;

    async fn connect(&self, config: &AppConfig) -> Result<StoreConnection> {
        StoreConnection::connect(config).await
    }
}

/// The process-wide control loop. Backs up on every interval while this node
/// is the primary.
pub struct Orchestrator<'a, C, U> {
    config: &'a AppConfig,
    connector: C,
    uploader: U,
}

impl<'a, C, U> Orchestrator<'a, C, U>
where
    C: Connector,
    U: ArchiveUploader,
{
    pub fn new(config: &'a AppConfig, connector: C, uploader: U) -> Self {
        Orchestrator {
            config,
            connector,
            uploader,
        }
    }

    /// Runs until an unrecoverable error occurs and returns it.
    ///
    /// A dropped store connection gets one fresh connection per process
    /// lifetime. A second drop, or any other error, ends the run so the
    /// supervisor can restart the process.
    pub async fn run(&self) -> AppError {
        let mut reconnected = false;
        loop {
            let err = match self.run_loop().await {
                Ok(never) => match never {},
                Err(err) => err,
            };

            if err.is_connection_closed() && !reconnected {
                warn!(error = %err, "connection closed, reconnecting...");
                reconnected = true;
                continue;
            }

            error!(error = %err, "backup loop stopped");
            return err;
        }
    }

    async fn run_loop(&self) -> Result<Infallible> {
        let mut store = self.connector.connect(self.config).await?;

        loop {
            if is_leader(&mut store).await? {
                let report = perform_backup_cycle(&mut store, self.config, &self.uploader).await?;
                info!(
                    snapshot = %report.snapshot_path.display(),
                    artifact = %report.artifact_path.display(),
                    location = %report.remote_location,
                    next_in = %self.config.interval_label,
                    "backup done, waiting for next"
                );
            } else {
                info!("not a master node, skipping operation");
            }
            tokio::time::sleep(self.config.interval).await;
        }
    }
}
