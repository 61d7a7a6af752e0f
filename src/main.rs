//! Redis Backup Sidecar
//!
//! Periodically snapshots the local Redis primary, encrypts the snapshot with
//! age and ships it to S3. Replicas stay idle, so only one sidecar in a
//! replicated deployment uploads per interval.

// redis-backup-sidecar/src/main.rs
mod backup;
mod config;
mod errors;
mod orchestrator;
mod store;

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use backup::S3Uploader;
use config::AppConfig;
use orchestrator::{Orchestrator, RedisConnector};

/// Main entry point. Only returns on a fatal error; the supervisor is
/// expected to restart the process.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let app_config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "❌ failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(
        store = %app_config.store.addr,
        bucket = %app_config.s3.bucket_name,
        prefix = %app_config.s3.folder_prefix,
        interval = %app_config.interval_label,
        "starting redis backup sidecar"
    );

    let uploader = S3Uploader::new(&app_config.s3).await;
    uploader.check_bucket().await;

    let orchestrator = Orchestrator::new(&app_config, RedisConnector, uploader);
    let err = orchestrator.run().await;
    error!(error = %err, "❌ fatal error, exiting");
    ExitCode::FAILURE
}
