use std::path::PathBuf;

use tracing::{info, warn};

use super::encrypt::encrypt_snapshot;
use super::s3_upload::ArchiveUploader;
use super::snapshot::{BackoffPolicy, wait_for_snapshot};
use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::store::SnapshotStore;

/// Result of one completed backup cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub snapshot_path: PathBuf,
    pub artifact_path: PathBuf,
    pub remote_location: String,
}

/// Snapshot, encrypt, upload, clean up. Any failure aborts the cycle and is
/// returned to the orchestrator; only artifact deletion failures are swallowed.
///
/// An artifact whose upload fails stays on disk.
pub async fn perform_backup_cycle<S, U>(
    store: &mut S,
    config: &AppConfig,
    uploader: &U,
) -> Result<BackupReport>
where
    S: SnapshotStore + ?Sized,
    U: ArchiveUploader + ?Sized,
{
    info!("🚀 running backup");

    let policy = BackoffPolicy::new(config.retry_base_wait);
    let mut cycle = wait_for_snapshot(store, &policy).await?;
    let snapshot_path = cycle
        .snapshot_path
        .clone()
        .ok_or_else(|| AppError::Store("snapshot path was not resolved".into()))?;

    let public_key = config.public_key.clone();
    let artifact_dir = config.artifact_dir.clone();
    let source = snapshot_path.clone();
    let artifact_path = tokio::task::spawn_blocking(move || {
        encrypt_snapshot(&public_key, &source, &artifact_dir)
    })
    .await
    .map_err(|e| AppError::Encryption(anyhow::anyhow!("encryption task failed: {}", e)))?
    .map_err(AppError::Encryption)?;
    cycle.artifact_path = Some(artifact_path.clone());

    let remote_location = uploader.upload(&artifact_path).await?;
    info!(location = %remote_location, "✅ successfully uploaded backup");

    if let Err(e) = tokio::fs::remove_file(&artifact_path).await {
        warn!(
            artifact = %artifact_path.display(),
            error = %e,
            "failed to delete encrypted backup file"
        );
    }

    Ok(BackupReport {
        snapshot_path,
        artifact_path: cycle.artifact_path.unwrap_or(artifact_path),
        remote_location,
    })
}
