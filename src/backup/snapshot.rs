// redis-backup-sidecar/src/backup/snapshot.rs
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::errors::{AppError, Result};
use crate::store::SnapshotStore;

/// File the store writes its RDB snapshot to, inside its working directory.
pub const SNAPSHOT_FILE_NAME: &str = "dump.rdb";

pub const MAX_POLL_ATTEMPTS: u32 = 5;

/// Exponential backoff used while waiting for a background save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base: Duration) -> Self {
        BackoffPolicy {
            base,
            max_attempts: MAX_POLL_ATTEMPTS,
        }
    }

    /// Sleep taken after the given (1-based) poll attempt saw no change.
    pub fn wait_after(&self, attempt: u32) -> Duration {
        self.scaled(attempt).unwrap_or(Duration::MAX)
    }

    /// The longest sleep a cycle can take, after the second to last attempt.
    /// `None` when it does not fit in a `Duration`.
    pub fn longest_wait(&self) -> Option<Duration> {
        self.scaled(self.max_attempts.saturating_sub(1))
    }

    fn scaled(&self, attempt: u32) -> Option<Duration> {
        let factor = 2u32.checked_pow(attempt.saturating_sub(1))?;
        self.base.checked_mul(factor)
    }
}

/// State of one backup iteration. Built at the start of a cycle and dropped
/// at its end.
#[derive(Debug)]
pub struct BackupCycle {
    pub prior_save: i64,
    pub attempt: u32,
    pub wait: Duration,
    pub snapshot_path: Option<PathBuf>,
    pub artifact_path: Option<PathBuf>,
}

impl BackupCycle {
    pub fn new(prior_save: i64, policy: &BackoffPolicy) -> Self {
        BackupCycle {
            prior_save,
            attempt: 0,
            wait: policy.base,
            snapshot_path: None,
            artifact_path: None,
        }
    }
}

/// Triggers `BGSAVE` and polls `LASTSAVE` until it moves past the value seen
/// before the trigger. Returns the raw snapshot path.
pub async fn wait_for_snapshot<S>(store: &mut S, policy: &BackoffPolicy) -> Result<BackupCycle>
where
    S: SnapshotStore + ?Sized,
{
    let prior_save = store.last_save().await?;
    let mut cycle = BackupCycle::new(prior_save, policy);

    let reply = store.trigger_bgsave().await?;
    info!(reply = %reply, last_save = prior_save, "BGSAVE triggered");

    loop {
        cycle.attempt += 1;
        let current = store.last_save().await?;
        if current != cycle.prior_save {
            info!(attempt = cycle.attempt, last_save = current, "✓ background save completed");
            break;
        }

        // Exhausting the budget is fatal: something is off with the store and
        // an operator should look before the next attempt.
        if cycle.attempt >= policy.max_attempts {
            return Err(AppError::SnapshotTimedOut {
                attempts: cycle.attempt,
            });
        }

        cycle.wait = policy.wait_after(cycle.attempt);
        debug!(attempt = cycle.attempt, wait = ?cycle.wait, "save still running, backing off");
        tokio::time::sleep(cycle.wait).await;
    }

    let dir = store.working_dir().await?;
    let snapshot_path = Path::new(&dir).join(SNAPSHOT_FILE_NAME);
    info!(path = %snapshot_path.display(), "snapshot file resolved");
    cycle.snapshot_path = Some(snapshot_path);
    Ok(cycle)
}
