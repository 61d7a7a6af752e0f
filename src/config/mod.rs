// redis-backup-sidecar/src/config/mod.rs
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::backup::snapshot::BackoffPolicy;
use crate::errors::{AppError, Result};

pub const DEFAULT_STORE_ADDR: &str = "localhost:6379";
pub const DEFAULT_RETRY_WAIT_SECS: u64 = 10;
pub const DEFAULT_ARTIFACT_DIR: &str = ".";

/// Object storage destination for encrypted snapshots.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    pub bucket_name: String,
    /// Key prefix, may be empty.
    pub folder_prefix: String,
    /// Override for S3-compatible services (MinIO, DigitalOcean Spaces).
    pub endpoint_url: Option<String>,
}

#[derive(Clone)]
pub struct StoreConfig {
    /// `host:port` of the store.
    pub addr: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("addr", &self.addr)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl StoreConfig {
    /// Builds the `redis://` connection URL with percent-encoded credentials.
    pub fn connection_url(&self) -> Result<Url> {
        let mut url = Url::parse(&format!("redis://{}", self.addr)).map_err(|e| {
            AppError::Config(format!("Invalid DATABASE_CONNECTIONSTRING {}: {}", self.addr, e))
        })?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(AppError::Config(format!(
                "DATABASE_CONNECTIONSTRING {} has no host",
                self.addr
            )));
        }
        if let Some(username) = &self.username {
            url.set_username(username)
                .map_err(|_| AppError::Config("DATABASE_USERNAME cannot be applied".into()))?;
        }
        if let Some(password) = &self.password {
            url.set_password(Some(password))
                .map_err(|_| AppError::Config("DATABASE_PASSWORD cannot be applied".into()))?;
        }
        Ok(url)
    }
}

/// Immutable process configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store: StoreConfig,
    /// Time to sleep between backup cycles.
    pub interval: Duration,
    /// The raw `BACKUP_FREQUENCY` value, kept for log messages.
    pub interval_label: String,
    /// age X25519 recipient the snapshot is encrypted to.
    pub public_key: String,
    pub s3: S3Config,
    /// First backoff wait while polling for BGSAVE completion.
    pub retry_base_wait: Duration,
    pub artifact_dir: PathBuf,
}

impl AppConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let optional = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &str| {
            optional(name).ok_or_else(|| AppError::Config(format!("{} must be set", name)))
        };

        let store = StoreConfig {
            addr: optional("DATABASE_CONNECTIONSTRING")
                .unwrap_or_else(|| DEFAULT_STORE_ADDR.to_string()),
            username: optional("DATABASE_USERNAME"),
            password: optional("DATABASE_PASSWORD"),
        };
        store.connection_url()?;

        let interval_label = required("BACKUP_FREQUENCY")?;
        let interval = parse_interval(&interval_label)?;

        let public_key = required("PUBLIC_KEY")?.trim().to_string();
        age::x25519::Recipient::from_str(&public_key).map_err(|e| {
            AppError::Config(format!("PUBLIC_KEY is not a valid age recipient: {}", e))
        })?;

        let s3 = S3Config {
            region: required("AWS_REGION")?,
            bucket_name: required("AWS_BUCKET")?,
            folder_prefix: optional("AWS_BUCKET_FOLDER").unwrap_or_default(),
            endpoint_url: optional("AWS_ENDPOINT_URL"),
        };

        let retry_base_wait = match optional("RETRY_WAIT_TIME_IN_SECONDS") {
            Some(raw) => parse_retry_wait(&raw)?,
            None => Duration::from_secs(DEFAULT_RETRY_WAIT_SECS),
        };

        let artifact_dir = optional("BACKUP_ARTIFACT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT_DIR));

        Ok(AppConfig {
            store,
            interval,
            interval_label,
            public_key,
            s3,
            retry_base_wait,
            artifact_dir,
        })
    }
}

fn parse_interval(raw: &str) -> Result<Duration> {
    let interval = humantime::parse_duration(raw.trim()).map_err(|e| {
        AppError::Config(format!("Failed to parse BACKUP_FREQUENCY {:?}: {}", raw, e))
    })?;
    if interval.is_zero() {
        return Err(AppError::Config("BACKUP_FREQUENCY must be positive".into()));
    }
    Ok(interval)
}

fn parse_retry_wait(raw: &str) -> Result<Duration> {
    let secs: i64 = raw.trim().parse().map_err(|e| {
        AppError::Config(format!("Failed to parse RETRY_WAIT_TIME_IN_SECONDS {:?}: {}", raw, e))
    })?;
    if secs <= 0 {
        return Err(AppError::Config(
            "RETRY_WAIT_TIME_IN_SECONDS must be positive".into(),
        ));
    }
    let base = Duration::from_secs(secs as u64);
    // Every backoff step has to stay representable.
    if BackoffPolicy::new(base).longest_wait().is_none() {
        return Err(AppError::Config(format!(
            "RETRY_WAIT_TIME_IN_SECONDS {} is too large to back off from",
            secs
        )));
    }
    Ok(base)
}
