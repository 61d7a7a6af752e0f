use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to connect to store at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: redis::RedisError,
    },

    /// The store connection was reset or hit EOF. The only error class the
    /// orchestrator recovers from.
    #[error("Store connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Store command failed: {0}")]
    Store(String),

    #[error("BGSAVE not done after {attempts} polls, try increasing RETRY_WAIT_TIME_IN_SECONDS")]
    SnapshotTimedOut { attempts: u32 },

    #[error("Encryption failed: {0:#}")]
    Encryption(anyhow::Error),

    #[error("Upload failed: {0:#}")]
    Upload(anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, AppError::ConnectionClosed(_))
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() {
            AppError::ConnectionClosed(err.to_string())
        } else {
            AppError::Store(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
