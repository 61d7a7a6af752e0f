// redis-backup-sidecar/src/store/mod.rs
pub(crate) mod leadership;

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::info;

use crate::config::AppConfig;
use crate::errors::{AppError, Result};

pub use leadership::is_leader;

/// Name the sidecar registers with `CLIENT SETNAME`, visible in `CLIENT LIST`.
pub const CLIENT_NAME: &str = "redis-backup-sidecar";

/// The slice of the store protocol a backup cycle needs.
#[async_trait]
pub trait SnapshotStore: Send {
    /// Raw `INFO replication` report.
    async fn replication_info(&mut self) -> Result<String>;

    /// Unix timestamp of the last successful save (`LASTSAVE`).
    async fn last_save(&mut self) -> Result<i64>;

    /// Starts a background save and returns the server's status reply.
    async fn trigger_bgsave(&mut self) -> Result<String>;

    /// The store's working directory (`CONFIG GET dir`).
    async fn working_dir(&mut self) -> Result<String>;
}

/// A single labelled connection to the store. Dropping it closes the socket.
pub struct StoreConnection {
    conn: MultiplexedConnection,
}

impl StoreConnection {
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let addr = config.store.addr.clone();
        let url = config.store.connection_url()?;
        let connect_err = |source| AppError::Connect {
            addr: addr.clone(),
            source,
        };

        let client = redis::Client::open(url.as_str()).map_err(connect_err)?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(connect_err)?;

        let _: () = redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(CLIENT_NAME)
            .query_async(&mut conn)
            .await
            .map_err(connect_err)?;

        info!(addr = %addr, client_name = CLIENT_NAME, "connected to store");
        Ok(StoreConnection { conn })
    }
}

#[async_trait]
impl SnapshotStore for StoreConnection {
    async fn replication_info(&mut self) -> Result<String> {
        let report: String = redis::cmd("INFO")
            .arg("replication")
            .query_async(&mut self.conn)
            .await?;
        Ok(report)
    }

    async fn last_save(&mut self) -> Result<i64> {
        let ts: i64 = redis::cmd("LASTSAVE").query_async(&mut self.conn).await?;
        Ok(ts)
    }

    async fn trigger_bgsave(&mut self) -> Result<String> {
        let reply: String = redis::cmd("BGSAVE").query_async(&mut self.conn).await?;
        Ok(reply)
    }

    async fn working_dir(&mut self) -> Result<String> {
        let mut values: HashMap<String, String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg("dir")
            .query_async(&mut self.conn)
            .await?;
        values
            .remove("dir")
            .ok_or_else(|| AppError::Store("CONFIG GET dir returned no value".into()))
    }
}
