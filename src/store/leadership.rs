// redis-backup-sidecar/src/store/leadership.rs
use super::SnapshotStore;
use crate::errors::Result;

const PRIMARY_ROLE_MARKER: &str = "role:master";

/// Asks the store whether it is the writable primary.
///
/// Role is read fresh on every call since a failover can flip it between
/// cycles. Only one replica reports itself as primary at a time, so only one
/// sidecar backs up. A failed query is an error, not a "no".
pub async fn is_leader<S>(store: &mut S) -> Result<bool>
where
    S: SnapshotStore + ?Sized,
{
    let report = store.replication_info().await?;
    Ok(report_marks_primary(&report))
}

fn report_marks_primary(report: &str) -> bool {
    report.lines().any(|line| line.contains(PRIMARY_ROLE_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use async_trait::async_trait;

    /// Answers INFO with a fixed report, or fails like a dropped connection.
    struct InfoOnly(Option<String>);

    #[async_trait]
    impl SnapshotStore for InfoOnly {
        async fn replication_info(&mut self) -> Result<String> {
            self.0
                .clone()
                .ok_or_else(|| AppError::ConnectionClosed("EOF".into()))
        }
        async fn last_save(&mut self) -> Result<i64> {
            unreachable!()
        }
        async fn trigger_bgsave(&mut self) -> Result<String> {
            unreachable!()
        }
        async fn working_dir(&mut self) -> Result<String> {
            unreachable!()
        }
    }

    const PRIMARY_REPORT: &str = "# Replication\r\nrole:master\r\nconnected_slaves:2\r\n\
        slave0:ip=10.0.0.2,port=6379,state=online,offset=1234,lag=0\r\n";
    const REPLICA_REPORT: &str = "# Replication\r\nrole:slave\r\nmaster_host:10.0.0.1\r\n\
        master_port:6379\r\nmaster_link_status:up\r\n";

    #[test]
    fn test_primary_marker_detected() {
        assert!(report_marks_primary(PRIMARY_REPORT));
    }

    #[test]
    fn test_replica_report_is_not_primary() {
        assert!(!report_marks_primary(REPLICA_REPORT));
        assert!(!report_marks_primary(""));
    }

    #[tokio::test]
    async fn test_is_leader_reads_live_report() -> anyhow::Result<()> {
        assert!(is_leader(&mut InfoOnly(Some(PRIMARY_REPORT.into()))).await?);
        assert!(!is_leader(&mut InfoOnly(Some(REPLICA_REPORT.into()))).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_query_failure_is_an_error_not_false() {
        let mut store = InfoOnly(None);
        let err = is_leader(&mut store).await.unwrap_err();
        assert!(err.is_connection_closed());
    }
}
