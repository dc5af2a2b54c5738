//! Tombstone collection.
//!
//! Tombstones are kept so deletions propagate to other devices. Once a
//! tombstone is older than the retention window and older than the sync
//! watermark (so it has been pushed), it is purged locally and the remote
//! store is asked to purge the same window.

use lectern_core::{EntityKind, Result};
use lectern_store::{LocalStore, RemoteSession, RemoteStore};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub cutoff_ms: i64,
    pub local_purged: usize,
    pub remote_purged: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct TombstoneCollector {
    retention: Duration,
}

impl TombstoneCollector {
    pub fn new(retention: Duration) -> Self {
        Self { retention }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Tombstones last touched before this instant are eligible.
    pub fn cutoff(&self, now_ms: i64, watermark_ms: i64) -> i64 {
        let retention_ms = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_sub(retention_ms).min(watermark_ms)
    }

    /// Purge eligible tombstones of every kind.
    ///
    /// Local failures are returned; remote failures are only logged since the
    /// remote copy is harmless and is retried on the next run.
    pub async fn collect(
        &self,
        local: &dyn LocalStore,
        remote: &dyn RemoteStore,
        session: &RemoteSession,
        now_ms: i64,
        watermark_ms: i64,
    ) -> Result<GcReport> {
        let cutoff_ms = self.cutoff(now_ms, watermark_ms);
        let mut report = GcReport {
            cutoff_ms,
            ..Default::default()
        };

        for kind in EntityKind::ALL {
            report.local_purged += local.purge_tombstones(kind, cutoff_ms).await?;

            match remote.purge_tombstones(session, kind, cutoff_ms).await {
                Ok(n) => report.remote_purged += n,
                Err(e) => warn!(kind = %kind, error = %e, "remote tombstone purge failed"),
            }
        }

        if report.local_purged + report.remote_purged > 0 {
            info!(
                cutoff_ms,
                local = report.local_purged,
                remote = report.remote_purged,
                "purged tombstones"
            );
        }
        Ok(report)
    }
}
