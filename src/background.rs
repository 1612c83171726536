//! 暂存目录清理与限流记录清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::AccessGate;
use crate::config::{RATE_LIMIT_PRUNE_INTERVAL_SECS, STAGING_CLEAN_INTERVAL_SECS};
use crate::storage::Storage;

/// 启动后台任务；`staging_ttl` 为零时不清理暂存文件。
pub fn spawn_background_tasks(storage: Arc<Storage>, gate: Arc<AccessGate>, staging_ttl: Duration) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(RATE_LIMIT_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            gate.upload_limiter().prune().await;
        }
    });

    if staging_ttl.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(STAGING_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match storage.prune_staging(staging_ttl).await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "pruned staged uploads"),
                Err(err) => warn!(error = ?err, "staging cleanup failed"),
            }
        }
    });
}
