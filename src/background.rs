//! 过期上传会话的后台清理任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::STALE_SESSION_SWEEP_INTERVAL_SECS;
use crate::engine::UploadEngine;

/// 启动会话清理任务；未配置过期时间时不启动。
pub fn spawn_background_tasks(engine: Arc<UploadEngine>) {
    let ttl = engine.config().stale_session_ttl;
    if ttl.is_zero() {
        return;
    }
    info!(ttl_secs = ttl.as_secs(), "stale upload reaper enabled");

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(STALE_SESSION_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match engine.reap_stale(ttl).await {
                Ok(report) if report.cancelled > 0 => {
                    info!(
                        cancelled = report.cancelled,
                        released = report.released,
                        "stale uploads reaped"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "stale upload sweep failed"),
            }
        }
    });
}
