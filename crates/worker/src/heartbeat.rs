use std::sync::Arc;

use chrono::{DateTime, Utc};
use taskq_domain::repositories::HeartbeatRepository;
use taskq_errors::QueueResult;
use tracing::{debug, info, warn};

/// Worker 心跳上报
///
/// 在本地累计处理计数，`beat` 时一次性写入增量。写入失败时增量保留到下一次。
pub struct HeartbeatReporter {
    heartbeat_repo: Arc<dyn HeartbeatRepository>,
    worker_id: String,
    hostname: String,
    pending_processed: i64,
    pending_failed: i64,
}

impl HeartbeatReporter {
    pub fn new(
        heartbeat_repo: Arc<dyn HeartbeatRepository>,
        worker_id: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            heartbeat_repo,
            worker_id: worker_id.into(),
            hostname: hostname.into(),
            pending_processed: 0,
            pending_failed: 0,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn record_processed(&mut self) {
        self.pending_processed += 1;
    }

    pub fn record_failed(&mut self) {
        self.pending_failed += 1;
    }

    /// 尚未写入的 (processed, failed) 增量
    pub fn pending(&self) -> (i64, i64) {
        (self.pending_processed, self.pending_failed)
    }

    pub async fn beat(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        self.heartbeat_repo
            .beat(
                &self.worker_id,
                &self.hostname,
                self.pending_processed,
                self.pending_failed,
                now,
            )
            .await?;

        debug!(
            worker_id = %self.worker_id,
            processed = self.pending_processed,
            failed = self.pending_failed,
            "心跳已写入"
        );
        self.pending_processed = 0;
        self.pending_failed = 0;
        Ok(())
    }

    /// 写入最后一次心跳并标记为已停止，尽力而为
    pub async fn stop(&mut self, now: DateTime<Utc>) {
        if let Err(e) = self.beat(now).await {
            warn!(worker_id = %self.worker_id, "最终心跳写入失败: {}", e);
        }
        match self.heartbeat_repo.mark_stopped(&self.worker_id, now).await {
            Ok(()) => info!(worker_id = %self.worker_id, "Worker 已标记为停止"),
            Err(e) => warn!(worker_id = %self.worker_id, "标记Worker停止失败: {}", e),
        }
    }
}
