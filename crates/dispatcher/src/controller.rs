use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use taskq_domain::entities::{
    CronTaskDefinition, NewCronTask, NewTask, Task, TaskFilter, TaskStatus, WorkerHeartbeat,
};
use taskq_domain::repositories::{CronTaskRepository, HeartbeatRepository, TaskRepository};
use taskq_domain::value_objects::QueueDepth;
use taskq_errors::{QueueError, QueueResult};
use tracing::info;

use crate::cron_scheduler::CronScheduler;
use crate::cron_utils::CronExpression;

/// 运维操作入口，CLI 和管理界面共用
///
/// 只能把任务重置回 pending，不能直接把任务标记为完成。
pub struct OperatorService {
    task_repo: Arc<dyn TaskRepository>,
    cron_repo: Arc<dyn CronTaskRepository>,
    heartbeat_repo: Arc<dyn HeartbeatRepository>,
    cron_scheduler: CronScheduler,
    default_max_retries: i32,
}

impl OperatorService {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        cron_repo: Arc<dyn CronTaskRepository>,
        heartbeat_repo: Arc<dyn HeartbeatRepository>,
        cron_scheduler: CronScheduler,
        default_max_retries: i32,
    ) -> Self {
        Self {
            task_repo,
            cron_repo,
            heartbeat_repo,
            cron_scheduler,
            default_max_retries,
        }
    }

    pub async fn enqueue(
        &self,
        name: &str,
        payload: serde_json::Value,
        priority: i32,
        max_retries: Option<i32>,
    ) -> QueueResult<i64> {
        let task = NewTask::new(name, payload)
            .with_priority(priority)
            .with_max_retries(max_retries.unwrap_or(self.default_max_retries));
        // 存储层不校验，在运维入口拦截
        task.validate()?;
        let id = self.task_repo.enqueue(&task).await?;
        info!(task_id = id, task_name = name, priority, "任务已入队");
        Ok(id)
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> QueueResult<Vec<Task>> {
        if filter.limit <= 0 || filter.offset < 0 {
            return Err(QueueError::validation_error("分页参数无效"));
        }
        self.task_repo.list(filter).await
    }

    pub async fn show_task(&self, id: i64) -> QueueResult<Task> {
        self.task_repo
            .get(id)
            .await?
            .ok_or_else(|| QueueError::task_not_found(id))
    }

    /// 把死信任务重置为 pending，重复调用效果相同
    pub async fn retry_task(&self, id: i64) -> QueueResult<Task> {
        let task = self.task_repo.reset_to_pending(id).await?;
        info!(task_id = id, task_name = %task.name, "任务已重置为待执行");
        Ok(task)
    }

    pub async fn queue_depth(&self) -> QueueResult<QueueDepth> {
        let counts = self.task_repo.count_by_status().await?;
        Ok(QueueDepth::from_counts(&counts))
    }

    pub async fn dead_letters(&self, limit: i64) -> QueueResult<Vec<Task>> {
        self.list_tasks(
            &TaskFilter::default()
                .with_status(TaskStatus::DeadLetter)
                .page(limit, 0),
        )
        .await
    }

    /// 删除结束时间早于 `now - older_than_days` 的已完成和死信任务
    pub async fn purge_finished(&self, older_than_days: u32, now: DateTime<Utc>) -> QueueResult<u64> {
        let cutoff = now - Duration::days(i64::from(older_than_days));
        let purged = self.task_repo.purge_finished(cutoff).await?;
        info!("已清理 {} 条在 {} 之前结束的任务", purged, cutoff);
        Ok(purged)
    }

    pub async fn list_cron_tasks(&self) -> QueueResult<Vec<CronTaskDefinition>> {
        self.cron_repo.list().await
    }

    pub async fn add_cron_task(&self, definition: &NewCronTask) -> QueueResult<CronTaskDefinition> {
        if definition.name.trim().is_empty() || definition.handler.trim().is_empty() {
            return Err(QueueError::validation_error("周期任务名称和处理器不能为空"));
        }
        CronExpression::validate(&definition.schedule)?;

        let created = self.cron_repo.create(definition).await?;
        info!(
            cron_id = created.id,
            cron_name = %created.name,
            schedule = %created.schedule,
            "周期任务已创建"
        );
        Ok(created)
    }

    pub async fn set_cron_active(&self, id: i64, is_active: bool) -> QueueResult<CronTaskDefinition> {
        self.cron_repo.set_active(id, is_active).await?;
        info!(cron_id = id, is_active, "周期任务状态已更新");
        self.cron_repo
            .get(id)
            .await?
            .ok_or_else(|| QueueError::cron_task_not_found(id))
    }

    pub async fn fire_cron_task(&self, id: i64, now: DateTime<Utc>) -> QueueResult<i64> {
        self.cron_scheduler.force_fire(id, now).await
    }

    pub async fn list_workers(&self) -> QueueResult<Vec<WorkerHeartbeat>> {
        self.heartbeat_repo.list().await
    }
}
