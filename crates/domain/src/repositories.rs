use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{
    CronTaskDefinition, NewCronTask, NewTask, Task, TaskFilter, TaskStatus, WorkerHeartbeat,
};
use crate::value_objects::RetryDecision;
use taskq_errors::QueueResult;

/// 任务存储，队列状态的唯一事实来源
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 入队，不校验处理器是否已注册
    async fn enqueue(&self, task: &NewTask) -> QueueResult<i64>;

    /// 原子认领下一个可执行任务（priority DESC, created_at ASC）
    async fn claim_next(&self, now: DateTime<Utc>) -> QueueResult<Option<Task>>;

    /// processing → completed
    async fn complete(&self, id: i64, now: DateTime<Utc>) -> QueueResult<()>;

    /// processing → pending(重试) 或 dead_letter
    async fn fail(&self, id: i64, error: &str, decision: &RetryDecision) -> QueueResult<()>;

    /// 运维重置，清空重试次数、错误和时间戳
    async fn reset_to_pending(&self, id: i64) -> QueueResult<Task>;

    async fn get(&self, id: i64) -> QueueResult<Option<Task>>;

    async fn list(&self, filter: &TaskFilter) -> QueueResult<Vec<Task>>;

    async fn count_by_status(&self) -> QueueResult<Vec<(TaskStatus, i64)>>;

    /// 删除 completed_at 早于 `before` 的已完成/死信任务
    async fn purge_finished(&self, before: DateTime<Utc>) -> QueueResult<u64>;
}

/// 周期任务定义存储
#[async_trait]
pub trait CronTaskRepository: Send + Sync {
    async fn create(&self, definition: &NewCronTask) -> QueueResult<CronTaskDefinition>;

    async fn get(&self, id: i64) -> QueueResult<Option<CronTaskDefinition>>;

    async fn get_by_name(&self, name: &str) -> QueueResult<Option<CronTaskDefinition>>;

    async fn list(&self) -> QueueResult<Vec<CronTaskDefinition>>;

    /// 激活且 next_run 为空或不晚于 `now` 的定义
    async fn due(&self, now: DateTime<Utc>) -> QueueResult<Vec<CronTaskDefinition>>;

    async fn set_active(&self, id: i64, is_active: bool) -> QueueResult<()>;

    /// 在同一事务中推进 last_run/next_run 并插入任务
    ///
    /// 仅当 next_run 仍等于 `expected_next_run` 时生效；否则说明其他 worker
    /// 已经触发过，返回 `None` 且不插入任务。
    async fn fire(
        &self,
        id: i64,
        expected_next_run: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
        next_run: DateTime<Utc>,
        task: &NewTask,
    ) -> QueueResult<Option<i64>>;
}

/// Worker 心跳存储
#[async_trait]
pub trait HeartbeatRepository: Send + Sync {
    /// 不存在则创建，否则刷新时间并累加计数
    async fn beat(
        &self,
        worker_id: &str,
        hostname: &str,
        processed_delta: i64,
        failed_delta: i64,
        now: DateTime<Utc>,
    ) -> QueueResult<()>;

    async fn mark_stopped(&self, worker_id: &str, now: DateTime<Utc>) -> QueueResult<()>;

    async fn get(&self, worker_id: &str) -> QueueResult<Option<WorkerHeartbeat>>;

    async fn list(&self) -> QueueResult<Vec<WorkerHeartbeat>>;
}
