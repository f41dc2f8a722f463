use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskq_errors::QueueError;

/// 未指定时任务的默认最大重试次数
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// 未指定时任务的默认优先级
pub const DEFAULT_PRIORITY: i32 = 0;

/// 队列中的一个工作单元
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String, // 处理器名称
    pub payload: serde_json::Value,
    pub priority: i32, // 越大越先分发，创建后不可变
    pub status: TaskStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Task {
    pub fn entity_description(&self) -> String {
        format!(
            "任务 '{}' (ID: {}, 优先级: {}, 状态: {})",
            self.name, self.id, self.priority, self.status
        )
    }
}

/// 入队请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
}

impl NewTask {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            priority: DEFAULT_PRIORITY,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: Utc::now(),
        }
    }
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.name.trim().is_empty() {
            return Err(QueueError::validation_error("任务名称不能为空"));
        }
        if self.max_retries < 0 {
            return Err(QueueError::validation_error(format!(
                "最大重试次数不能为负数: {}",
                self.max_retries
            )));
        }
        Ok(())
    }
}

/// 任务状态
///
/// 正常执行中只允许 pending→processing→{completed | pending(重试) | dead_letter}，
/// 运维可以把 dead_letter 重置回 pending。`Failed` 仅为兼容旧数据保留，分发器不会写入。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLetter => "dead_letter",
        }
    }
    /// 运维重置允许的起始状态
    pub fn can_reset(&self) -> bool {
        matches!(
            self,
            TaskStatus::DeadLetter | TaskStatus::Failed | TaskStatus::Pending
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "dead_letter" => Ok(TaskStatus::DeadLetter),
            _ => Err(QueueError::validation_error(format!("无效的任务状态: {s}"))),
        }
    }
}

/// 任务列表查询条件
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub min_priority: Option<i32>,
    pub name: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            min_priority: None,
            name: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl TaskFilter {
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }
    pub fn page(mut self, limit: i64, offset: i64) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}

/// 周期任务定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronTaskDefinition {
    pub id: i64,
    pub name: String,
    pub handler: String, // 与 Task.name 同一命名空间
    pub schedule: String, // 5字段 cron 表达式
    pub payload_template: serde_json::Value,
    pub is_active: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

impl CronTaskDefinition {
    /// 激活且 next_run 为空或已到期
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_run.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCronTask {
    pub name: String,
    pub handler: String,
    pub schedule: String,
    pub payload_template: serde_json::Value,
    pub is_active: bool,
}

impl NewCronTask {
    pub fn new(
        name: impl Into<String>,
        handler: impl Into<String>,
        schedule: impl Into<String>,
        payload_template: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            handler: handler.into(),
            schedule: schedule.into(),
            payload_template,
            is_active: true,
        }
    }
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Worker 存活记录，每个 worker_id 一行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub hostname: String,
    pub last_heartbeat: DateTime<Utc>,
    pub status: WorkerStatus,
    pub tasks_processed: i64,
    pub tasks_failed: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Running => "running",
            WorkerStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(WorkerStatus::Running),
            "stopped" => Ok(WorkerStatus::Stopped),
            _ => Err(QueueError::validation_error(format!("无效的Worker状态: {s}"))),
        }
    }
}
