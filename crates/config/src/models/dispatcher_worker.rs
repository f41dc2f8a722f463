use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker 循环配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 为空时启动阶段生成 `{hostname}-{uuid}`
    pub worker_id: String,
    /// 为空时读取本机主机名
    pub hostname: String,
    /// 没有可执行任务时的休眠间隔
    pub poll_interval_ms: u64,
    /// 基础设施错误后的休眠间隔
    pub error_backoff_ms: u64,
    /// 每隔多少次循环执行一次心跳和定时任务物化
    pub housekeeping_every_iterations: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            hostname: String::new(),
            poll_interval_ms: 3000,
            error_backoff_ms: 5000,
            housekeeping_every_iterations: 10,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("任务轮询间隔必须大于0"));
        }

        if self.error_backoff_ms == 0 {
            return Err(anyhow::anyhow!("错误退避间隔必须大于0"));
        }

        if self.housekeeping_every_iterations == 0 {
            return Err(anyhow::anyhow!("心跳与定时任务周期必须大于0"));
        }

        if self.worker_id.chars().any(char::is_whitespace) {
            return Err(anyhow::anyhow!("Worker ID不能包含空白字符: {}", self.worker_id));
        }

        Ok(())
    }
}

/// 重试退避配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub default_max_retries: i32,
    /// 基础重试间隔（秒）
    pub base_delay_seconds: u64,
    /// 最大重试间隔（秒）
    pub max_delay_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            base_delay_seconds: 60,  // 1分钟
            max_delay_seconds: 3600, // 1小时
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_max_retries < 0 {
            return Err(anyhow::anyhow!("默认最大重试次数不能为负数"));
        }

        if self.base_delay_seconds == 0 {
            return Err(anyhow::anyhow!("基础重试间隔必须大于0"));
        }

        if self.max_delay_seconds < self.base_delay_seconds {
            return Err(anyhow::anyhow!("最大重试间隔不能小于基础重试间隔"));
        }

        Ok(())
    }
}

/// 周期任务物化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    pub enabled: bool,
    /// 物化任务的优先级，高于普通入队的默认优先级
    pub task_priority: i32,
    /// 为空时使用 retry.default_max_retries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i32>,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            task_priority: 10,
            max_retries: None,
        }
    }
}

impl CronConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(max_retries) = self.max_retries {
            if max_retries < 0 {
                return Err(anyhow::anyhow!("定时任务最大重试次数不能为负数"));
            }
        }
        Ok(())
    }
}
