use thiserror::Error;

/// 任务队列错误类型定义
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },
    #[error("定时任务定义未找到: {id}")]
    CronTaskNotFound { id: i64 },
    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },
    #[error("任务 {id} 当前状态为 {from}，不允许执行 {action}")]
    InvalidStateTransition {
        id: i64,
        from: String,
        action: &'static str,
    },
    #[error("处理器已注册: {0}")]
    DuplicateHandler(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("数据验证失败: {0}")]
    Validation(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

impl QueueError {
    pub fn task_not_found(id: i64) -> Self {
        Self::TaskNotFound { id }
    }
    pub fn cron_task_not_found(id: i64) -> Self {
        Self::CronTaskNotFound { id }
    }
    pub fn worker_not_found<S: Into<String>>(id: S) -> Self {
        Self::WorkerNotFound { id: id.into() }
    }
    pub fn invalid_cron<E: Into<String>, M: Into<String>>(expr: E, message: M) -> Self {
        Self::InvalidCron {
            expr: expr.into(),
            message: message.into(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// 存储不可达、事务中止等基础设施故障
    ///
    /// Worker循环遇到此类错误时回滚、休眠后继续，不计入任何任务的重试次数。
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, QueueError::Database(_) | QueueError::Internal(_))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for QueueError {
    fn from(err: anyhow::Error) -> Self {
        QueueError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QueueError::task_not_found(42);
        assert_eq!(err.to_string(), "任务未找到: 42");

        let err = QueueError::InvalidStateTransition {
            id: 7,
            from: "completed".to_string(),
            action: "reset",
        };
        assert_eq!(err.to_string(), "任务 7 当前状态为 completed，不允许执行 reset");
    }

    #[test]
    fn test_error_classification() {
        assert!(QueueError::Database(sqlx::Error::PoolTimedOut).is_infrastructure());
        assert!(QueueError::Internal("boom".to_string()).is_infrastructure());
        assert!(!QueueError::task_not_found(1).is_infrastructure());
        assert!(!QueueError::invalid_cron("* *", "字段数量错误").is_infrastructure());
        assert!(!QueueError::config_error("bad").is_infrastructure());
    }

    #[test]
    fn test_from_serde_json() {
        let err: QueueError = serde_json::from_str::<serde_json::Value>("{bad")
            .unwrap_err()
            .into();
        assert!(matches!(err, QueueError::Serialization(_)));
    }
}
