use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::TaskStatus;

/// 失败分类，驱动重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 处理器返回可重试错误（或发生panic）
    Retryable,
    /// 处理器明确声明不可重试
    Permanent,
    /// 注册表中没有该名称的处理器，仍按退避重试直到进入死信
    UnknownHandler,
}

/// 重试策略对一次失败给出的结论
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDecision {
    /// 已递增后的重试次数
    pub retry_count: i32,
    pub failed_at: DateTime<Utc>,
    pub transition: RetryTransition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum RetryTransition {
    Retry { next_retry_at: DateTime<Utc> },
    DeadLetter,
}

impl RetryDecision {
    pub fn is_dead_letter(&self) -> bool {
        matches!(self.transition, RetryTransition::DeadLetter)
    }
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        match self.transition {
            RetryTransition::Retry { next_retry_at } => Some(next_retry_at),
            RetryTransition::DeadLetter => None,
        }
    }
}

/// 各状态任务数量，用于队列深度展示
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueDepth {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead_letter: i64,
}

impl QueueDepth {
    pub fn from_counts(counts: &[(TaskStatus, i64)]) -> Self {
        let mut depth = Self::default();
        for (status, count) in counts {
            match status {
                TaskStatus::Pending => depth.pending += count,
                TaskStatus::Processing => depth.processing += count,
                TaskStatus::Completed => depth.completed += count,
                TaskStatus::Failed => depth.failed += count,
                TaskStatus::DeadLetter => depth.dead_letter += count,
            }
        }
        depth
    }
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed + self.dead_letter
    }
    pub fn active(&self) -> i64 {
        self.pending + self.processing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_depth_from_counts() {
        let depth = QueueDepth::from_counts(&[
            (TaskStatus::Pending, 4),
            (TaskStatus::Processing, 1),
            (TaskStatus::DeadLetter, 2),
        ]);
        assert_eq!(depth.pending, 4);
        assert_eq!(depth.dead_letter, 2);
        assert_eq!(depth.active(), 5);
        assert_eq!(depth.total(), 7);
    }

    #[test]
    fn test_retry_decision_accessors() {
        let now = Utc::now();
        let retry = RetryDecision {
            retry_count: 1,
            failed_at: now,
            transition: RetryTransition::Retry { next_retry_at: now },
        };
        assert_eq!(retry.next_retry_at(), Some(now));
        assert!(!retry.is_dead_letter());

        let dead = RetryDecision {
            retry_count: 4,
            failed_at: now,
            transition: RetryTransition::DeadLetter,
        };
        assert!(dead.is_dead_letter());
        assert_eq!(dead.next_retry_at(), None);
    }
}
