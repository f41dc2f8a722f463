pub mod manager;
pub mod migrations;
pub mod postgres;
pub mod sqlite;

pub use manager::{DatabaseManager, DatabasePool, DatabaseType};
pub use postgres::{
    PostgresCronTaskRepository, PostgresHeartbeatRepository, PostgresTaskRepository,
};
pub use sqlite::{SqliteCronTaskRepository, SqliteHeartbeatRepository, SqliteTaskRepository};

use taskq_domain::entities::TaskStatus;

/// 任务表查询列，两种后端共用
pub(crate) const TASK_COLUMNS: &str = "id, name, payload, priority, status, retry_count, max_retries, \
     next_retry_at, created_at, started_at, completed_at, error";

pub(crate) const CRON_TASK_COLUMNS: &str =
    "id, name, handler, schedule, payload_template, is_active, last_run, next_run";

pub(crate) const HEARTBEAT_COLUMNS: &str =
    "worker_id, hostname, last_heartbeat, status, tasks_processed, tasks_failed";

/// 运维可以重置的状态，渲染为 SQL `IN` 列表
pub(crate) fn resettable_statuses_sql() -> String {
    TaskStatus::ALL
        .iter()
        .filter(|status| status.can_reset())
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resettable_statuses_sql() {
        assert_eq!(
            resettable_statuses_sql(),
            "'pending', 'failed', 'dead_letter'"
        );
    }
}
