pub mod sqlite_cron_task_repository;
pub mod sqlite_heartbeat_repository;
pub mod sqlite_task_repository;

pub use sqlite_cron_task_repository::SqliteCronTaskRepository;
pub use sqlite_heartbeat_repository::SqliteHeartbeatRepository;
pub use sqlite_task_repository::SqliteTaskRepository;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};
use taskq_domain::entities::{NewTask, Task};
use taskq_errors::{QueueError, QueueResult};

use super::TASK_COLUMNS;

/// SQLite 以文本列保存JSON
pub(crate) fn parse_json(row: &SqliteRow, column: &str) -> QueueResult<serde_json::Value> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw)
        .map_err(|e| QueueError::Serialization(format!("解析 {column} 列失败: {e}")))
}

/// 任务负载不是合法JSON时按原文作为字符串交给处理器
///
/// 认领在解码之前已经提交，解码失败会让任务永远停在 processing。
pub(crate) fn parse_payload(row: &SqliteRow) -> QueueResult<serde_json::Value> {
    let raw: String = row.try_get("payload")?;
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(payload) => Ok(payload),
        Err(_) => Ok(serde_json::Value::String(raw)),
    }
}

pub(crate) fn row_to_task(row: &SqliteRow) -> QueueResult<Task> {
    Ok(Task {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        payload: parse_payload(row)?,
        priority: row.try_get("priority")?,
        status: row.try_get("status")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        next_retry_at: row.try_get("next_retry_at")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        error: row.try_get("error")?,
    })
}

/// 插入一条待执行任务，入队和定时触发共用
pub(crate) async fn insert_task<'e, E>(executor: E, task: &NewTask) -> QueueResult<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let payload = serde_json::to_string(&task.payload)?;

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO tasks (name, payload, priority, status, retry_count, max_retries, created_at)
        VALUES ($1, $2, $3, 'pending', 0, $4, $5)
        RETURNING id
        "#,
    )
    .bind(&task.name)
    .bind(payload)
    .bind(task.priority)
    .bind(task.max_retries)
    .bind(task.created_at)
    .fetch_one(executor)
    .await?;

    Ok(id)
}

pub(crate) fn select_tasks_sql(where_clause: &str) -> String {
    format!("SELECT {TASK_COLUMNS} FROM tasks {where_clause}")
}
