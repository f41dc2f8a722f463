pub mod postgres_cron_task_repository;
pub mod postgres_heartbeat_repository;
pub mod postgres_task_repository;

pub use postgres_cron_task_repository::PostgresCronTaskRepository;
pub use postgres_heartbeat_repository::PostgresHeartbeatRepository;
pub use postgres_task_repository::PostgresTaskRepository;

use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row};
use taskq_domain::entities::{NewTask, Task};
use taskq_errors::QueueResult;

pub(crate) fn row_to_task(row: &PgRow) -> QueueResult<Task> {
    Ok(Task {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        payload: row.try_get("payload")?,
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

pub(crate) async fn insert_task<'e, E>(executor: E, task: &NewTask) -> QueueResult<i64>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO tasks (name, payload, priority, status, retry_count, max_retries, created_at)
        VALUES ($1, $2, $3, 'pending', 0, $4, $5)
        RETURNING id
        "#,
    )
    .bind(&task.name)
    .bind(&task.payload)
    .bind(task.priority)
    .bind(task.max_retries)
    .bind(task.created_at)
    .fetch_one(executor)
    .await?;

    Ok(id)
}
