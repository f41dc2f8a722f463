use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use taskq_domain::{
    entities::{NewTask, Task, TaskFilter, TaskStatus},
    repositories::TaskRepository,
    value_objects::{RetryDecision, RetryTransition},
};
use taskq_errors::{QueueError, QueueResult};
use tracing::{debug, instrument};

use super::{insert_task, row_to_task, select_tasks_sql};
use crate::database::{resettable_statuses_sql, TASK_COLUMNS};

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 条件更新未命中时区分“任务不存在”和“状态不允许”
    async fn transition_error(&self, id: i64, action: &'static str) -> QueueError {
        match self.get(id).await {
            Ok(Some(task)) => QueueError::InvalidStateTransition {
                id,
                from: task.status.to_string(),
                action,
            },
            Ok(None) => QueueError::task_not_found(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, task), fields(task_name = %task.name, priority = task.priority))]
    async fn enqueue(&self, task: &NewTask) -> QueueResult<i64> {
        let id = insert_task(&self.pool, task).await?;
        debug!("任务入队成功: {} (ID: {})", task.name, id);
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn claim_next(&self, now: DateTime<Utc>) -> QueueResult<Option<Task>> {
        // 单条写语句在整个执行期间持有SQLite写锁，选择与标记不可能被其他连接穿插
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'processing', started_at = $1
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'pending'
                  AND (next_retry_at IS NULL OR next_retry_at <= $1)
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING {TASK_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let task = row_to_task(&row)?;
                debug!("认领任务: {}", task.entity_description());
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn complete(&self, id: i64, now: DateTime<Utc>) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed', completed_at = $2, next_retry_at = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, "complete").await);
        }
        Ok(())
    }

    #[instrument(skip(self, error, decision), fields(retry_count = decision.retry_count))]
    async fn fail(&self, id: i64, error: &str, decision: &RetryDecision) -> QueueResult<()> {
        let result = match decision.transition {
            RetryTransition::Retry { next_retry_at } => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'pending', retry_count = $2, next_retry_at = $3, error = $4
                    WHERE id = $1 AND status = 'processing'
                    "#,
                )
                .bind(id)
                .bind(decision.retry_count)
                .bind(next_retry_at)
                .bind(error)
                .execute(&self.pool)
                .await?
            }
            RetryTransition::DeadLetter => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'dead_letter', retry_count = $2, next_retry_at = NULL,
                        completed_at = $3, error = $4
                    WHERE id = $1 AND status = 'processing'
                    "#,
                )
                .bind(id)
                .bind(decision.retry_count)
                .bind(decision.failed_at)
                .bind(error)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, "fail").await);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reset_to_pending(&self, id: i64) -> QueueResult<Task> {
        let resettable = resettable_statuses_sql();
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'pending', retry_count = 0, error = NULL, next_retry_at = NULL,
                started_at = NULL, completed_at = NULL
            WHERE id = $1 AND status IN ({resettable})
            RETURNING {TASK_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_task(&row),
            None => Err(self.transition_error(id, "reset").await),
        }
    }

    async fn get(&self, id: i64) -> QueueResult<Option<Task>> {
        let row = sqlx::query(&select_tasks_sql("WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn list(&self, filter: &TaskFilter) -> QueueResult<Vec<Task>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1"));

        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(min_priority) = filter.min_priority {
            builder.push(" AND priority >= ").push_bind(min_priority);
        }
        if let Some(name) = &filter.name {
            builder.push(" AND name = ").push_bind(name.clone());
        }
        builder
            .push(" ORDER BY priority DESC, created_at ASC, id ASC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn count_by_status(&self) -> QueueResult<Vec<(TaskStatus, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let status: TaskStatus = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            counts.push((status, count));
        }
        Ok(counts)
    }

    #[instrument(skip(self))]
    async fn purge_finished(&self, before: DateTime<Utc>) -> QueueResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE status IN ('completed', 'dead_letter')
              AND completed_at IS NOT NULL
              AND completed_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?;

        debug!("清理已结束任务 {} 条", result.rows_affected());
        Ok(result.rows_affected())
    }
}
