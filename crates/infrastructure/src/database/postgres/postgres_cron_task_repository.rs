use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Row, PgPool};
use taskq_domain::{
    entities::{CronTaskDefinition, NewCronTask, NewTask},
    repositories::CronTaskRepository,
};
use taskq_errors::{QueueError, QueueResult};
use tracing::{debug, instrument};

use super::insert_task;
use crate::database::CRON_TASK_COLUMNS;

pub struct PostgresCronTaskRepository {
    pool: PgPool,
}

impl PostgresCronTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_definition(row: &PgRow) -> QueueResult<CronTaskDefinition> {
        Ok(CronTaskDefinition {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            handler: row.try_get("handler")?,
            schedule: row.try_get("schedule")?,
            payload_template: row.try_get("payload_template")?,
            is_active: row.try_get("is_active")?,
            last_run: row.try_get("last_run")?,
            next_run: row.try_get("next_run")?,
        })
    }
}

#[async_trait]
impl CronTaskRepository for PostgresCronTaskRepository {
    #[instrument(skip(self, definition), fields(cron_name = %definition.name))]
    async fn create(&self, definition: &NewCronTask) -> QueueResult<CronTaskDefinition> {
        let sql = format!(
            r#"
            INSERT INTO cron_tasks (name, handler, schedule, payload_template, is_active)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {CRON_TASK_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(&definition.name)
            .bind(&definition.handler)
            .bind(&definition.schedule)
            .bind(&definition.payload_template)
            .bind(definition.is_active)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    QueueError::validation_error(format!(
                        "周期任务名称已存在: {}",
                        definition.name
                    ))
                }
                _ => QueueError::Database(e),
            })?;

        let created = Self::row_to_definition(&row)?;
        debug!("创建周期任务: {} (ID: {})", created.name, created.id);
        Ok(created)
    }

    async fn get(&self, id: i64) -> QueueResult<Option<CronTaskDefinition>> {
        let sql = format!("SELECT {CRON_TASK_COLUMNS} FROM cron_tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_definition).transpose()
    }

    async fn get_by_name(&self, name: &str) -> QueueResult<Option<CronTaskDefinition>> {
        let sql = format!("SELECT {CRON_TASK_COLUMNS} FROM cron_tasks WHERE name = $1");
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_definition).transpose()
    }

    async fn list(&self) -> QueueResult<Vec<CronTaskDefinition>> {
        let sql = format!("SELECT {CRON_TASK_COLUMNS} FROM cron_tasks ORDER BY id ASC");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_definition).collect()
    }

    async fn due(&self, now: DateTime<Utc>) -> QueueResult<Vec<CronTaskDefinition>> {
        let sql = format!(
            r#"
            SELECT {CRON_TASK_COLUMNS} FROM cron_tasks
            WHERE is_active = TRUE AND (next_run IS NULL OR next_run <= $1)
            ORDER BY id ASC
            "#
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_definition).collect()
    }

    #[instrument(skip(self))]
    async fn set_active(&self, id: i64, is_active: bool) -> QueueResult<()> {
        let result = sqlx::query("UPDATE cron_tasks SET is_active = $2 WHERE id = $1")
            .bind(id)
            .bind(is_active)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::cron_task_not_found(id));
        }
        Ok(())
    }

    #[instrument(skip(self, task), fields(task_name = %task.name))]
    async fn fire(
        &self,
        id: i64,
        expected_next_run: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
        next_run: DateTime<Utc>,
        task: &NewTask,
    ) -> QueueResult<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        // 并发触发时后到者等待行锁，重新检查条件后不再命中
        let claimed = sqlx::query(
            r#"
            UPDATE cron_tasks
            SET last_run = $2, next_run = $3
            WHERE id = $1 AND next_run IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(id)
        .bind(fired_at)
        .bind(next_run)
        .bind(expected_next_run)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            debug!("周期任务 {} 已被其他 worker 触发，跳过", id);
            return Ok(None);
        }

        let task_id = insert_task(&mut *tx, task).await?;
        tx.commit().await?;

        Ok(Some(task_id))
    }
}
