use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use taskq_domain::{entities::WorkerHeartbeat, repositories::HeartbeatRepository};
use taskq_errors::{QueueError, QueueResult};
use tracing::instrument;

use crate::database::HEARTBEAT_COLUMNS;

pub struct SqliteHeartbeatRepository {
    pool: SqlitePool,
}

impl SqliteHeartbeatRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_heartbeat(row: &SqliteRow) -> QueueResult<WorkerHeartbeat> {
        Ok(WorkerHeartbeat {
            worker_id: row.try_get("worker_id")?,
            hostname: row.try_get("hostname")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            status: row.try_get("status")?,
            tasks_processed: row.try_get("tasks_processed")?,
            tasks_failed: row.try_get("tasks_failed")?,
        })
    }
}

#[async_trait]
impl HeartbeatRepository for SqliteHeartbeatRepository {
    #[instrument(skip(self, hostname))]
    async fn beat(
        &self,
        worker_id: &str,
        hostname: &str,
        processed_delta: i64,
        failed_delta: i64,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats
                (worker_id, hostname, last_heartbeat, status, tasks_processed, tasks_failed)
            VALUES ($1, $2, $3, 'running', $4, $5)
            ON CONFLICT(worker_id) DO UPDATE SET
                hostname = excluded.hostname,
                last_heartbeat = excluded.last_heartbeat,
                status = 'running',
                tasks_processed = worker_heartbeats.tasks_processed + excluded.tasks_processed,
                tasks_failed = worker_heartbeats.tasks_failed + excluded.tasks_failed
            "#,
        )
        .bind(worker_id)
        .bind(hostname)
        .bind(now)
        .bind(processed_delta)
        .bind(failed_delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_stopped(&self, worker_id: &str, now: DateTime<Utc>) -> QueueResult<()> {
        let result = sqlx::query(
            "UPDATE worker_heartbeats SET status = 'stopped', last_heartbeat = $2 WHERE worker_id = $1",
        )
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::worker_not_found(worker_id));
        }
        Ok(())
    }

    async fn get(&self, worker_id: &str) -> QueueResult<Option<WorkerHeartbeat>> {
        let sql = format!("SELECT {HEARTBEAT_COLUMNS} FROM worker_heartbeats WHERE worker_id = $1");
        let row = sqlx::query(&sql)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_heartbeat).transpose()
    }

    async fn list(&self) -> QueueResult<Vec<WorkerHeartbeat>> {
        let sql = format!(
            "SELECT {HEARTBEAT_COLUMNS} FROM worker_heartbeats ORDER BY last_heartbeat DESC, worker_id ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_heartbeat).collect()
    }
}
