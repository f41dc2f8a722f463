//! 建表迁移，全部为幂等的 `IF NOT EXISTS` 语句

use sqlx::{PgPool, SqlitePool};
use taskq_errors::QueueResult;
use tracing::debug;

const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}',
        priority INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        next_retry_at DATETIME,
        created_at DATETIME NOT NULL,
        started_at DATETIME,
        completed_at DATETIME,
        error TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cron_tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        handler TEXT NOT NULL,
        schedule TEXT NOT NULL,
        payload_template TEXT NOT NULL DEFAULT '{}',
        is_active BOOLEAN NOT NULL DEFAULT 1,
        last_run DATETIME,
        next_run DATETIME
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS worker_heartbeats (
        worker_id TEXT PRIMARY KEY,
        hostname TEXT NOT NULL,
        last_heartbeat DATETIME NOT NULL,
        status TEXT NOT NULL DEFAULT 'running',
        tasks_processed INTEGER NOT NULL DEFAULT 0,
        tasks_failed INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_dispatch ON tasks(status, priority DESC, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_next_retry_at ON tasks(next_retry_at)",
    "CREATE INDEX IF NOT EXISTS idx_cron_tasks_next_run ON cron_tasks(is_active, next_run)",
];

const POSTGRES_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        payload JSONB NOT NULL DEFAULT '{}'::jsonb,
        priority INTEGER NOT NULL DEFAULT 0,
        status VARCHAR(20) NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        next_retry_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        error TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cron_tasks (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(255) NOT NULL UNIQUE,
        handler VARCHAR(255) NOT NULL,
        schedule VARCHAR(255) NOT NULL,
        payload_template JSONB NOT NULL DEFAULT '{}'::jsonb,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        last_run TIMESTAMPTZ,
        next_run TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS worker_heartbeats (
        worker_id VARCHAR(255) PRIMARY KEY,
        hostname VARCHAR(255) NOT NULL,
        last_heartbeat TIMESTAMPTZ NOT NULL,
        status VARCHAR(20) NOT NULL DEFAULT 'running',
        tasks_processed BIGINT NOT NULL DEFAULT 0,
        tasks_failed BIGINT NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_dispatch ON tasks(status, priority DESC, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_next_retry_at ON tasks(next_retry_at)",
    "CREATE INDEX IF NOT EXISTS idx_cron_tasks_next_run ON cron_tasks(is_active, next_run)",
];

/// 运行SQLite迁移
pub async fn migrate_sqlite(pool: &SqlitePool) -> QueueResult<()> {
    debug!("Running SQLite database migrations");
    for statement in SQLITE_SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!("Successfully completed SQLite database migrations");
    Ok(())
}

/// 运行PostgreSQL迁移
pub async fn migrate_postgres(pool: &PgPool) -> QueueResult<()> {
    debug!("Running PostgreSQL database migrations");
    for statement in POSTGRES_SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!("Successfully completed PostgreSQL database migrations");
    Ok(())
}
