use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use taskq_config::DatabaseConfig;
use taskq_domain::repositories::{CronTaskRepository, HeartbeatRepository, TaskRepository};
use taskq_errors::QueueResult;
use tracing::info;

use super::migrations;
use super::postgres::{
    PostgresCronTaskRepository, PostgresHeartbeatRepository, PostgresTaskRepository,
};
use super::sqlite::{SqliteCronTaskRepository, SqliteHeartbeatRepository, SqliteTaskRepository};

/// Database type detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            DatabaseType::PostgreSQL
        } else {
            DatabaseType::SQLite
        }
    }
}

/// 内存数据库每个连接各自独立，连接池只能保留一个长期连接
fn is_in_memory_sqlite(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Database connection pool enum
#[derive(Clone)]
pub enum DatabasePool {
    PostgreSQL(sqlx::PgPool),
    SQLite(sqlx::SqlitePool),
}

impl DatabasePool {
    /// Create pool from config with automatic type detection
    pub async fn new(config: &DatabaseConfig) -> QueueResult<Self> {
        let acquire_timeout = Duration::from_secs(config.connection_timeout_seconds);

        match DatabaseType::from_url(&config.url) {
            DatabaseType::PostgreSQL => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(acquire_timeout)
                    .connect(&config.url)
                    .await?;
                Ok(DatabasePool::PostgreSQL(pool))
            }
            DatabaseType::SQLite => {
                let in_memory = is_in_memory_sqlite(&config.url);
                let mut options = SqliteConnectOptions::from_str(&config.url)?
                    .create_if_missing(true)
                    .busy_timeout(Duration::from_secs(5));
                if !in_memory {
                    options = options.journal_mode(SqliteJournalMode::Wal);
                }

                let pool_options = if in_memory {
                    SqlitePoolOptions::new()
                        .max_connections(1)
                        .min_connections(1)
                        .idle_timeout(None)
                        .max_lifetime(None)
                } else {
                    SqlitePoolOptions::new()
                        .max_connections(config.max_connections)
                        .min_connections(config.min_connections)
                };

                let pool = pool_options
                    .acquire_timeout(acquire_timeout)
                    .connect_with(options)
                    .await?;
                Ok(DatabasePool::SQLite(pool))
            }
        }
    }

    pub fn database_type(&self) -> DatabaseType {
        match self {
            DatabasePool::PostgreSQL(_) => DatabaseType::PostgreSQL,
            DatabasePool::SQLite(_) => DatabaseType::SQLite,
        }
    }

    pub async fn health_check(&self) -> QueueResult<()> {
        match self {
            DatabasePool::PostgreSQL(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
            DatabasePool::SQLite(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        match self {
            DatabasePool::PostgreSQL(pool) => pool.close().await,
            DatabasePool::SQLite(pool) => pool.close().await,
        }
    }
}

/// Unified database manager
pub struct DatabaseManager {
    pool: DatabasePool,
}

impl DatabaseManager {
    /// 按配置建立连接池，`run_migrations` 为真时顺带建表
    pub async fn new(config: &DatabaseConfig) -> QueueResult<Self> {
        let pool = DatabasePool::new(config).await?;
        let manager = Self { pool };
        info!(
            "数据库连接已建立: {:?}, 最大连接数 {}",
            manager.database_type(),
            config.max_connections
        );
        if config.run_migrations {
            manager.migrate().await?;
        }
        Ok(manager)
    }

    /// 使用默认连接参数打开指定URL，主要用于测试
    pub async fn connect(url: &str) -> QueueResult<Self> {
        let config = DatabaseConfig {
            url: url.to_string(),
            ..DatabaseConfig::default()
        };
        Self::new(&config).await
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    pub fn database_type(&self) -> DatabaseType {
        self.pool.database_type()
    }

    pub async fn migrate(&self) -> QueueResult<()> {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => migrations::migrate_postgres(pool).await,
            DatabasePool::SQLite(pool) => migrations::migrate_sqlite(pool).await,
        }
    }

    pub async fn health_check(&self) -> QueueResult<()> {
        self.pool.health_check().await
    }

    pub async fn close(&self) {
        self.pool.close().await
    }

    /// Factory method for task repository
    pub fn task_repository(&self) -> Arc<dyn TaskRepository> {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => Arc::new(PostgresTaskRepository::new(pool.clone())),
            DatabasePool::SQLite(pool) => Arc::new(SqliteTaskRepository::new(pool.clone())),
        }
    }

    /// Factory method for cron task repository
    pub fn cron_task_repository(&self) -> Arc<dyn CronTaskRepository> {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => {
                Arc::new(PostgresCronTaskRepository::new(pool.clone()))
            }
            DatabasePool::SQLite(pool) => Arc::new(SqliteCronTaskRepository::new(pool.clone())),
        }
    }

    /// Factory method for heartbeat repository
    pub fn heartbeat_repository(&self) -> Arc<dyn HeartbeatRepository> {
        match &self.pool {
            DatabasePool::PostgreSQL(pool) => {
                Arc::new(PostgresHeartbeatRepository::new(pool.clone()))
            }
            DatabasePool::SQLite(pool) => Arc::new(SqliteHeartbeatRepository::new(pool.clone())),
        }
    }
}
