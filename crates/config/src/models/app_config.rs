use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig,
    dispatcher_worker::{CronConfig, RetryConfig, WorkerConfig},
    observability::ObservabilityConfig,
};

/// 未指定配置文件时依次尝试的路径
const DEFAULT_CONFIG_PATHS: [&str; 3] = ["config/taskq.toml", "taskq.toml", "/etc/taskq/config.toml"];

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub cron: CronConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: TASKQ__, section separator: __)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = Self::with_defaults(ConfigBuilder::builder())?;

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKQ")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    fn with_defaults(
        builder: config::builder::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::builder::ConfigBuilder<config::builder::DefaultState>> {
        let d = AppConfig::default();
        let builder = builder
            .set_default("database.url", d.database.url)?
            .set_default("database.max_connections", i64::from(d.database.max_connections))?
            .set_default("database.min_connections", i64::from(d.database.min_connections))?
            .set_default(
                "database.connection_timeout_seconds",
                d.database.connection_timeout_seconds as i64,
            )?
            .set_default("database.run_migrations", d.database.run_migrations)?
            .set_default("worker.worker_id", d.worker.worker_id)?
            .set_default("worker.hostname", d.worker.hostname)?
            .set_default("worker.poll_interval_ms", d.worker.poll_interval_ms as i64)?
            .set_default("worker.error_backoff_ms", d.worker.error_backoff_ms as i64)?
            .set_default(
                "worker.housekeeping_every_iterations",
                i64::from(d.worker.housekeeping_every_iterations),
            )?
            .set_default("retry.default_max_retries", i64::from(d.retry.default_max_retries))?
            .set_default("retry.base_delay_seconds", d.retry.base_delay_seconds as i64)?
            .set_default("retry.max_delay_seconds", d.retry.max_delay_seconds as i64)?
            .set_default("cron.enabled", d.cron.enabled)?
            .set_default("cron.task_priority", i64::from(d.cron.task_priority))?
            .set_default("observability.log_level", d.observability.log_level)?
            .set_default("observability.log_format", "pretty")?;
        Ok(builder)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// 定时任务物化时使用的最大重试次数
    pub fn cron_max_retries(&self) -> i32 {
        self.cron.max_retries.unwrap_or(self.retry.default_max_retries)
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.retry.validate().context("重试配置验证失败")?;
        self.cron.validate().context("定时任务配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        Ok(())
    }
}
