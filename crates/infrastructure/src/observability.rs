use std::net::SocketAddr;

use metrics::{counter, histogram, Counter, Histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use taskq_config::{LogFormat, ObservabilityConfig};
use taskq_errors::{QueueError, QueueResult};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const TASKS_CLAIMED_TOTAL: &str = "taskq_tasks_claimed_total";
pub const TASKS_COMPLETED_TOTAL: &str = "taskq_tasks_completed_total";
pub const TASKS_RETRIED_TOTAL: &str = "taskq_tasks_retried_total";
pub const TASKS_DEAD_LETTERED_TOTAL: &str = "taskq_tasks_dead_lettered_total";
pub const CRON_FIRED_TOTAL: &str = "taskq_cron_fired_total";
pub const LOOP_ERRORS_TOTAL: &str = "taskq_loop_errors_total";
pub const TASK_DURATION_SECONDS: &str = "taskq_task_duration_seconds";

/// 队列指标句柄
///
/// 未安装导出器时所有记录均为空操作。
#[derive(Clone)]
pub struct QueueMetrics {
    tasks_claimed: Counter,
    tasks_completed: Counter,
    tasks_retried: Counter,
    tasks_dead_lettered: Counter,
    cron_fired: Counter,
    loop_errors: Counter,
    task_duration: Histogram,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self {
            tasks_claimed: counter!(TASKS_CLAIMED_TOTAL),
            tasks_completed: counter!(TASKS_COMPLETED_TOTAL),
            tasks_retried: counter!(TASKS_RETRIED_TOTAL),
            tasks_dead_lettered: counter!(TASKS_DEAD_LETTERED_TOTAL),
            cron_fired: counter!(CRON_FIRED_TOTAL),
            loop_errors: counter!(LOOP_ERRORS_TOTAL),
            task_duration: histogram!(TASK_DURATION_SECONDS),
        }
    }

    pub fn record_claimed(&self) {
        self.tasks_claimed.increment(1);
    }

    pub fn record_completed(&self, duration_seconds: f64) {
        self.tasks_completed.increment(1);
        self.task_duration.record(duration_seconds);
    }

    pub fn record_retried(&self, duration_seconds: f64) {
        self.tasks_retried.increment(1);
        self.task_duration.record(duration_seconds);
    }

    pub fn record_dead_lettered(&self, duration_seconds: f64) {
        self.tasks_dead_lettered.increment(1);
        self.task_duration.record(duration_seconds);
    }

    pub fn record_cron_fired(&self, count: u64) {
        self.cron_fired.increment(count);
    }

    pub fn record_loop_error(&self) {
        self.loop_errors.increment(1);
    }
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 初始化结构化日志，`RUST_LOG` 优先于配置中的级别
///
/// 日志写到 stderr，stdout 留给命令输出。
pub fn init_logging(config: &ObservabilityConfig) -> QueueResult<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.log_format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.map_err(|e| QueueError::Internal(format!("日志系统初始化失败: {e}")))?;

    info!(
        logging.format = ?config.log_format,
        logging.level = %config.log_level,
        "结构化日志已初始化"
    );
    Ok(())
}

/// 在指定地址启动 Prometheus 导出器，须在 tokio 运行时内调用
pub fn init_metrics(bind: &str) -> QueueResult<()> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| QueueError::config_error(format!("无效的指标监听地址 {bind}: {e}")))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| QueueError::Internal(format!("Prometheus 导出器启动失败: {e}")))?;

    info!("Prometheus 指标导出器已启动: {}", addr);
    Ok(())
}
