use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use taskq_config::{AppConfig, CronConfig};
use taskq_domain::entities::{CronTaskDefinition, NewTask, DEFAULT_MAX_RETRIES};
use taskq_domain::repositories::CronTaskRepository;
use taskq_errors::{QueueError, QueueResult};
use taskq_infrastructure::QueueMetrics;
use tracing::{debug, info, warn};

use crate::cron_utils::CronExpression;

/// 单次物化的统计结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CronPassReport {
    pub fired: usize,
    /// 被其他 worker 抢先触发
    pub skipped: usize,
    pub failed: usize,
}

/// 周期任务物化器
///
/// 读取到期的周期任务定义，生成普通任务并推进 `next_run`。
pub struct CronScheduler {
    cron_repo: Arc<dyn CronTaskRepository>,
    task_priority: i32,
    max_retries: i32,
    metrics: QueueMetrics,
}

impl CronScheduler {
    pub fn new(cron_repo: Arc<dyn CronTaskRepository>, task_priority: i32, max_retries: i32) -> Self {
        Self {
            cron_repo,
            task_priority,
            max_retries,
            metrics: QueueMetrics::new(),
        }
    }

    pub fn from_config(cron_repo: Arc<dyn CronTaskRepository>, config: &AppConfig) -> Self {
        Self::new(cron_repo, config.cron.task_priority, config.cron_max_retries())
    }

    pub fn with_default_limits(cron_repo: Arc<dyn CronTaskRepository>) -> Self {
        Self::new(cron_repo, CronConfig::default().task_priority, DEFAULT_MAX_RETRIES)
    }

    /// 触发所有到期的定义，单个定义出错不影响其余定义
    pub async fn materialize_due(&self, now: DateTime<Utc>) -> QueueResult<CronPassReport> {
        let definitions = self.cron_repo.due(now).await?;
        let mut report = CronPassReport::default();

        for definition in &definitions {
            match self.fire_definition(definition, now).await {
                Ok(Some(_)) => report.fired += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        cron_id = definition.id,
                        cron_name = %definition.name,
                        schedule = %definition.schedule,
                        "周期任务触发失败: {}",
                        e
                    );
                }
            }
        }

        if report.fired > 0 {
            self.metrics.record_cron_fired(report.fired as u64);
        }
        if !definitions.is_empty() {
            debug!(
                "周期任务物化完成: 触发 {}, 跳过 {}, 失败 {}",
                report.fired, report.skipped, report.failed
            );
        }
        Ok(report)
    }

    /// 运维手动触发，忽略 `next_run` 是否到期
    pub async fn force_fire(&self, id: i64, now: DateTime<Utc>) -> QueueResult<i64> {
        let definition = self
            .cron_repo
            .get(id)
            .await?
            .ok_or_else(|| QueueError::cron_task_not_found(id))?;

        match self.fire_definition(&definition, now).await? {
            Some(task_id) => {
                self.metrics.record_cron_fired(1);
                Ok(task_id)
            }
            None => Err(QueueError::validation_error(format!(
                "周期任务 {id} 正在被其他 worker 触发，请稍后重试"
            ))),
        }
    }

    async fn fire_definition(
        &self,
        definition: &CronTaskDefinition,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<i64>> {
        let expression = CronExpression::parse(&definition.schedule)?;
        let next_run = expression.next_after(now).ok_or_else(|| {
            QueueError::invalid_cron(&definition.schedule, "表达式不会再次触发")
        })?;

        let task = NewTask::new(
            definition.handler.clone(),
            definition.payload_template.clone(),
        )
        .with_priority(self.task_priority)
        .with_max_retries(self.max_retries)
        .with_created_at(now);

        let fired = self
            .cron_repo
            .fire(definition.id, definition.next_run, now, next_run, &task)
            .await?;

        match fired {
            Some(task_id) => info!(
                cron_id = definition.id,
                task_id,
                cron_name = %definition.name,
                next_run = %next_run,
                "周期任务已触发"
            ),
            None => debug!(cron_id = definition.id, "周期任务已被其他 worker 触发"),
        }
        Ok(fired)
    }
}
