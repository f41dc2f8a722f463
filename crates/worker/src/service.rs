use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use taskq_config::AppConfig;
use taskq_dispatcher::{CronPassReport, CronScheduler, RetryPolicy};
use taskq_domain::entities::Task;
use taskq_domain::repositories::{HeartbeatRepository, TaskRepository};
use taskq_domain::value_objects::{FailureKind, RetryTransition};
use taskq_errors::QueueResult;
use taskq_infrastructure::QueueMetrics;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::heartbeat::HeartbeatReporter;
use crate::registry::{invoke, HandlerRegistry};

/// 单个任务处理后的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        task_id: i64,
    },
    Retried {
        task_id: i64,
        next_retry_at: DateTime<Utc>,
    },
    DeadLettered {
        task_id: i64,
    },
}

/// 分发循环构建器
pub struct DispatcherBuilder {
    task_repo: Arc<dyn TaskRepository>,
    heartbeat_repo: Arc<dyn HeartbeatRepository>,
    registry: Arc<HandlerRegistry>,
    worker_id: Option<String>,
    hostname: Option<String>,
    retry_policy: RetryPolicy,
    cron_scheduler: Option<CronScheduler>,
    poll_interval: Duration,
    error_backoff: Duration,
    housekeeping_every: u32,
}

impl DispatcherBuilder {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        heartbeat_repo: Arc<dyn HeartbeatRepository>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            task_repo,
            heartbeat_repo,
            registry,
            worker_id: None,
            hostname: None,
            retry_policy: RetryPolicy::default(),
            cron_scheduler: None,
            poll_interval: Duration::from_secs(3),
            error_backoff: Duration::from_secs(5),
            housekeeping_every: 10,
        }
    }

    /// 应用 worker 与重试配置，空字符串表示自动生成
    pub fn with_config(mut self, config: &AppConfig) -> Self {
        if !config.worker.worker_id.is_empty() {
            self.worker_id = Some(config.worker.worker_id.clone());
        }
        if !config.worker.hostname.is_empty() {
            self.hostname = Some(config.worker.hostname.clone());
        }
        self.retry_policy = RetryPolicy::from_config(&config.retry);
        self.poll_interval = config.worker.poll_interval();
        self.error_backoff = config.worker.error_backoff();
        self.housekeeping_every = config.worker.housekeeping_every_iterations;
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn cron_scheduler(mut self, cron_scheduler: CronScheduler) -> Self {
        self.cron_scheduler = Some(cron_scheduler);
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    pub fn housekeeping_every(mut self, iterations: u32) -> Self {
        self.housekeeping_every = iterations.max(1);
        self
    }

    pub fn build(self) -> Dispatcher {
        let hostname = self.hostname.unwrap_or_else(local_hostname);
        let worker_id = self
            .worker_id
            .unwrap_or_else(|| format!("{}-{}", hostname, uuid::Uuid::new_v4()));

        Dispatcher {
            heartbeat: HeartbeatReporter::new(self.heartbeat_repo, worker_id, hostname),
            task_repo: self.task_repo,
            registry: self.registry,
            retry_policy: self.retry_policy,
            cron_scheduler: self.cron_scheduler,
            poll_interval: self.poll_interval,
            error_backoff: self.error_backoff,
            housekeeping_every: u64::from(self.housekeeping_every.max(1)),
            iterations: 0,
            metrics: QueueMetrics::new(),
        }
    }
}

/// 一轮处理之后的等待时间，`None` 表示立即进入下一轮
///
/// 只有存储不可用时才退避；任务本身的错误不影响后续任务。
fn pause_after(
    result: &QueueResult<Option<TaskOutcome>>,
    poll_interval: Duration,
    error_backoff: Duration,
) -> Option<Duration> {
    match result {
        Ok(Some(_)) => None,
        Ok(None) => Some(poll_interval),
        Err(e) if e.is_infrastructure() => Some(error_backoff),
        Err(_) => None,
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// 单线程顺序执行的任务分发循环
///
/// 正常执行期间只有分发循环会修改任务状态。
pub struct Dispatcher {
    task_repo: Arc<dyn TaskRepository>,
    registry: Arc<HandlerRegistry>,
    retry_policy: RetryPolicy,
    cron_scheduler: Option<CronScheduler>,
    heartbeat: HeartbeatReporter,
    poll_interval: Duration,
    error_backoff: Duration,
    housekeeping_every: u64,
    iterations: u64,
    metrics: QueueMetrics,
}

impl Dispatcher {
    pub fn worker_id(&self) -> &str {
        self.heartbeat.worker_id()
    }

    pub fn heartbeat(&self) -> &HeartbeatReporter {
        &self.heartbeat
    }

    /// 运行直到收到关闭信号，退出前写入最终心跳
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> QueueResult<()> {
        info!(
            worker_id = %self.worker_id(),
            handlers = ?self.registry.names(),
            "Worker 开始轮询任务"
        );

        loop {
            if self.iterations % self.housekeeping_every == 0 {
                self.housekeeping(Utc::now()).await;
            }
            self.iterations = self.iterations.wrapping_add(1);

            let result = self.process_next(Utc::now()).await;
            if let Err(e) = &result {
                self.metrics.record_loop_error();
                if e.is_infrastructure() {
                    error!(worker_id = %self.worker_id(), "分发循环出错，稍后重试: {}", e);
                } else {
                    warn!(worker_id = %self.worker_id(), "跳过本次任务，继续轮询: {}", e);
                }
            }
            let pause = pause_after(&result, self.poll_interval, self.error_backoff);

            let stop = match pause {
                Some(duration) => tokio::select! {
                    _ = shutdown.recv() => true,
                    _ = tokio::time::sleep(duration) => false,
                },
                None => !matches!(
                    shutdown.try_recv(),
                    Err(broadcast::error::TryRecvError::Empty)
                ),
            };
            if stop {
                break;
            }
        }

        info!(worker_id = %self.worker_id(), "收到关闭信号，Worker 停止轮询");
        self.heartbeat.stop(Utc::now()).await;
        Ok(())
    }

    /// 认领并执行一个任务；没有可执行任务时返回 `None`
    pub async fn process_next(&mut self, now: DateTime<Utc>) -> QueueResult<Option<TaskOutcome>> {
        let Some(task) = self.task_repo.claim_next(now).await? else {
            return Ok(None);
        };
        self.metrics.record_claimed();
        debug!(task_id = task.id, task_name = %task.name, "开始执行任务");

        let started = Instant::now();
        let result = match self.registry.get(&task.name) {
            Some(handler) => invoke(handler.as_ref(), &task.payload)
                .await
                .map_err(|e| (e.failure_kind(), e.to_string())),
            None => Err((
                FailureKind::UnknownHandler,
                format!("未注册的任务处理器: {}", task.name),
            )),
        };
        let elapsed = started.elapsed();
        let finished_at = now + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());

        let settled = match result {
            Ok(()) => self.settle_success(&task, finished_at).await,
            Err((kind, message)) => {
                self.settle_failure(&task, kind, &message, finished_at)
                    .await
            }
        };
        let outcome = match settled {
            Ok(outcome) => outcome,
            Err(e) => {
                if !e.is_infrastructure() {
                    error!(
                        task_id = task.id,
                        task_name = %task.name,
                        "任务结果无法写回: {}",
                        e
                    );
                }
                return Err(e);
            }
        };

        let seconds = elapsed.as_secs_f64();
        match outcome {
            TaskOutcome::Completed { .. } => self.metrics.record_completed(seconds),
            TaskOutcome::Retried { .. } => self.metrics.record_retried(seconds),
            TaskOutcome::DeadLettered { .. } => self.metrics.record_dead_lettered(seconds),
        }
        Ok(Some(outcome))
    }

    async fn settle_success(
        &mut self,
        task: &Task,
        finished_at: DateTime<Utc>,
    ) -> QueueResult<TaskOutcome> {
        self.task_repo.complete(task.id, finished_at).await?;
        self.heartbeat.record_processed();
        info!(task_id = task.id, task_name = %task.name, "任务执行成功");
        Ok(TaskOutcome::Completed { task_id: task.id })
    }

    async fn settle_failure(
        &mut self,
        task: &Task,
        kind: FailureKind,
        message: &str,
        finished_at: DateTime<Utc>,
    ) -> QueueResult<TaskOutcome> {
        let decision =
            self.retry_policy
                .decide(task.retry_count, task.max_retries, finished_at, kind);
        self.task_repo.fail(task.id, message, &decision).await?;
        self.heartbeat.record_failed();

        match decision.transition {
            RetryTransition::Retry { next_retry_at } => {
                warn!(
                    task_id = task.id,
                    task_name = %task.name,
                    retry_count = decision.retry_count,
                    next_retry_at = %next_retry_at,
                    "任务执行失败，等待重试: {}",
                    message
                );
                Ok(TaskOutcome::Retried {
                    task_id: task.id,
                    next_retry_at,
                })
            }
            RetryTransition::DeadLetter => {
                error!(
                    task_id = task.id,
                    task_name = %task.name,
                    retry_count = decision.retry_count,
                    "任务进入死信队列: {}",
                    message
                );
                Ok(TaskOutcome::DeadLettered { task_id: task.id })
            }
        }
    }

    /// 写入心跳并物化到期的周期任务，两者互不影响
    pub async fn housekeeping(&mut self, now: DateTime<Utc>) -> Option<CronPassReport> {
        if let Err(e) = self.heartbeat.beat(now).await {
            self.metrics.record_loop_error();
            warn!(worker_id = %self.heartbeat.worker_id(), "心跳写入失败: {}", e);
        }

        let scheduler = self.cron_scheduler.as_ref()?;
        match scheduler.materialize_due(now).await {
            Ok(report) => Some(report),
            Err(e) => {
                self.metrics.record_loop_error();
                warn!("周期任务物化失败: {}", e);
                None
            }
        }
    }
}
