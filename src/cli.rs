use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use taskq_config::{AppConfig, LogFormat};
use taskq_dispatcher::{CronScheduler, OperatorService};
use taskq_domain::entities::{NewCronTask, TaskFilter, TaskStatus};
use taskq_infrastructure::{init_metrics, DatabaseManager};
use taskq_worker::{register_builtin_handlers, DispatcherBuilder, HandlerRegistry};
use tracing::info;

use crate::shutdown::{wait_for_shutdown_signal, ShutdownManager};

/// 数据库驱动的任务队列
#[derive(Parser, Debug)]
#[command(name = "taskq")]
#[command(version)]
#[command(about = "数据库驱动的异步任务队列与周期调度")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 配置文件路径，未指定时查找 config/taskq.toml 或 taskq.toml
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// 日志格式，覆盖配置文件 (pretty | json)
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行分发循环，直到收到 Ctrl+C 或 SIGTERM
    Worker {
        /// 覆盖配置中的 worker_id
        #[arg(long)]
        worker_id: Option<String>,
    },
    /// 提交一个任务
    Enqueue {
        /// 处理器名称
        name: String,
        /// 任务负载 (JSON)
        #[arg(short, long, default_value = "{}")]
        payload: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// 默认使用 retry.default_max_retries
        #[arg(long)]
        max_retries: Option<i32>,
    },
    /// 任务管理
    Tasks(TaskCommands),
    /// 周期任务管理
    Cron(CronCommands),
    /// Worker 心跳
    Workers(WorkerCommands),
    /// 创建或更新数据库表结构
    Migrate,
}

#[derive(Args, Debug)]
pub struct TaskCommands {
    #[command(subcommand)]
    pub action: TaskActions,
}

#[derive(Subcommand, Debug)]
pub enum TaskActions {
    /// 按分发顺序列出任务
    List {
        #[arg(short, long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        min_priority: Option<i32>,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long, default_value_t = 50)]
        limit: i64,
        #[arg(short, long, default_value_t = 0)]
        offset: i64,
    },
    /// 查看任务详情
    Show { id: i64 },
    /// 把死信任务重置为待执行
    Retry { id: i64 },
    /// 各状态任务数量
    Stats,
    /// 删除早于指定天数结束的已完成和死信任务
    Purge {
        #[arg(long)]
        older_than_days: u32,
    },
}

#[derive(Args, Debug)]
pub struct CronCommands {
    #[command(subcommand)]
    pub action: CronActions,
}

#[derive(Subcommand, Debug)]
pub enum CronActions {
    List,
    /// 创建周期任务定义
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        handler: String,
        /// 5字段 cron 表达式，UTC
        #[arg(long)]
        schedule: String,
        #[arg(long, default_value = "{}")]
        payload: String,
        /// 创建为停用状态
        #[arg(long)]
        inactive: bool,
    },
    Enable { id: i64 },
    Disable { id: i64 },
    /// 立即触发一次，同时推进下次执行时间
    Fire { id: i64 },
}

#[derive(Args, Debug)]
pub struct WorkerCommands {
    #[command(subcommand)]
    pub action: WorkerActions,
}

#[derive(Subcommand, Debug)]
pub enum WorkerActions {
    List,
}

impl Cli {
    pub async fn run(self, config: AppConfig) -> Result<()> {
        match self.command {
            Commands::Worker { worker_id } => run_worker(config, worker_id).await,
            Commands::Migrate => {
                let db = connect(&config).await?;
                db.migrate().await.context("执行数据库迁移失败")?;
                print_json(&json!({
                    "migrated": true,
                    "backend": format!("{:?}", db.database_type()),
                }))?;
                db.close().await;
                Ok(())
            }
            command => {
                let db = connect(&config).await?;
                let operator = operator_service(&db, &config);
                let result = run_operator(&operator, command).await;
                db.close().await;
                result
            }
        }
    }
}

async fn connect(config: &AppConfig) -> Result<DatabaseManager> {
    DatabaseManager::new(&config.database)
        .await
        .with_context(|| format!("连接数据库失败: {}", config.database.url))
}

fn operator_service(db: &DatabaseManager, config: &AppConfig) -> OperatorService {
    OperatorService::new(
        db.task_repository(),
        db.cron_task_repository(),
        db.heartbeat_repository(),
        CronScheduler::from_config(db.cron_task_repository(), config),
        config.retry.default_max_retries,
    )
}

fn parse_payload(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("负载不是合法的JSON: {raw}"))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("序列化输出失败")?
    );
    Ok(())
}

async fn run_operator(operator: &OperatorService, command: Commands) -> Result<()> {
    match command {
        Commands::Enqueue {
            name,
            payload,
            priority,
            max_retries,
        } => {
            let payload = parse_payload(&payload)?;
            let id = operator
                .enqueue(&name, payload, priority, max_retries)
                .await?;
            print_json(&json!({ "id": id }))
        }
        Commands::Tasks(TaskCommands { action }) => match action {
            TaskActions::List {
                status,
                min_priority,
                name,
                limit,
                offset,
            } => {
                let filter = TaskFilter {
                    status,
                    min_priority,
                    name,
                    limit,
                    offset,
                };
                print_json(&operator.list_tasks(&filter).await?)
            }
            TaskActions::Show { id } => print_json(&operator.show_task(id).await?),
            TaskActions::Retry { id } => print_json(&operator.retry_task(id).await?),
            TaskActions::Stats => print_json(&operator.queue_depth().await?),
            TaskActions::Purge { older_than_days } => {
                let purged = operator.purge_finished(older_than_days, Utc::now()).await?;
                print_json(&json!({ "purged": purged }))
            }
        },
        Commands::Cron(CronCommands { action }) => match action {
            CronActions::List => print_json(&operator.list_cron_tasks().await?),
            CronActions::Add {
                name,
                handler,
                schedule,
                payload,
                inactive,
            } => {
                let mut definition =
                    NewCronTask::new(name, handler, schedule, parse_payload(&payload)?);
                if inactive {
                    definition = definition.inactive();
                }
                print_json(&operator.add_cron_task(&definition).await?)
            }
            CronActions::Enable { id } => print_json(&operator.set_cron_active(id, true).await?),
            CronActions::Disable { id } => {
                print_json(&operator.set_cron_active(id, false).await?)
            }
            CronActions::Fire { id } => {
                let task_id = operator.fire_cron_task(id, Utc::now()).await?;
                print_json(&json!({ "cron_id": id, "task_id": task_id }))
            }
        },
        Commands::Workers(WorkerCommands {
            action: WorkerActions::List,
        }) => print_json(&operator.list_workers().await?),
        other @ (Commands::Worker { .. } | Commands::Migrate) => {
            Err(anyhow::anyhow!("不是运维命令: {other:?}"))
        }
    }
}

async fn run_worker(config: AppConfig, worker_id: Option<String>) -> Result<()> {
    if let Some(bind) = &config.observability.metrics_bind {
        init_metrics(bind).context("启动指标导出器失败")?;
    }

    let db = connect(&config).await?;

    let mut registry = HandlerRegistry::new();
    register_builtin_handlers(&mut registry).context("注册内置处理器失败")?;

    let mut builder = DispatcherBuilder::new(
        db.task_repository(),
        db.heartbeat_repository(),
        Arc::new(registry),
    )
    .with_config(&config);
    if config.cron.enabled {
        builder = builder.cron_scheduler(CronScheduler::from_config(
            db.cron_task_repository(),
            &config,
        ));
    }
    if let Some(id) = worker_id {
        builder = builder.worker_id(id);
    }
    let mut dispatcher = builder.build();
    info!(worker_id = %dispatcher.worker_id(), "启动 Worker");

    let shutdown = ShutdownManager::new();
    let shutdown_rx = shutdown.subscribe();
    let signal_manager = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("收到关闭信号，等待当前任务结束...");
        signal_manager.shutdown();
    });

    dispatcher
        .run(shutdown_rx)
        .await
        .context("Worker 分发循环异常退出")?;
    info!("Worker 已优雅关闭");

    db.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_list_filters() {
        let cli = Cli::try_parse_from([
            "taskq",
            "tasks",
            "list",
            "--status",
            "dead_letter",
            "--min-priority",
            "5",
            "--limit",
            "10",
        ])
        .unwrap();

        match cli.command {
            Commands::Tasks(TaskCommands {
                action:
                    TaskActions::List {
                        status,
                        min_priority,
                        limit,
                        offset,
                        ..
                    },
            }) => {
                assert_eq!(status, Some(TaskStatus::DeadLetter));
                assert_eq!(min_priority, Some(5));
                assert_eq!(limit, 10);
                assert_eq!(offset, 0);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_status_is_rejected() {
        assert!(Cli::try_parse_from(["taskq", "tasks", "list", "--status", "done"]).is_err());
    }

    #[test]
    fn test_global_flags_and_enqueue_defaults() {
        let cli = Cli::try_parse_from([
            "taskq",
            "enqueue",
            "echo",
            "--config",
            "custom.toml",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.config.as_deref(), Some("custom.toml"));
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        match cli.command {
            Commands::Enqueue {
                name,
                payload,
                priority,
                max_retries,
            } => {
                assert_eq!(name, "echo");
                assert_eq!(payload, "{}");
                assert_eq!(priority, 0);
                assert_eq!(max_retries, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cron_and_purge_commands() {
        let cli = Cli::try_parse_from([
            "taskq",
            "cron",
            "add",
            "--name",
            "nightly",
            "--handler",
            "echo",
            "--schedule",
            "0 3 * * *",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Cron(CronCommands {
                action: CronActions::Add { inactive: false, .. }
            })
        ));

        let cli =
            Cli::try_parse_from(["taskq", "tasks", "purge", "--older-than-days", "7"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Tasks(TaskCommands {
                action: TaskActions::Purge { older_than_days: 7 }
            })
        ));
    }

    #[test]
    fn test_invalid_payload_is_reported() {
        assert!(parse_payload("{not json").is_err());
        assert_eq!(parse_payload(r#"{"a":1}"#).unwrap(), json!({"a": 1}));
    }
}
