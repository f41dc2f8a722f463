//! 队列调度核心：重试策略、cron 表达式求值、周期任务物化以及运维操作

pub mod controller;
pub mod cron_scheduler;
pub mod cron_utils;
pub mod retry_policy;

pub use controller::OperatorService;
pub use cron_scheduler::{CronPassReport, CronScheduler};
pub use cron_utils::CronExpression;
pub use retry_policy::RetryPolicy;
