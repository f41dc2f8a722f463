pub mod app_config;
pub mod database;
pub mod dispatcher_worker;
pub mod observability;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use dispatcher_worker::{CronConfig, RetryConfig, WorkerConfig};
pub use observability::{LogFormat, ObservabilityConfig};
