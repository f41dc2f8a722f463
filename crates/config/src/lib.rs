pub mod models;


pub use models::{
    AppConfig, CronConfig, DatabaseConfig, LogFormat, ObservabilityConfig, RetryConfig,
    WorkerConfig,
};
