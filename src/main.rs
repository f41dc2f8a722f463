use anyhow::{Context, Result};
use clap::Parser;
use taskq_config::AppConfig;
use taskq_infrastructure::init_logging;
use tracing::{debug, error};

mod cli;
mod shutdown;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            cli.config.as_deref().unwrap_or("<默认路径>")
        )
    })?;
    if let Some(format) = cli.log_format {
        config.observability.log_format = format;
    }

    init_logging(&config.observability).context("初始化日志系统失败")?;
    debug!(?config, "配置已加载");

    let result = cli.run(config).await;
    if let Err(e) = &result {
        error!("命令执行失败: {:#}", e);
    }
    result
}
