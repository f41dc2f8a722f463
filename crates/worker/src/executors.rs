use std::collections::HashMap;
use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskq_errors::QueueResult;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::registry::{HandlerError, HandlerRegistry, HandlerResult, TaskHandler};

/// 记录负载后直接成功，用于连通性检查
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, payload: &Value) -> HandlerResult {
        info!(payload = %payload, "echo");
        Ok(())
    }
}

/// Shell任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellTaskParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// 运行外部命令
///
/// 负载格式 `{"command": "...", "args": [...]}`，非零退出码视为可重试失败。
pub struct ShellHandler;

#[async_trait]
impl TaskHandler for ShellHandler {
    async fn handle(&self, payload: &Value) -> HandlerResult {
        let params: ShellTaskParams = serde_json::from_value(payload.clone())
            .map_err(|e| HandlerError::permanent(format!("解析Shell任务参数失败: {e}")))?;
        if params.command.trim().is_empty() {
            return Err(HandlerError::permanent("Shell命令不能为空"));
        }

        info!(command = %params.command, args = ?params.args, "执行Shell任务");

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .envs(&params.env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                HandlerError::permanent(format!("启动Shell命令失败: {e}"))
            }
            _ => HandlerError::retryable(format!("启动Shell命令失败: {e}")),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(stdout = %stdout.trim_end(), "Shell任务输出");

        if output.status.success() {
            Ok(())
        } else {
            let code = output
                .status
                .code()
                .map_or_else(|| "信号终止".to_string(), |c| c.to_string());
            warn!(exit_code = %code, stderr = %stderr.trim_end(), "Shell任务失败");
            Err(HandlerError::retryable(format!(
                "命令退出码 {code}: {}",
                stderr.trim_end()
            )))
        }
    }
}

/// 注册内置处理器 `echo` 和 `shell`
pub fn register_builtin_handlers(registry: &mut HandlerRegistry) -> QueueResult<()> {
    registry.register("echo", Arc::new(EchoHandler))?;
    registry.register("shell", Arc::new(ShellHandler))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_echo_always_succeeds() {
        assert_eq!(EchoHandler.handle(&json!({"hello": "world"})).await, Ok(()));
    }

    #[tokio::test]
    async fn test_shell_rejects_malformed_payload() {
        let result = ShellHandler.handle(&json!({"args": ["-l"]})).await;
        assert!(matches!(result, Err(HandlerError::Permanent(_))));

        let result = ShellHandler.handle(&json!({"command": "  "})).await;
        assert!(matches!(result, Err(HandlerError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_shell_missing_binary_is_permanent() {
        let result = ShellHandler
            .handle(&json!({"command": "/nonexistent/taskq-test-binary"}))
            .await;
        assert!(matches!(result, Err(HandlerError::Permanent(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_exit_status() {
        let ok = ShellHandler
            .handle(&json!({"command": "sh", "args": ["-c", "exit 0"]}))
            .await;
        assert_eq!(ok, Ok(()));

        let failed = ShellHandler
            .handle(&json!({"command": "sh", "args": ["-c", "echo oops >&2; exit 3"]}))
            .await;
        match failed {
            Err(HandlerError::Retryable(message)) => {
                assert!(message.contains('3'));
                assert!(message.contains("oops"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_builtin_registration() {
        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(&mut registry).unwrap();
        assert_eq!(registry.names(), vec!["echo".to_string(), "shell".to_string()]);
        assert!(register_builtin_handlers(&mut registry).is_err());
    }
}
