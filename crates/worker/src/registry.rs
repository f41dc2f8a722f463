use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use taskq_domain::value_objects::FailureKind;
use taskq_errors::{QueueError, QueueResult};
use thiserror::Error;
use tracing::info;

/// 处理器返回的失败分类
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("可重试错误: {0}")]
    Retryable(String),
    #[error("不可重试错误: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable<S: Into<String>>(msg: S) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent<S: Into<String>>(msg: S) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            HandlerError::Retryable(_) => FailureKind::Retryable,
            HandlerError::Permanent(_) => FailureKind::Permanent,
        }
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// 任务处理器
///
/// 任务至少执行一次，同一负载可能因重试被执行多次，处理器需要自行保证幂等。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: &Value) -> HandlerResult;
}

struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, payload: &Value) -> HandlerResult {
        (self.func)(payload.clone()).await
    }
}

/// 任务名到处理器的映射
///
/// 进程启动时注册完毕，之后放入 `Arc` 只读共享给分发循环。
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> QueueResult<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(QueueError::validation_error("处理器名称不能为空"));
        }
        if self.handlers.contains_key(&name) {
            return Err(QueueError::DuplicateHandler(name));
        }
        info!("注册任务处理器: {}", name);
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// 用异步闭包注册处理器
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, func: F) -> QueueResult<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler { func }))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// 调用处理器，处理器 panic 视为可重试错误
pub async fn invoke(handler: &dyn TaskHandler, payload: &Value) -> HandlerResult {
    match AssertUnwindSafe(handler.handle(payload)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Retryable(format!(
            "处理器 panic: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知原因".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Always(HandlerResult);

    #[async_trait]
    impl TaskHandler for Always {
        async fn handle(&self, _payload: &Value) -> HandlerResult {
            self.0.clone()
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskHandler for Panics {
        async fn handle(&self, _payload: &Value) -> HandlerResult {
            panic!("磁盘已满");
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(Always(Ok(())))).unwrap();

        let err = registry
            .register("echo", Arc::new(Always(Ok(()))))
            .unwrap_err();
        assert!(matches!(err, QueueError::DuplicateHandler(ref name) if name == "echo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.register(" ", Arc::new(Always(Ok(())))).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_lookup_and_names() {
        let mut registry = HandlerRegistry::new();
        registry.register("b", Arc::new(Always(Ok(())))).unwrap();
        registry.register("a", Arc::new(Always(Ok(())))).unwrap();

        assert!(registry.contains("a"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_closure_handler_receives_payload() {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("needs_id", |payload: Value| async move {
                match payload.get("id") {
                    Some(_) => Ok(()),
                    None => Err(HandlerError::permanent("缺少 id")),
                }
            })
            .unwrap();

        let handler = registry.get("needs_id").unwrap();
        assert_eq!(invoke(handler.as_ref(), &json!({"id": 1})).await, Ok(()));
        assert_eq!(
            invoke(handler.as_ref(), &json!({})).await,
            Err(HandlerError::Permanent("缺少 id".to_string()))
        );
    }

    #[tokio::test]
    async fn test_panic_becomes_retryable_error() {
        let result = invoke(&Panics, &json!({})).await;
        match result {
            Err(HandlerError::Retryable(message)) => assert!(message.contains("磁盘已满")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(
            HandlerError::retryable("x").failure_kind(),
            FailureKind::Retryable
        );
        assert_eq!(
            HandlerError::permanent("x").failure_kind(),
            FailureKind::Permanent
        );
    }
}
