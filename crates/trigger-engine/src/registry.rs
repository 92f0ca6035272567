//! 动作处理器注册表
//!
//! 宿主应用按动作类型注册处理器，类型名大小写不敏感。

use crate::context::TriggerContext;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// 动作处理器
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// 执行动作，`params` 已完成插值
    async fn handle(
        &self,
        params: &Map<String, Value>,
        ctx: &TriggerContext,
    ) -> anyhow::Result<Value>;
}

/// 闭包处理器适配
struct FnHandler<F, Fut> {
    function: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F, Fut>
where
    F: Fn(Map<String, Value>, TriggerContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(
        &self,
        params: &Map<String, Value>,
        ctx: &TriggerContext,
    ) -> anyhow::Result<Value> {
        (self.function)(params.clone(), ctx.clone()).await
    }
}

/// 动作注册表
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: Arc<DashMap<String, Arc<dyn ActionHandler>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(action_type: &str) -> String {
        action_type.trim().to_ascii_uppercase()
    }

    /// 注册处理器，同名处理器会被替换
    pub fn register(&self, action_type: &str, handler: Arc<dyn ActionHandler>) {
        let key = Self::normalize(action_type);
        debug!(action_type = %key, "注册动作处理器");
        self.handlers.insert(key, handler);
    }

    /// 以闭包注册处理器
    pub fn register_fn<F, Fut>(&self, action_type: &str, function: F)
    where
        F: Fn(Map<String, Value>, TriggerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(
            action_type,
            Arc::new(FnHandler {
                function,
                _marker: PhantomData,
            }),
        );
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers
            .get(&Self::normalize(action_type))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.handlers.contains_key(&Self::normalize(action_type))
    }

    pub fn unregister(&self, action_type: &str) -> bool {
        self.handlers.remove(&Self::normalize(action_type)).is_some()
    }

    /// 已注册的动作类型（排序后）
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("types", &self.types())
            .finish()
    }
}
