//! 任务处理器注册表
//!
//! 处理器按任务类型名（`class`）注册，启动前构建完成，之后以 `Arc` 只读共享。

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{ConveyorError, ConveyorResult};

/// 用户业务逻辑入口，返回 `Err` 或 panic 都视为任务失败
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn perform(&self, args: &[Value]) -> anyhow::Result<()>;
}

/// 把异步闭包适配为处理器
pub struct FnHandler<F, Fut> {
    func: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn perform(&self, args: &[Value]) -> anyhow::Result<()> {
        (self.func)(args.to_vec()).await
    }
}

/// 什么都不做的处理器，用于冒烟测试与压测
pub struct NoopHandler;

#[async_trait]
impl JobHandler for NoopHandler {
    async fn perform(&self, _args: &[Value]) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(class.into(), handler);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, class: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(class, Arc::new(FnHandler::new(func)))
    }

    pub fn get(&self, class: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(class).cloned()
    }

    /// 查找处理器，未注册时返回 `UnknownJobClass`
    pub fn resolve(&self, class: &str) -> ConveyorResult<Arc<dyn JobHandler>> {
        self.get(class).ok_or_else(|| ConveyorError::UnknownJobClass {
            class: class.to_string(),
        })
    }

    pub fn contains(&self, class: &str) -> bool {
        self.handlers.contains_key(class)
    }

    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.handlers.keys().cloned().collect();
        classes.sort();
        classes
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("classes", &self.classes())
            .finish()
    }
}
