//! 可靠取任务
//!
//! 任务从队列原子地移入本进程的暂存列表后才开始执行，处理完再从暂存列表删除。
//! 进程崩溃时暂存列表里的任务由孤儿回收器放回队列。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::debug;

use conveyor_core::config::QueueWeight;
use conveyor_core::{ConveyorResult, QueueStore};

/// 队列轮询顺序
#[derive(Debug, Clone)]
pub enum QueueOrder {
    /// 按配置顺序，前面的队列为空才检查后面的
    Strict(Vec<String>),
    /// 每次取任务时按权重随机排列
    Weighted(Vec<QueueWeight>),
}

impl QueueOrder {
    pub fn new(queues: Vec<QueueWeight>, strict: bool) -> Self {
        if strict {
            let mut names: Vec<String> = Vec::with_capacity(queues.len());
            for queue in queues {
                if !names.contains(&queue.name) {
                    names.push(queue.name);
                }
            }
            QueueOrder::Strict(names)
        } else {
            QueueOrder::Weighted(queues)
        }
    }

    /// 本次取任务的队列顺序
    ///
    /// 加权模式下权重为 w 的队列在列表中出现 w 次，打乱后去重，
    /// 所以权重越大越可能排在前面，但每个队列都有机会被优先检查。
    pub fn order(&self) -> Vec<String> {
        match self {
            QueueOrder::Strict(names) => names.clone(),
            QueueOrder::Weighted(queues) => {
                let mut expanded: Vec<&str> = queues
                    .iter()
                    .flat_map(|q| std::iter::repeat(q.name.as_str()).take(q.weight as usize))
                    .collect();
                expanded.shuffle(&mut rand::rng());

                let mut order: Vec<String> = Vec::with_capacity(queues.len());
                for name in expanded {
                    if !order.iter().any(|n| n == name) {
                        order.push(name.to_string());
                    }
                }
                order
            }
        }
    }

    pub fn queue_names(&self) -> Vec<String> {
        match self {
            QueueOrder::Strict(names) => names.clone(),
            QueueOrder::Weighted(queues) => {
                let mut names: Vec<String> = Vec::with_capacity(queues.len());
                for queue in queues {
                    if !names.contains(&queue.name) {
                        names.push(queue.name.clone());
                    }
                }
                names
            }
        }
    }
}

/// 已暂存、等待处理的任务
pub struct UnitOfWork {
    store: Arc<dyn QueueStore>,
    pub identity: String,
    pub queue: String,
    /// 暂存列表中的原始负载，确认与放回时按它精确匹配
    pub payload: String,
}

impl UnitOfWork {
    pub fn new(
        store: Arc<dyn QueueStore>,
        identity: impl Into<String>,
        queue: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            store,
            identity: identity.into(),
            queue: queue.into(),
            payload: payload.into(),
        }
    }

    /// 处理完成，从暂存列表删除
    pub async fn acknowledge(&self) -> ConveyorResult<bool> {
        self.store
            .acknowledge(&self.identity, &self.queue, &self.payload)
            .await
    }

    /// 放回队列前端，下一个被取出
    pub async fn requeue(&self) -> ConveyorResult<bool> {
        self.store
            .requeue(&self.identity, &self.queue, &self.payload)
            .await
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("identity", &self.identity)
            .field("queue", &self.queue)
            .field("payload", &self.payload)
            .finish()
    }
}

pub struct Fetcher {
    store: Arc<dyn QueueStore>,
    identity: String,
    order: QueueOrder,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        identity: impl Into<String>,
        order: QueueOrder,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            identity: identity.into(),
            order,
            timeout,
        }
    }

    pub fn order(&self) -> &QueueOrder {
        &self.order
    }

    /// 取下一个任务
    ///
    /// 按本次顺序逐个队列非阻塞地尝试；全部为空时在第一个队列上阻塞等待，
    /// 最长 `timeout`。超时返回 `None`。
    pub async fn fetch(&self) -> ConveyorResult<Option<UnitOfWork>> {
        let order = self.order.order();

        for queue in &order {
            if let Some(payload) = self.store.pop_and_stage(queue, &self.identity).await? {
                return Ok(Some(self.unit(queue, payload)));
            }
        }

        let Some(first) = order.first() else {
            return Ok(None);
        };
        match self
            .store
            .blocking_pop_and_stage(first, &self.identity, self.timeout)
            .await?
        {
            Some(payload) => Ok(Some(self.unit(first, payload))),
            None => {
                debug!(queues = ?order, "所有队列为空");
                Ok(None)
            }
        }
    }

    fn unit(&self, queue: &str, payload: String) -> UnitOfWork {
        UnitOfWork::new(self.store.clone(), self.identity.clone(), queue, payload)
    }
}
