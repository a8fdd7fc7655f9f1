//! 共享队列存储接口
//!
//! 工作进程之间只通过这个接口协作。每个会移动任务记录的方法都必须是一次原子的
//! 存储操作，保证任务记录任何时刻只存在于一个位置：队列、定时集合、重试集合、
//! 死信集合，或某个进程的暂存列表。
//!
//! 方法参数使用逻辑名称（队列名、进程标识），具体的键名与命名空间由实现负责。

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DeadSetConfig;
use crate::errors::ConveyorResult;
use crate::models::{Heartbeat, ProcessSnapshot, WorkEntry};

/// 按分数排序的任务集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortedSet {
    Schedule,
    Retry,
    Dead,
}

impl SortedSet {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortedSet::Schedule => "schedule",
            SortedSet::Retry => "retry",
            SortedSet::Dead => "dead",
        }
    }
}

impl fmt::Display for SortedSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SortedSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schedule" | "scheduled" => Ok(SortedSet::Schedule),
            "retry" | "retries" => Ok(SortedSet::Retry),
            "dead" | "morgue" => Ok(SortedSet::Dead),
            _ => Err(format!("unknown sorted set: {s}")),
        }
    }
}

/// 全局处理统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub processed: u64,
    pub failed: u64,
}

/// 共享队列存储
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// 连通性检查
    async fn ping(&self) -> ConveyorResult<()>;

    // ---- 队列 ----

    /// 登记队列名并把负载压入队列左端
    async fn push(&self, queue: &str, payloads: &[String]) -> ConveyorResult<()>;

    /// 已登记的队列名
    async fn queue_names(&self) -> ConveyorResult<Vec<String>>;

    async fn queue_size(&self, queue: &str) -> ConveyorResult<usize>;

    /// 按列表下标读取队列内容，下标0为最新入队的任务
    async fn queue_entries(&self, queue: &str, start: usize, stop: usize)
        -> ConveyorResult<Vec<String>>;

    /// 从队列删除一条与负载完全相同的记录
    async fn remove_from_queue(&self, queue: &str, payload: &str) -> ConveyorResult<bool>;

    /// 删除整个队列并注销队列名，返回被删除的任务数
    async fn clear_queue(&self, queue: &str) -> ConveyorResult<usize>;

    // ---- 可靠取任务 ----

    /// 原子地把队列右端的任务移入本进程的暂存列表
    async fn pop_and_stage(&self, queue: &str, identity: &str) -> ConveyorResult<Option<String>>;

    /// 与 `pop_and_stage` 相同，但队列为空时最多阻塞 `timeout`
    async fn blocking_pop_and_stage(
        &self,
        queue: &str,
        identity: &str,
        timeout: Duration,
    ) -> ConveyorResult<Option<String>>;

    /// 从暂存列表删除已处理完的任务
    async fn acknowledge(&self, identity: &str, queue: &str, payload: &str)
        -> ConveyorResult<bool>;

    /// 把暂存的任务原子地放回队列右端（下一个被取出）
    async fn requeue(&self, identity: &str, queue: &str, payload: &str) -> ConveyorResult<bool>;

    /// 所有暂存列表，返回 (进程标识, 队列名)
    async fn staging_lists(&self) -> ConveyorResult<Vec<(String, String)>>;

    /// 把暂存列表中的一条任务移回队列右端，列表为空时返回 `None`
    async fn restore_staged(&self, identity: &str, queue: &str) -> ConveyorResult<Option<String>>;

    // ---- 有序集合 ----

    async fn zadd(&self, set: SortedSet, score: f64, payload: &str) -> ConveyorResult<()>;

    /// 把分数不大于 `now` 的最多 `limit` 条记录迁回各自的队列，返回迁移数量
    async fn promote_due(&self, set: SortedSet, now: f64, limit: usize) -> ConveyorResult<usize>;

    /// 按分数升序读取，返回 (负载, 分数)
    async fn zrange(
        &self,
        set: SortedSet,
        start: usize,
        stop: usize,
    ) -> ConveyorResult<Vec<(String, f64)>>;

    async fn zcard(&self, set: SortedSet) -> ConveyorResult<usize>;

    async fn zrem(&self, set: SortedSet, payload: &str) -> ConveyorResult<bool>;

    /// 原子地把集合中的记录移入队列
    async fn move_to_queue(&self, set: SortedSet, payload: &str, queue: &str)
        -> ConveyorResult<bool>;

    async fn clear_set(&self, set: SortedSet) -> ConveyorResult<usize>;

    // ---- 失败处理 ----

    /// 原子地把暂存的任务移入重试集合，暂存中已不存在时返回 `false`
    async fn retry(
        &self,
        identity: &str,
        queue: &str,
        staged: &str,
        updated: &str,
        at: f64,
    ) -> ConveyorResult<bool>;

    /// 原子地把暂存的任务移入死信集合，并按时间与数量淘汰旧记录
    async fn kill(
        &self,
        identity: &str,
        queue: &str,
        staged: &str,
        updated: &str,
        now: f64,
        limits: &DeadSetConfig,
    ) -> ConveyorResult<bool>;

    // ---- 进程注册表 ----

    /// 写入心跳：注册进程、刷新状态与执行中任务，并设置过期时间
    async fn heartbeat(
        &self,
        identity: &str,
        info: &str,
        beat: &Heartbeat,
        work: &HashMap<String, WorkEntry>,
        ttl: Duration,
    ) -> ConveyorResult<()>;

    async fn deregister(&self, identity: &str) -> ConveyorResult<()>;

    /// 注册表中的进程标识（可能包含已过期的）
    async fn process_identities(&self) -> ConveyorResult<Vec<String>>;

    async fn process_alive(&self, identity: &str) -> ConveyorResult<bool>;

    async fn process_snapshot(&self, identity: &str) -> ConveyorResult<Option<ProcessSnapshot>>;

    async fn work_entries(&self, identity: &str) -> ConveyorResult<HashMap<String, WorkEntry>>;

    /// 清理已过期的进程标识，返回存活进程数
    async fn live_process_count(&self) -> ConveyorResult<usize> {
        let mut alive = 0;
        for identity in self.process_identities().await? {
            if self.process_alive(&identity).await? {
                alive += 1;
            } else {
                self.deregister(&identity).await?;
            }
        }
        Ok(alive)
    }

    async fn push_signal(&self, identity: &str, signal: &str) -> ConveyorResult<()>;

    /// 取出并清空待处理的远程信号，按发送顺序返回
    async fn pop_signals(&self, identity: &str) -> ConveyorResult<Vec<String>>;

    // ---- 统计 ----

    async fn incr_stats(&self, processed: u64, failed: u64, at: DateTime<Utc>)
        -> ConveyorResult<()>;

    async fn stats(&self) -> ConveyorResult<StoreStats>;
}
