//! 运行状态查询与管理操作
//!
//! 读取队列、有序集合和进程注册表；管理操作（按ID删除、立即重试、清空、
//! 远程静默/停止）全部通过存储的原子操作完成。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::errors::{ConveyorError, ConveyorResult};
use crate::models::{JobLocator, ProcessSignal, ProcessSnapshot};
use crate::traits::{QueueStore, SortedSet};

const SCAN_CHUNK: usize = 100;

/// 任务所在位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum JobLocation {
    Queue(String),
    Set(SortedSet),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub name: String,
    pub size: usize,
}

/// 列表中的一条任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntry {
    pub jid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// 解析后的任务记录，无法解析时为原始字符串
    pub payload: Value,
    #[serde(skip)]
    pub raw: String,
}

impl JobEntry {
    fn new(raw: String, score: Option<f64>) -> Self {
        let jid = JobLocator::parse(&raw)
            .map(|l| l.id)
            .filter(|id| !id.is_empty());
        let payload = serde_json::from_str(&raw).unwrap_or_else(|_| Value::String(raw.clone()));
        Self {
            jid,
            score,
            payload,
            raw,
        }
    }
}

/// 全局概览
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub processed: u64,
    pub failed: u64,
    pub enqueued: usize,
    pub scheduled: usize,
    pub retries: usize,
    pub dead: usize,
    pub processes: usize,
    pub busy: usize,
}

#[derive(Clone)]
pub struct Inspector {
    store: Arc<dyn QueueStore>,
}

impl Inspector {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    pub async fn queues(&self) -> ConveyorResult<Vec<QueueSummary>> {
        let mut names = self.store.queue_names().await?;
        names.sort();
        let mut summaries = Vec::with_capacity(names.len());
        for name in names {
            let size = self.store.queue_size(&name).await?;
            summaries.push(QueueSummary { name, size });
        }
        Ok(summaries)
    }

    /// 分页读取队列，`page` 从1开始，最新入队的在前
    pub async fn queue_jobs(
        &self,
        queue: &str,
        page: usize,
        per_page: usize,
    ) -> ConveyorResult<Vec<JobEntry>> {
        let (start, stop) = page_bounds(page, per_page)?;
        let raw = self.store.queue_entries(queue, start, stop).await?;
        Ok(raw.into_iter().map(|r| JobEntry::new(r, None)).collect())
    }

    /// 分页读取有序集合，按分数升序
    pub async fn set_jobs(
        &self,
        set: SortedSet,
        page: usize,
        per_page: usize,
    ) -> ConveyorResult<Vec<JobEntry>> {
        let (start, stop) = page_bounds(page, per_page)?;
        let raw = self.store.zrange(set, start, stop).await?;
        Ok(raw
            .into_iter()
            .map(|(r, score)| JobEntry::new(r, Some(score)))
            .collect())
    }

    pub async fn set_size(&self, set: SortedSet) -> ConveyorResult<usize> {
        self.store.zcard(set).await
    }

    /// 按任务ID查找
    pub async fn find_job(&self, location: &JobLocation, jid: &str) -> ConveyorResult<Option<JobEntry>> {
        let mut start = 0;
        loop {
            let stop = start + SCAN_CHUNK - 1;
            let chunk: Vec<JobEntry> = match location {
                JobLocation::Queue(queue) => self
                    .store
                    .queue_entries(queue, start, stop)
                    .await?
                    .into_iter()
                    .map(|r| JobEntry::new(r, None))
                    .collect(),
                JobLocation::Set(set) => self
                    .store
                    .zrange(*set, start, stop)
                    .await?
                    .into_iter()
                    .map(|(r, score)| JobEntry::new(r, Some(score)))
                    .collect(),
            };
            let exhausted = chunk.len() < SCAN_CHUNK;
            if let Some(entry) = chunk.into_iter().find(|e| e.jid.as_deref() == Some(jid)) {
                return Ok(Some(entry));
            }
            if exhausted {
                return Ok(None);
            }
            start += SCAN_CHUNK;
        }
    }

    /// 删除尚未出队的任务
    pub async fn delete_job(&self, location: &JobLocation, jid: &str) -> ConveyorResult<bool> {
        let Some(entry) = self.find_job(location, jid).await? else {
            return Ok(false);
        };
        let removed = match location {
            JobLocation::Queue(queue) => self.store.remove_from_queue(queue, &entry.raw).await?,
            JobLocation::Set(set) => self.store.zrem(*set, &entry.raw).await?,
        };
        if removed {
            info!("已删除任务 {} ({:?})", jid, location);
        }
        Ok(removed)
    }

    /// 立即把定时、重试或死信中的任务放回队列
    pub async fn retry_now(&self, set: SortedSet, jid: &str) -> ConveyorResult<bool> {
        let location = JobLocation::Set(set);
        let entry = self
            .find_job(&location, jid)
            .await?
            .ok_or_else(|| ConveyorError::JobNotFound {
                jid: jid.to_string(),
            })?;
        let queue = JobLocator::parse(&entry.raw)
            .map(|l| l.queue)
            .ok_or_else(|| ConveyorError::MalformedJob(format!("cannot locate queue of {jid}")))?;
        let moved = self.store.move_to_queue(set, &entry.raw, &queue).await?;
        if moved {
            info!("任务 {} 已从 {} 移回队列 {}", jid, set, queue);
        }
        Ok(moved)
    }

    pub async fn clear_queue(&self, queue: &str) -> ConveyorResult<usize> {
        let removed = self.store.clear_queue(queue).await?;
        info!("已清空队列 {}，删除 {} 个任务", queue, removed);
        Ok(removed)
    }

    pub async fn clear_set(&self, set: SortedSet) -> ConveyorResult<usize> {
        let removed = self.store.clear_set(set).await?;
        info!("已清空 {}，删除 {} 个任务", set, removed);
        Ok(removed)
    }

    /// 存活的进程
    pub async fn processes(&self) -> ConveyorResult<Vec<ProcessSnapshot>> {
        let mut identities = self.store.process_identities().await?;
        identities.sort();
        let mut snapshots = Vec::new();
        for identity in identities {
            if let Some(snapshot) = self.store.process_snapshot(&identity).await? {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    /// 向进程发送远程信号，进程不存在时返回 `false`
    pub async fn signal_process(&self, identity: &str, signal: ProcessSignal) -> ConveyorResult<bool> {
        if !self.store.process_alive(identity).await? {
            return Ok(false);
        }
        self.store.push_signal(identity, signal.as_str()).await?;
        info!("已向进程 {} 发送信号 {}", identity, signal.as_str());
        Ok(true)
    }

    pub async fn quiet_process(&self, identity: &str) -> ConveyorResult<bool> {
        self.signal_process(identity, ProcessSignal::Quiet).await
    }

    pub async fn stop_process(&self, identity: &str) -> ConveyorResult<bool> {
        self.signal_process(identity, ProcessSignal::Stop).await
    }

    pub async fn overview(&self) -> ConveyorResult<Overview> {
        let stats = self.store.stats().await?;
        let enqueued = self.queues().await?.iter().map(|q| q.size).sum();
        let processes = self.processes().await?;
        Ok(Overview {
            processed: stats.processed,
            failed: stats.failed,
            enqueued,
            scheduled: self.store.zcard(SortedSet::Schedule).await?,
            retries: self.store.zcard(SortedSet::Retry).await?,
            dead: self.store.zcard(SortedSet::Dead).await?,
            busy: processes.iter().map(|p| p.busy).sum(),
            processes: processes.len(),
        })
    }
}

fn page_bounds(page: usize, per_page: usize) -> ConveyorResult<(usize, usize)> {
    if page == 0 || per_page == 0 {
        return Err(ConveyorError::InvalidJob(
            "page and per_page must be greater than 0".to_string(),
        ));
    }
    (page - 1)
        .checked_mul(per_page)
        .and_then(|start| start.checked_add(per_page - 1).map(|stop| (start, stop)))
        // 存储的区间下标是有符号整数
        .filter(|(_, stop)| *stop <= isize::MAX as usize)
        .ok_or_else(|| {
            ConveyorError::InvalidJob(format!(
                "page {page} with per_page {per_page} is out of range"
            ))
        })
}
