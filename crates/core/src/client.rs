//! 任务提交客户端

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::{ConveyorError, ConveyorResult};
use crate::models::{now_epoch, BacktraceOption, JobRecord, RetryPolicy, DEFAULT_QUEUE};
use crate::traits::{QueueStore, SortedSet};

/// 提交任务的请求参数
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    pub class: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// 计划执行时间（Unix秒），晚于当前时间时进入定时集合
    #[serde(default)]
    pub at: Option<f64>,
    #[serde(default)]
    pub backtrace: Option<BacktraceOption>,
    #[serde(default)]
    pub dead: Option<bool>,
    /// 附加字段，随任务记录原样保存
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl JobRequest {
    pub fn new(class: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class: class.into(),
            args,
            ..Default::default()
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn at(mut self, at: f64) -> Self {
        self.at = Some(at);
        self
    }

    pub fn backtrace(mut self, backtrace: BacktraceOption) -> Self {
        self.backtrace = Some(backtrace);
        self
    }

    pub fn dead(mut self, dead: bool) -> Self {
        self.dead = Some(dead);
        self
    }

    fn validate(&self) -> ConveyorResult<()> {
        if self.class.trim().is_empty() {
            return Err(ConveyorError::InvalidJob("class cannot be empty".to_string()));
        }
        if let Some(queue) = &self.queue {
            if queue.trim().is_empty() || queue.contains(':') {
                return Err(ConveyorError::InvalidJob(format!(
                    "invalid queue name: {queue:?}"
                )));
            }
        }
        if let Some(at) = self.at {
            if !at.is_finite() {
                return Err(ConveyorError::InvalidJob("at must be a finite timestamp".to_string()));
            }
        }
        Ok(())
    }

    fn into_record(self) -> JobRecord {
        let mut job = JobRecord::new(self.class, self.args)
            .with_queue(self.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()))
            .with_retry(self.retry.unwrap_or_default());
        job.backtrace = self.backtrace;
        job.dead = self.dead;
        job.extra = self.extra;
        job
    }
}

/// 向共享存储提交任务
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn QueueStore>,
}

impl Client {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// 提交单个任务，返回任务ID
    pub async fn push(&self, request: JobRequest) -> ConveyorResult<String> {
        let mut jids = self.push_bulk(vec![request]).await?;
        jids.pop()
            .ok_or_else(|| ConveyorError::Internal("push produced no jid".to_string()))
    }

    /// 批量提交，同一队列的任务一次写入
    pub async fn push_bulk(&self, requests: Vec<JobRequest>) -> ConveyorResult<Vec<String>> {
        for request in &requests {
            request.validate()?;
        }

        let now = now_epoch();
        let mut jids = Vec::with_capacity(requests.len());
        let mut immediate: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut scheduled: Vec<(f64, String)> = Vec::new();

        for request in requests {
            let at = request.at;
            let mut job = request.into_record();
            jids.push(job.id.clone());
            match at {
                Some(at) if at > now => scheduled.push((at, job.to_json()?)),
                _ => {
                    job.enqueued_at = Some(now);
                    immediate
                        .entry(job.queue.clone())
                        .or_default()
                        .push(job.to_json()?);
                }
            }
        }

        for (queue, payloads) in immediate {
            debug!("入队 {} 个任务到队列 {}", payloads.len(), queue);
            self.store.push(&queue, &payloads).await?;
        }
        for (at, payload) in scheduled {
            self.store.zadd(SortedSet::Schedule, at, &payload).await?;
        }

        Ok(jids)
    }

    /// 在指定时间执行
    pub async fn schedule_at(&self, request: JobRequest, at: f64) -> ConveyorResult<String> {
        self.push(request.at(at)).await
    }

    /// 延迟一段时间后执行
    pub async fn schedule_in(&self, request: JobRequest, delay: Duration) -> ConveyorResult<String> {
        self.push(request.at(now_epoch() + delay.as_secs_f64())).await
    }
}
