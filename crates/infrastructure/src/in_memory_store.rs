//! 内存版共享队列存储
//!
//! 实现与 Redis 版相同的语义（列表方向、有序集合排序、过期时间、原子移动），
//! 用于单进程嵌入式部署和测试。所有状态由一把互斥锁保护，锁不会跨越 await。

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use serde_json::Value;
use tracing::debug;

use conveyor_core::config::DeadSetConfig;
use conveyor_core::models::{
    Heartbeat, ProcessInfo, ProcessSnapshot, WorkEntry, DEFAULT_QUEUE,
};
use conveyor_core::{ConveyorError, ConveyorResult, QueueStore, SortedSet, StoreStats};

#[derive(Debug)]
struct ProcessRecord {
    info: String,
    busy: usize,
    beat: f64,
    quiet: bool,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, VecDeque<String>>,
    queue_names: BTreeSet<String>,
    staging: HashMap<(String, String), VecDeque<String>>,
    sets: HashMap<SortedSet, Vec<(f64, String)>>,
    processes: BTreeSet<String>,
    process_records: HashMap<String, ProcessRecord>,
    work: HashMap<String, HashMap<String, WorkEntry>>,
    signals: HashMap<String, VecDeque<String>>,
    processed: u64,
    failed: u64,
    daily: HashMap<String, u64>,
}

impl State {
    fn set_mut(&mut self, set: SortedSet) -> &mut Vec<(f64, String)> {
        self.sets.entry(set).or_default()
    }

    /// 与 Redis 一致：按分数排序，分数相同按成员字典序；成员已存在时更新分数
    fn zadd(&mut self, set: SortedSet, score: f64, payload: &str) {
        let entries = self.set_mut(set);
        entries.retain(|(_, member)| member != payload);
        let position = entries
            .iter()
            .position(|(s, m)| *s > score || (*s == score && m.as_str() > payload))
            .unwrap_or(entries.len());
        entries.insert(position, (score, payload.to_string()));
    }

    fn zrem(&mut self, set: SortedSet, payload: &str) -> bool {
        let entries = self.set_mut(set);
        let before = entries.len();
        entries.retain(|(_, member)| member != payload);
        entries.len() != before
    }

    fn lpush(&mut self, queue: &str, payload: String) {
        self.queue_names.insert(queue.to_string());
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_front(payload);
    }

    fn remove_staged(&mut self, identity: &str, queue: &str, payload: &str) -> bool {
        let key = (identity.to_string(), queue.to_string());
        let Some(list) = self.staging.get_mut(&key) else {
            return false;
        };
        let Some(position) = list.iter().position(|p| p == payload) else {
            return false;
        };
        list.remove(position);
        if list.is_empty() {
            self.staging.remove(&key);
        }
        true
    }

    fn process_live(&self, identity: &str, now: Instant) -> bool {
        self.process_records
            .get(identity)
            .is_some_and(|r| r.expires_at > now)
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .process_records
            .iter()
            .filter(|(_, r)| r.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for identity in expired {
            self.process_records.remove(&identity);
            self.work.remove(&identity);
        }
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    pushed: Notify,
    failures: Mutex<HashSet<String>>,
    stalls: Mutex<HashSet<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 让指定操作返回连接错误，`"*"` 表示全部操作
    pub fn inject_failure(&self, operation: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn check(&self, operation: &str) -> ConveyorResult<()> {
        let failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if failures.contains("*") || failures.contains(operation) {
            return Err(ConveyorError::Connection(format!(
                "injected failure: {operation}"
            )));
        }
        Ok(())
    }

    /// 让指定操作永远挂起，模拟不再响应的存储
    pub fn inject_stall(&self, operation: &str) {
        self.stalls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(operation.to_string());
    }

    async fn stall_point(&self, operation: &str) {
        let stalled = self
            .stalls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(operation);
        if stalled {
            std::future::pending::<()>().await;
        }
    }

    /// 立即让进程的注册表条目过期，模拟进程崩溃
    pub fn expire_process(&self, identity: &str) {
        let mut state = self.lock();
        state.process_records.remove(identity);
        state.work.remove(identity);
    }

    /// 暂存列表内容，最新暂存的在前
    pub fn staged(&self, identity: &str, queue: &str) -> Vec<String> {
        self.lock()
            .staging
            .get(&(identity.to_string(), queue.to_string()))
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn staged_total(&self) -> usize {
        self.lock().staging.values().map(VecDeque::len).sum()
    }

    /// 直接写入暂存列表，模拟已取出但未处理完的任务
    pub fn stage(&self, identity: &str, queue: &str, payload: &str) {
        self.lock()
            .staging
            .entry((identity.to_string(), queue.to_string()))
            .or_default()
            .push_front(payload.to_string());
    }

    pub fn daily_stat(&self, name: &str, at: DateTime<Utc>) -> u64 {
        let key = format!("{name}:{}", at.format("%Y-%m-%d"));
        self.lock().daily.get(&key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn ping(&self) -> ConveyorResult<()> {
        self.check("ping")
    }

    async fn push(&self, queue: &str, payloads: &[String]) -> ConveyorResult<()> {
        self.check("push")?;
        {
            let mut state = self.lock();
            for payload in payloads {
                state.lpush(queue, payload.clone());
            }
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn queue_names(&self) -> ConveyorResult<Vec<String>> {
        self.check("queue_names")?;
        Ok(self.lock().queue_names.iter().cloned().collect())
    }

    async fn queue_size(&self, queue: &str) -> ConveyorResult<usize> {
        self.check("queue_size")?;
        Ok(self.lock().queues.get(queue).map_or(0, VecDeque::len))
    }

    async fn queue_entries(
        &self,
        queue: &str,
        start: usize,
        stop: usize,
    ) -> ConveyorResult<Vec<String>> {
        self.check("queue_entries")?;
        let state = self.lock();
        Ok(state
            .queues
            .get(queue)
            .map(|list| {
                list.iter()
                    .skip(start)
                    .take(stop.saturating_sub(start).saturating_add(1))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove_from_queue(&self, queue: &str, payload: &str) -> ConveyorResult<bool> {
        self.check("remove_from_queue")?;
        let mut state = self.lock();
        let Some(list) = state.queues.get_mut(queue) else {
            return Ok(false);
        };
        match list.iter().position(|p| p == payload) {
            Some(position) => {
                list.remove(position);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear_queue(&self, queue: &str) -> ConveyorResult<usize> {
        self.check("clear_queue")?;
        let mut state = self.lock();
        state.queue_names.remove(queue);
        Ok(state.queues.remove(queue).map_or(0, |l| l.len()))
    }

    async fn pop_and_stage(&self, queue: &str, identity: &str) -> ConveyorResult<Option<String>> {
        self.check("pop_and_stage")?;
        let mut state = self.lock();
        let Some(payload) = state.queues.get_mut(queue).and_then(VecDeque::pop_back) else {
            return Ok(None);
        };
        state
            .staging
            .entry((identity.to_string(), queue.to_string()))
            .or_default()
            .push_front(payload.clone());
        Ok(Some(payload))
    }

    async fn blocking_pop_and_stage(
        &self,
        queue: &str,
        identity: &str,
        timeout: Duration,
    ) -> ConveyorResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            // 先注册等待再检查队列，避免错过检查与等待之间的入队通知
            let notified = self.pushed.notified();
            if let Some(payload) = self.pop_and_stage(queue, identity).await? {
                return Ok(Some(payload));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn acknowledge(
        &self,
        identity: &str,
        queue: &str,
        payload: &str,
    ) -> ConveyorResult<bool> {
        self.check("acknowledge")?;
        Ok(self.lock().remove_staged(identity, queue, payload))
    }

    async fn requeue(&self, identity: &str, queue: &str, payload: &str) -> ConveyorResult<bool> {
        self.check("requeue")?;
        let moved = {
            let mut state = self.lock();
            if state.remove_staged(identity, queue, payload) {
                state.queue_names.insert(queue.to_string());
                state
                    .queues
                    .entry(queue.to_string())
                    .or_default()
                    .push_back(payload.to_string());
                true
            } else {
                false
            }
        };
        if moved {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn staging_lists(&self) -> ConveyorResult<Vec<(String, String)>> {
        self.check("staging_lists")?;
        let mut lists: Vec<(String, String)> = self.lock().staging.keys().cloned().collect();
        lists.sort();
        Ok(lists)
    }

    async fn restore_staged(&self, identity: &str, queue: &str) -> ConveyorResult<Option<String>> {
        self.check("restore_staged")?;
        let restored = {
            let mut state = self.lock();
            let key = (identity.to_string(), queue.to_string());
            let payload = state.staging.get_mut(&key).and_then(VecDeque::pop_back);
            if state.staging.get(&key).is_some_and(VecDeque::is_empty) {
                state.staging.remove(&key);
            }
            if let Some(payload) = &payload {
                state.queue_names.insert(queue.to_string());
                state
                    .queues
                    .entry(queue.to_string())
                    .or_default()
                    .push_back(payload.clone());
            }
            payload
        };
        if restored.is_some() {
            self.pushed.notify_waiters();
        }
        Ok(restored)
    }

    async fn zadd(&self, set: SortedSet, score: f64, payload: &str) -> ConveyorResult<()> {
        self.check("zadd")?;
        self.lock().zadd(set, score, payload);
        Ok(())
    }

    async fn promote_due(&self, set: SortedSet, now: f64, limit: usize) -> ConveyorResult<usize> {
        self.check("promote_due")?;
        let moved = {
            let mut state = self.lock();
            let due: Vec<String> = state
                .set_mut(set)
                .iter()
                .take_while(|(score, _)| *score <= now)
                .take(limit)
                .map(|(_, member)| member.clone())
                .collect();

            let mut moved = 0;
            for payload in due {
                if !state.zrem(set, &payload) {
                    continue;
                }
                match promote_target(&payload) {
                    Some(queue) => {
                        state.lpush(&queue, payload);
                        moved += 1;
                    }
                    None => state.zadd(SortedSet::Dead, now, &payload),
                }
            }
            moved
        };
        if moved > 0 {
            debug!("从 {} 迁移了 {} 个到期任务", set, moved);
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn zrange(
        &self,
        set: SortedSet,
        start: usize,
        stop: usize,
    ) -> ConveyorResult<Vec<(String, f64)>> {
        self.check("zrange")?;
        let mut state = self.lock();
        Ok(state
            .set_mut(set)
            .iter()
            .skip(start)
            .take(stop.saturating_sub(start).saturating_add(1))
            .map(|(score, member)| (member.clone(), *score))
            .collect())
    }

    async fn zcard(&self, set: SortedSet) -> ConveyorResult<usize> {
        self.check("zcard")?;
        Ok(self.lock().set_mut(set).len())
    }

    async fn zrem(&self, set: SortedSet, payload: &str) -> ConveyorResult<bool> {
        self.check("zrem")?;
        Ok(self.lock().zrem(set, payload))
    }

    async fn move_to_queue(
        &self,
        set: SortedSet,
        payload: &str,
        queue: &str,
    ) -> ConveyorResult<bool> {
        self.check("move_to_queue")?;
        let moved = {
            let mut state = self.lock();
            if state.zrem(set, payload) {
                state.lpush(queue, payload.to_string());
                true
            } else {
                false
            }
        };
        if moved {
            self.pushed.notify_waiters();
        }
        Ok(moved)
    }

    async fn clear_set(&self, set: SortedSet) -> ConveyorResult<usize> {
        self.check("clear_set")?;
        Ok(self.lock().sets.remove(&set).map_or(0, |entries| entries.len()))
    }

    async fn retry(
        &self,
        identity: &str,
        queue: &str,
        staged: &str,
        updated: &str,
        at: f64,
    ) -> ConveyorResult<bool> {
        self.check("retry")?;
        let mut state = self.lock();
        if !state.remove_staged(identity, queue, staged) {
            return Ok(false);
        }
        state.zadd(SortedSet::Retry, at, updated);
        Ok(true)
    }

    async fn kill(
        &self,
        identity: &str,
        queue: &str,
        staged: &str,
        updated: &str,
        now: f64,
        limits: &DeadSetConfig,
    ) -> ConveyorResult<bool> {
        self.check("kill")?;
        let mut state = self.lock();
        if !state.remove_staged(identity, queue, staged) {
            return Ok(false);
        }
        state.zadd(SortedSet::Dead, now, updated);

        let cutoff = now - limits.timeout_seconds as f64;
        let dead = state.set_mut(SortedSet::Dead);
        dead.retain(|(score, _)| *score >= cutoff);
        if dead.len() > limits.max_jobs {
            let excess = dead.len() - limits.max_jobs;
            dead.drain(..excess);
        }
        Ok(true)
    }

    async fn heartbeat(
        &self,
        identity: &str,
        info: &str,
        beat: &Heartbeat,
        work: &HashMap<String, WorkEntry>,
        ttl: Duration,
    ) -> ConveyorResult<()> {
        self.check("heartbeat")?;
        self.stall_point("heartbeat").await;
        let mut state = self.lock();
        state.processes.insert(identity.to_string());
        state.process_records.insert(
            identity.to_string(),
            ProcessRecord {
                info: info.to_string(),
                busy: beat.busy,
                beat: beat.beat,
                quiet: beat.quiet,
                expires_at: Instant::now() + ttl,
            },
        );
        if work.is_empty() {
            state.work.remove(identity);
        } else {
            state.work.insert(identity.to_string(), work.clone());
        }
        Ok(())
    }

    async fn deregister(&self, identity: &str) -> ConveyorResult<()> {
        self.check("deregister")?;
        let mut state = self.lock();
        state.processes.remove(identity);
        state.process_records.remove(identity);
        state.work.remove(identity);
        state.signals.remove(identity);
        Ok(())
    }

    async fn process_identities(&self) -> ConveyorResult<Vec<String>> {
        self.check("process_identities")?;
        Ok(self.lock().processes.iter().cloned().collect())
    }

    async fn process_alive(&self, identity: &str) -> ConveyorResult<bool> {
        self.check("process_alive")?;
        Ok(self.lock().process_live(identity, Instant::now()))
    }

    async fn process_snapshot(&self, identity: &str) -> ConveyorResult<Option<ProcessSnapshot>> {
        self.check("process_snapshot")?;
        let mut state = self.lock();
        state.purge_expired(Instant::now());
        let Some(record) = state.process_records.get(identity) else {
            return Ok(None);
        };
        let info: ProcessInfo = serde_json::from_str(&record.info)?;
        Ok(Some(ProcessSnapshot {
            info,
            busy: record.busy,
            beat: record.beat,
            quiet: record.quiet,
        }))
    }

    async fn work_entries(&self, identity: &str) -> ConveyorResult<HashMap<String, WorkEntry>> {
        self.check("work_entries")?;
        let mut state = self.lock();
        state.purge_expired(Instant::now());
        Ok(state.work.get(identity).cloned().unwrap_or_default())
    }

    async fn push_signal(&self, identity: &str, signal: &str) -> ConveyorResult<()> {
        self.check("push_signal")?;
        self.lock()
            .signals
            .entry(identity.to_string())
            .or_default()
            .push_back(signal.to_string());
        Ok(())
    }

    async fn pop_signals(&self, identity: &str) -> ConveyorResult<Vec<String>> {
        self.check("pop_signals")?;
        Ok(self
            .lock()
            .signals
            .remove(identity)
            .map(Vec::from)
            .unwrap_or_default())
    }

    async fn incr_stats(
        &self,
        processed: u64,
        failed: u64,
        at: DateTime<Utc>,
    ) -> ConveyorResult<()> {
        self.check("incr_stats")?;
        let mut state = self.lock();
        state.processed += processed;
        state.failed += failed;
        let day = at.format("%Y-%m-%d");
        *state.daily.entry(format!("processed:{day}")).or_default() += processed;
        *state.daily.entry(format!("failed:{day}")).or_default() += failed;
        Ok(())
    }

    async fn stats(&self) -> ConveyorResult<StoreStats> {
        self.check("stats")?;
        let state = self.lock();
        Ok(StoreStats {
            processed: state.processed,
            failed: state.failed,
        })
    }
}

/// 与 Redis 迁移脚本的规则一致：JSON 对象或数组都算可迁移，
/// `queue` 不是非空字符串时进入 `default`，其他负载返回 `None`
fn promote_target(payload: &str) -> Option<String> {
    match serde_json::from_str::<Value>(payload).ok()? {
        Value::Object(map) => Some(
            map.get("queue")
                .and_then(Value::as_str)
                .filter(|q| !q.is_empty())
                .unwrap_or(DEFAULT_QUEUE)
                .to_string(),
        ),
        Value::Array(_) => Some(DEFAULT_QUEUE.to_string()),
        _ => None,
    }
}
