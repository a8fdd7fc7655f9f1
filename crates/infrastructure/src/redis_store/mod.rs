//! 基于Redis的共享队列存储
//!
//! 普通命令走一条自动重连的多路复用连接（`ConnectionManager`），
//! 阻塞取任务走 [`connection::BlockingPool`] 中的专用连接。
//! 跨位置移动任务的操作全部由服务端脚本或 MULTI 事务完成。

mod connection;
mod scripts;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, RedisError, Script};
use tracing::{debug, info, warn};

use conveyor_core::config::{DeadSetConfig, RedisConfig};
use conveyor_core::models::{Heartbeat, ProcessInfo, ProcessSnapshot, WorkEntry};
use conveyor_core::{ConveyorError, ConveyorResult, KeySpace, QueueStore, SortedSet, StoreStats};

use connection::BlockingPool;

/// 每日统计键保留时间
const DAILY_STATS_TTL_SECONDS: i64 = 5 * 365 * 24 * 60 * 60;
/// 远程信号列表的过期时间
const SIGNALS_TTL_SECONDS: i64 = 60;
const SCAN_COUNT: usize = 100;

pub(crate) fn store_err(e: RedisError) -> ConveyorError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        ConveyorError::Connection(e.to_string())
    } else {
        ConveyorError::Store(e.to_string())
    }
}

pub struct RedisStore {
    conn: ConnectionManager,
    blocking: BlockingPool,
    keys: KeySpace,
    promote_script: Script,
    requeue_script: Script,
    retry_script: Script,
    kill_script: Script,
    move_to_queue_script: Script,
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig) -> ConveyorResult<Self> {
        let client = Client::open(config.build_url())
            .map_err(|e| ConveyorError::Configuration(format!("无效的Redis地址: {e}")))?;

        let connect_timeout = Duration::from_secs(config.connection_timeout_seconds.max(1));
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(connect_timeout)
            .set_response_timeout(Duration::from_secs(config.response_timeout_seconds.max(1)));
        let conn = tokio::time::timeout(
            connect_timeout,
            ConnectionManager::new_with_config(client.clone(), manager_config),
        )
        .await
        .map_err(|_| ConveyorError::Connection("连接Redis超时".to_string()))?
        .map_err(store_err)?;

        let store = Self {
            conn,
            blocking: BlockingPool::new(client, config.blocking_pool_size),
            keys: KeySpace::new(config.namespace.as_deref()),
            promote_script: Script::new(scripts::PROMOTE_DUE),
            requeue_script: Script::new(scripts::REQUEUE),
            retry_script: Script::new(scripts::RETRY),
            kill_script: Script::new(scripts::KILL),
            move_to_queue_script: Script::new(scripts::MOVE_TO_QUEUE),
        };
        store.ping().await?;
        info!(
            "已连接Redis: {}:{} (namespace={:?})",
            config.host, config.port, config.namespace
        );
        Ok(store)
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    fn set_key(&self, set: SortedSet) -> String {
        match set {
            SortedSet::Schedule => self.keys.schedule(),
            SortedSet::Retry => self.keys.retry(),
            SortedSet::Dead => self.keys.dead(),
        }
    }

    async fn scan(&self, pattern: &str) -> ConveyorResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        found.sort();
        found.dedup();
        Ok(found)
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn ping(&self) -> ConveyorResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        if pong != "PONG" {
            return Err(ConveyorError::Store(format!("unexpected PING response: {pong}")));
        }
        Ok(())
    }

    async fn push(&self, queue: &str, payloads: &[String]) -> ConveyorResult<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(self.keys.queues())
            .arg(queue)
            .ignore()
            .cmd("LPUSH")
            .arg(self.keys.queue(queue))
            .arg(payloads)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn queue_names(&self) -> ConveyorResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(self.keys.queues()).await.map_err(store_err)
    }

    async fn queue_size(&self, queue: &str) -> ConveyorResult<usize> {
        let mut conn = self.conn.clone();
        conn.llen(self.keys.queue(queue)).await.map_err(store_err)
    }

    async fn queue_entries(
        &self,
        queue: &str,
        start: usize,
        stop: usize,
    ) -> ConveyorResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.lrange(self.keys.queue(queue), start as isize, stop as isize)
            .await
            .map_err(store_err)
    }

    async fn remove_from_queue(&self, queue: &str, payload: &str) -> ConveyorResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .lrem(self.keys.queue(queue), 1, payload)
            .await
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn clear_queue(&self, queue: &str) -> ConveyorResult<usize> {
        let mut conn = self.conn.clone();
        let key = self.keys.queue(queue);
        let (size,): (usize,) = redis::pipe()
            .atomic()
            .cmd("LLEN")
            .arg(&key)
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .cmd("SREM")
            .arg(self.keys.queues())
            .arg(queue)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(size)
    }

    async fn pop_and_stage(&self, queue: &str, identity: &str) -> ConveyorResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("LMOVE")
            .arg(self.keys.queue(queue))
            .arg(self.keys.staging(identity, queue))
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn blocking_pop_and_stage(
        &self,
        queue: &str,
        identity: &str,
        timeout: Duration,
    ) -> ConveyorResult<Option<String>> {
        // BLMOVE 的超时为0表示永久阻塞
        let seconds = timeout.as_secs_f64().max(0.01);
        let mut pooled = self.blocking.checkout().await?;
        let mut cmd = redis::cmd("BLMOVE");
        cmd.arg(self.keys.queue(queue))
            .arg(self.keys.staging(identity, queue))
            .arg("RIGHT")
            .arg("LEFT")
            .arg(seconds);

        let guard = timeout + Duration::from_secs(1);
        let result =
            tokio::time::timeout(guard, cmd.query_async::<Option<String>>(pooled.conn())).await;
        match result {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(e)) => {
                pooled.discard();
                Err(store_err(e))
            }
            Err(_) => {
                pooled.discard();
                Err(ConveyorError::Connection("BLMOVE 响应超时".to_string()))
            }
        }
    }

    async fn acknowledge(
        &self,
        identity: &str,
        queue: &str,
        payload: &str,
    ) -> ConveyorResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .lrem(self.keys.staging(identity, queue), 1, payload)
            .await
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn requeue(&self, identity: &str, queue: &str, payload: &str) -> ConveyorResult<bool> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .requeue_script
            .key(self.keys.staging(identity, queue))
            .key(self.keys.queue(queue))
            .arg(payload)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(moved == 1)
    }

    async fn staging_lists(&self) -> ConveyorResult<Vec<(String, String)>> {
        let keys = self.scan(&self.keys.staging_pattern()).await?;
        Ok(keys
            .iter()
            .filter_map(|key| self.keys.parse_staging(key))
            .collect())
    }

    async fn restore_staged(&self, identity: &str, queue: &str) -> ConveyorResult<Option<String>> {
        let mut conn = self.conn.clone();
        let restored: Option<String> = redis::cmd("LMOVE")
            .arg(self.keys.staging(identity, queue))
            .arg(self.keys.queue(queue))
            .arg("RIGHT")
            .arg("RIGHT")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        if restored.is_some() {
            let _: i64 = conn
                .sadd(self.keys.queues(), queue)
                .await
                .map_err(store_err)?;
        }
        Ok(restored)
    }

    async fn zadd(&self, set: SortedSet, score: f64, payload: &str) -> ConveyorResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zadd(self.set_key(set), payload, score)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn promote_due(&self, set: SortedSet, now: f64, limit: usize) -> ConveyorResult<usize> {
        let mut conn = self.conn.clone();
        let moved: usize = self
            .promote_script
            .key(self.set_key(set))
            .key(self.keys.queues())
            .key(self.keys.dead())
            .arg(now)
            .arg(limit)
            .arg(self.keys.queue(""))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        if moved > 0 {
            debug!("从 {} 迁移了 {} 个到期任务", set, moved);
        }
        Ok(moved)
    }

    async fn zrange(
        &self,
        set: SortedSet,
        start: usize,
        stop: usize,
    ) -> ConveyorResult<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        conn.zrange_withscores(self.set_key(set), start as isize, stop as isize)
            .await
            .map_err(store_err)
    }

    async fn zcard(&self, set: SortedSet) -> ConveyorResult<usize> {
        let mut conn = self.conn.clone();
        conn.zcard(self.set_key(set)).await.map_err(store_err)
    }

    async fn zrem(&self, set: SortedSet, payload: &str) -> ConveyorResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .zrem(self.set_key(set), payload)
            .await
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn move_to_queue(
        &self,
        set: SortedSet,
        payload: &str,
        queue: &str,
    ) -> ConveyorResult<bool> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .move_to_queue_script
            .key(self.set_key(set))
            .key(self.keys.queues())
            .key(self.keys.queue(queue))
            .arg(payload)
            .arg(queue)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(moved == 1)
    }

    async fn clear_set(&self, set: SortedSet) -> ConveyorResult<usize> {
        let mut conn = self.conn.clone();
        let key = self.set_key(set);
        let (size,): (usize,) = redis::pipe()
            .atomic()
            .cmd("ZCARD")
            .arg(&key)
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(size)
    }

    async fn retry(
        &self,
        identity: &str,
        queue: &str,
        staged: &str,
        updated: &str,
        at: f64,
    ) -> ConveyorResult<bool> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .retry_script
            .key(self.keys.staging(identity, queue))
            .key(self.keys.retry())
            .arg(staged)
            .arg(updated)
            .arg(at)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(moved == 1)
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
        let mut conn = self.conn.clone();
        let cutoff = now - limits.timeout_seconds as f64;
        let moved: i64 = self
            .kill_script
            .key(self.keys.staging(identity, queue))
            .key(self.keys.dead())
            .arg(staged)
            .arg(updated)
            .arg(now)
            .arg(cutoff)
            .arg(limits.max_jobs)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(moved == 1)
    }

    async fn heartbeat(
        &self,
        identity: &str,
        info: &str,
        beat: &Heartbeat,
        work: &HashMap<String, WorkEntry>,
        ttl: Duration,
    ) -> ConveyorResult<()> {
        let mut conn = self.conn.clone();
        let ttl_seconds = ttl.as_secs().max(1) as i64;
        let process_key = self.keys.process(identity);
        let work_key = self.keys.work(identity);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SADD")
            .arg(self.keys.processes())
            .arg(identity)
            .ignore()
            .cmd("HSET")
            .arg(&process_key)
            .arg("info")
            .arg(info)
            .arg("busy")
            .arg(beat.busy)
            .arg("beat")
            .arg(beat.beat)
            .arg("quiet")
            .arg(beat.quiet.to_string())
            .ignore()
            .cmd("EXPIRE")
            .arg(&process_key)
            .arg(ttl_seconds)
            .ignore()
            .cmd("DEL")
            .arg(&work_key)
            .ignore();

        if !work.is_empty() {
            let mut fields = Vec::with_capacity(work.len());
            for (slot, entry) in work {
                fields.push((slot.clone(), serde_json::to_string(entry)?));
            }
            pipe.cmd("HSET")
                .arg(&work_key)
                .arg(fields)
                .ignore()
                .cmd("EXPIRE")
                .arg(&work_key)
                .arg(ttl_seconds)
                .ignore();
        }

        pipe.query_async::<()>(&mut conn).await.map_err(store_err)
    }

    async fn deregister(&self, identity: &str) -> ConveyorResult<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("SREM")
            .arg(self.keys.processes())
            .arg(identity)
            .ignore()
            .cmd("DEL")
            .arg(self.keys.process(identity))
            .arg(self.keys.work(identity))
            .arg(self.keys.signals(identity))
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn process_identities(&self) -> ConveyorResult<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(self.keys.processes()).await.map_err(store_err)
    }

    async fn process_alive(&self, identity: &str) -> ConveyorResult<bool> {
        let mut conn = self.conn.clone();
        conn.exists(self.keys.process(identity))
            .await
            .map_err(store_err)
    }

    async fn process_snapshot(&self, identity: &str) -> ConveyorResult<Option<ProcessSnapshot>> {
        let mut conn = self.conn.clone();
        let (info, busy, beat, quiet): (Option<String>, Option<usize>, Option<f64>, Option<String>) =
            redis::cmd("HMGET")
                .arg(self.keys.process(identity))
                .arg("info")
                .arg("busy")
                .arg("beat")
                .arg("quiet")
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;

        let Some(info) = info else {
            return Ok(None);
        };
        let info: ProcessInfo = serde_json::from_str(&info)?;
        Ok(Some(ProcessSnapshot {
            info,
            busy: busy.unwrap_or(0),
            beat: beat.unwrap_or(0.0),
            quiet: quiet.as_deref() == Some("true"),
        }))
    }

    async fn work_entries(&self, identity: &str) -> ConveyorResult<HashMap<String, WorkEntry>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn
            .hgetall(self.keys.work(identity))
            .await
            .map_err(store_err)?;
        let mut entries = HashMap::with_capacity(raw.len());
        for (slot, value) in raw {
            match serde_json::from_str::<WorkEntry>(&value) {
                Ok(entry) => {
                    entries.insert(slot, entry);
                }
                Err(e) => warn!("无法解析进程 {} 的执行记录 {}: {}", identity, slot, e),
            }
        }
        Ok(entries)
    }

    async fn push_signal(&self, identity: &str, signal: &str) -> ConveyorResult<()> {
        let mut conn = self.conn.clone();
        let key = self.keys.signals(identity);
        redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(&key)
            .arg(signal)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(SIGNALS_TTL_SECONDS)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)
    }

    async fn pop_signals(&self, identity: &str) -> ConveyorResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let key = self.keys.signals(identity);
        let (mut signals,): (Vec<String>,) = redis::pipe()
            .atomic()
            .cmd("LRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        // LPUSH 写入，最新的在最前
        signals.reverse();
        Ok(signals)
    }

    async fn incr_stats(
        &self,
        processed: u64,
        failed: u64,
        at: DateTime<Utc>,
    ) -> ConveyorResult<()> {
        if processed == 0 && failed == 0 {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (name, count) in [("processed", processed), ("failed", failed)] {
            if count == 0 {
                continue;
            }
            let daily = self.keys.stat_daily(name, at);
            pipe.cmd("INCRBY")
                .arg(self.keys.stat(name))
                .arg(count)
                .ignore()
                .cmd("INCRBY")
                .arg(&daily)
                .arg(count)
                .ignore()
                .cmd("EXPIRE")
                .arg(&daily)
                .arg(DAILY_STATS_TTL_SECONDS)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(store_err)
    }

    async fn stats(&self) -> ConveyorResult<StoreStats> {
        let mut conn = self.conn.clone();
        let (processed, failed): (Option<u64>, Option<u64>) = redis::cmd("MGET")
            .arg(self.keys.stat("processed"))
            .arg(self.keys.stat("failed"))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(StoreStats {
            processed: processed.unwrap_or(0),
            failed: failed.unwrap_or(0),
        })
    }
}
