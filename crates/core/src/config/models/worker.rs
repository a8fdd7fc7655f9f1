use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::errors::{ConveyorError, ConveyorResult};

/// 队列及其权重
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueWeight {
    pub name: String,
    pub weight: u32,
}

impl QueueWeight {
    /// 解析 `name` 或 `name,weight` 形式的队列描述
    pub fn parse(spec: &str) -> ConveyorResult<Self> {
        let mut parts = spec.splitn(2, ',');
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() || name.contains(':') {
            return Err(ConveyorError::Configuration(format!(
                "invalid queue spec: {spec:?}"
            )));
        }
        let weight = match parts.next() {
            None => 1,
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
                ConveyorError::Configuration(format!("invalid queue weight in {spec:?}"))
            })?,
        };
        if weight == 0 {
            return Err(ConveyorError::Configuration(format!(
                "queue weight must be positive in {spec:?}"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            weight,
        })
    }
}

/// 工作进程配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 并发执行槽数量
    pub concurrency: usize,
    /// 队列列表，元素为 `name` 或 `name,weight`
    pub queues: Vec<String>,
    /// 严格按配置顺序取任务，不做加权随机
    pub strict_ordering: bool,
    /// 所有队列为空时阻塞等待的最长时间
    pub fetch_timeout_ms: u64,
    /// 未取到任务时的空闲间隔
    pub idle_delay_ms: u64,
    pub shutdown_timeout_seconds: u64,
    /// 进程标识，缺省为 `hostname:pid:随机串`
    pub identity: Option<String>,
    pub tag: Option<String>,
    pub labels: Vec<String>,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_ttl_seconds: u64,
    pub max_heartbeat_failures: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            queues: vec!["default".to_string()],
            strict_ordering: false,
            fetch_timeout_ms: 2000,
            idle_delay_ms: 100,
            shutdown_timeout_seconds: 25,
            identity: None,
            tag: None,
            labels: Vec::new(),
            heartbeat_interval_seconds: 5,
            heartbeat_ttl_seconds: 60,
            max_heartbeat_failures: 5,
        }
    }
}

impl WorkerConfig {
    pub fn parsed_queues(&self) -> ConveyorResult<Vec<QueueWeight>> {
        self.queues.iter().map(|q| QueueWeight::parse(q)).collect()
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_seconds)
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> ConveyorResult<()> {
        ValidationUtils::validate_count(self.concurrency, "worker.concurrency", 10000)?;
        if self.queues.is_empty() {
            return Err(ConveyorError::Configuration(
                "worker.queues cannot be empty".to_string(),
            ));
        }
        self.parsed_queues()?;
        if self.fetch_timeout_ms == 0 {
            return Err(ConveyorError::Configuration(
                "worker.fetch_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(identity) = &self.identity {
            ValidationUtils::validate_not_empty(identity, "worker.identity")?;
        }
        if self.heartbeat_interval_seconds == 0 || self.max_heartbeat_failures == 0 {
            return Err(ConveyorError::Configuration(
                "worker.heartbeat_interval_seconds and worker.max_heartbeat_failures must be greater than 0"
                    .to_string(),
            ));
        }
        // 心跳丢失后还要等执行中的任务收尾，这段时间内注册表条目不能先过期，
        // 否则其他进程的回收器会把仍在执行的任务放回队列
        let grace = self
            .heartbeat_interval_seconds
            .saturating_mul(u64::from(self.max_heartbeat_failures))
            .saturating_add(self.shutdown_timeout_seconds);
        if grace >= self.heartbeat_ttl_seconds {
            return Err(ConveyorError::Configuration(format!(
                "worker.heartbeat_interval_seconds * worker.max_heartbeat_failures + worker.shutdown_timeout_seconds ({grace}s) must be less than worker.heartbeat_ttl_seconds ({}s)",
                self.heartbeat_ttl_seconds
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_weight_parse() {
        assert_eq!(
            QueueWeight::parse("critical,3").unwrap(),
            QueueWeight {
                name: "critical".to_string(),
                weight: 3
            }
        );
        assert_eq!(QueueWeight::parse(" low ").unwrap().weight, 1);
        assert!(QueueWeight::parse("").is_err());
        assert!(QueueWeight::parse("a:b").is_err());
        assert!(QueueWeight::parse("a,zero").is_err());
        assert!(QueueWeight::parse("a,0").is_err());
    }

    #[test]
    fn test_worker_config_validation() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = config.clone();
        invalid.concurrency = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.queues.clear();
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.queues = vec!["default,x".to_string()];
        assert!(invalid.validate().is_err());

        // 5s * 7 + 25s = 60s，与TTL相等
        let mut invalid = config.clone();
        invalid.max_heartbeat_failures = 7;
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.shutdown_timeout_seconds = 90;
        assert!(invalid.validate().is_err());

        let mut valid = config.clone();
        valid.shutdown_timeout_seconds = 90;
        valid.heartbeat_ttl_seconds = 120;
        assert!(valid.validate().is_ok());
    }
}
