use serde::{Deserialize, Serialize};

use crate::models::job::now_epoch;

/// 工作进程的静态信息，写入注册表哈希的 `info` 字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub identity: String,
    pub hostname: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub concurrency: usize,
    pub queues: Vec<String>,
    pub started_at: f64,
    #[serde(default)]
    pub version: String,
}

impl ProcessInfo {
    /// 生成进程标识：`hostname:pid:随机串`
    pub fn default_identity(hostname: &str, pid: u32) -> String {
        let nonce = &crate::models::job::generate_jid()[..12];
        format!("{hostname}:{pid}:{nonce}")
    }
}

/// 单次心跳写入的动态状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub busy: usize,
    pub beat: f64,
    pub quiet: bool,
}

impl Heartbeat {
    pub fn now(busy: usize, quiet: bool) -> Self {
        Self {
            busy,
            beat: now_epoch(),
            quiet,
        }
    }
}

/// 正在执行的任务，写入 `<identity>:work` 哈希，键为执行槽编号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkEntry {
    pub queue: String,
    /// 原始任务负载
    pub payload: String,
    pub run_at: f64,
}

/// 从注册表读取的进程状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub info: ProcessInfo,
    pub busy: usize,
    pub beat: f64,
    pub quiet: bool,
}

/// 远程进程控制信号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessSignal {
    /// 停止领取新任务
    #[serde(rename = "TSTP")]
    Quiet,
    /// 停止进程
    #[serde(rename = "TERM")]
    Stop,
}

impl ProcessSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessSignal::Quiet => "TSTP",
            ProcessSignal::Stop => "TERM",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "TSTP" => Some(ProcessSignal::Quiet),
            "TERM" => Some(ProcessSignal::Stop),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_identity_has_three_parts() {
        let identity = ProcessInfo::default_identity("worker-a", 4242);
        let parts: Vec<&str> = identity.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "worker-a");
        assert_eq!(parts[1], "4242");
        assert_eq!(parts[2].len(), 12);
    }

    #[test]
    fn signal_parsing() {
        assert_eq!(ProcessSignal::parse("TSTP"), Some(ProcessSignal::Quiet));
        assert_eq!(ProcessSignal::parse("TERM"), Some(ProcessSignal::Stop));
        assert_eq!(ProcessSignal::parse("USR1"), None);
        assert_eq!(ProcessSignal::Quiet.as_str(), "TSTP");
    }
}
