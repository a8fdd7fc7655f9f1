use std::fmt;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ConveyorError, ConveyorResult};

/// 未指定队列时使用的队列名
pub const DEFAULT_QUEUE: &str = "default";

/// 当前时间（Unix秒，浮点）
pub fn now_epoch() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// 生成新的任务ID：24位十六进制随机串
pub fn generate_jid() -> String {
    let bytes: [u8; 12] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// 任务重试策略
///
/// 线上格式兼容常见写法：`false`/`0` 表示禁用，正整数表示最大重试次数，
/// `true` 表示使用全局默认上限，`"unlimited"` 或负数表示不设上限。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "Value", into = "Value")]
pub enum RetryPolicy {
    Disabled,
    #[default]
    Default,
    Limit(u32),
    Unlimited,
}

impl RetryPolicy {
    /// 解析出实际的重试上限，`None` 表示不设上限
    pub fn max_retries(&self, default_max: u32) -> Option<u32> {
        match self {
            RetryPolicy::Disabled => Some(0),
            RetryPolicy::Default => Some(default_max),
            RetryPolicy::Limit(n) => Some(*n),
            RetryPolicy::Unlimited => None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, RetryPolicy::Disabled)
    }
}

impl TryFrom<Value> for RetryPolicy {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(RetryPolicy::Default),
            Value::Bool(true) => Ok(RetryPolicy::Default),
            Value::Bool(false) => Ok(RetryPolicy::Disabled),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(RetryPolicy::Disabled),
                Some(v) if v < 0 => Ok(RetryPolicy::Unlimited),
                Some(v) => u32::try_from(v)
                    .map(RetryPolicy::Limit)
                    .map_err(|_| format!("retry count out of range: {v}")),
                None => Err(format!("invalid retry value: {n}")),
            },
            Value::String(s) if s.eq_ignore_ascii_case("unlimited") => Ok(RetryPolicy::Unlimited),
            other => Err(format!("invalid retry value: {other}")),
        }
    }
}

impl From<RetryPolicy> for Value {
    fn from(policy: RetryPolicy) -> Self {
        match policy {
            RetryPolicy::Disabled => Value::Bool(false),
            RetryPolicy::Default => Value::Bool(true),
            RetryPolicy::Limit(n) => Value::from(n),
            RetryPolicy::Unlimited => Value::String("unlimited".to_string()),
        }
    }
}

/// 错误回溯采集选项：`true` 表示采集全部（受全局上限约束），整数表示行数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BacktraceOption {
    Enabled(bool),
    Lines(u32),
}

impl BacktraceOption {
    /// 需要保留的行数，`None` 表示不采集
    pub fn lines(&self, cap: usize) -> Option<usize> {
        match self {
            BacktraceOption::Enabled(false) | BacktraceOption::Lines(0) => None,
            BacktraceOption::Enabled(true) => Some(cap),
            BacktraceOption::Lines(n) => Some((*n as usize).min(cap)),
        }
    }
}

/// 任务记录，在存储中以JSON形式流转
///
/// 入队后除重试簿记字段外不再修改；未识别的字段原样保留在 `extra` 中。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(rename = "jid", alias = "id")]
    pub id: String,
    pub class: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub created_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<BacktraceOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_backtrace: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

impl JobRecord {
    /// 创建新的任务记录
    pub fn new(class: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id: generate_jid(),
            class: class.into(),
            args,
            queue: default_queue(),
            retry: RetryPolicy::Default,
            created_at: now_epoch(),
            enqueued_at: None,
            retry_count: None,
            failed_at: None,
            retried_at: None,
            error_message: None,
            error_class: None,
            backtrace: None,
            error_backtrace: None,
            dead: None,
            extra: Map::new(),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 已失败的次数，字段缺失时为0
    pub fn retry_count(&self) -> u32 {
        self.retry_count.unwrap_or(0)
    }

    /// 重试耗尽后是否进入死信集合
    pub fn goes_to_dead_set(&self) -> bool {
        self.dead.unwrap_or(true)
    }

    pub fn to_json(&self) -> ConveyorResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 从线上格式解析任务记录
    pub fn from_json(payload: &str) -> ConveyorResult<Self> {
        let job: JobRecord = serde_json::from_str(payload)
            .map_err(|e| ConveyorError::MalformedJob(format!("{e}")))?;
        if job.class.is_empty() {
            return Err(ConveyorError::MalformedJob("empty class".to_string()));
        }
        Ok(job)
    }
}

impl fmt::Display for JobRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(jid={}, queue={})", self.class, self.id, self.queue)
    }
}

/// 只读取任务记录中定位所需的字段，用于处理畸形或未知结构的负载
#[derive(Debug, Clone, Deserialize)]
pub struct JobLocator {
    #[serde(rename = "jid", alias = "id", default)]
    pub id: String,
    #[serde(default = "default_queue")]
    pub queue: String,
}

impl JobLocator {
    pub fn parse(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retry_policy_wire_values() {
        let cases = [
            (json!(false), RetryPolicy::Disabled),
            (json!(0), RetryPolicy::Disabled),
            (json!(true), RetryPolicy::Default),
            (json!(5), RetryPolicy::Limit(5)),
            (json!(-1), RetryPolicy::Unlimited),
            (json!("unlimited"), RetryPolicy::Unlimited),
        ];
        for (value, expected) in cases {
            let policy: RetryPolicy = serde_json::from_value(value.clone()).unwrap();
            assert_eq!(policy, expected, "value {value}");
        }
        assert!(serde_json::from_value::<RetryPolicy>(json!("sometimes")).is_err());
    }

    #[test]
    fn max_retries_resolution() {
        assert_eq!(RetryPolicy::Disabled.max_retries(25), Some(0));
        assert_eq!(RetryPolicy::Default.max_retries(25), Some(25));
        assert_eq!(RetryPolicy::Limit(3).max_retries(25), Some(3));
        assert_eq!(RetryPolicy::Unlimited.max_retries(25), None);
    }

    #[test]
    fn parses_minimal_record_and_keeps_unknown_fields() {
        let payload = r#"{"jid":"abc","class":"Noop","args":[1],"created_at":1.5,"tenant":"acme"}"#;
        let job = JobRecord::from_json(payload).unwrap();
        assert_eq!(job.id, "abc");
        assert_eq!(job.queue, DEFAULT_QUEUE);
        assert_eq!(job.retry, RetryPolicy::Default);
        assert_eq!(job.retry_count(), 0);
        assert_eq!(job.extra.get("tenant"), Some(&json!("acme")));

        let reencoded: Value = serde_json::from_str(&job.to_json().unwrap()).unwrap();
        assert_eq!(reencoded["tenant"], json!("acme"));
        assert_eq!(reencoded["jid"], json!("abc"));
        assert!(reencoded.get("retry_count").is_none());
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(
            JobRecord::from_json("not json"),
            Err(ConveyorError::MalformedJob(_))
        ));
        assert!(matches!(
            JobRecord::from_json(r#"{"jid":"x","class":"","created_at":1}"#),
            Err(ConveyorError::MalformedJob(_))
        ));
    }

    #[test]
    fn jids_are_unique_hex() {
        let a = generate_jid();
        let b = generate_jid();
        assert_eq!(a.len(), 24);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn backtrace_option_lines() {
        assert_eq!(BacktraceOption::Enabled(true).lines(20), Some(20));
        assert_eq!(BacktraceOption::Enabled(false).lines(20), None);
        assert_eq!(BacktraceOption::Lines(5).lines(20), Some(5));
        assert_eq!(BacktraceOption::Lines(50).lines(20), Some(20));
    }
}
