use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::errors::ConveyorResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// `retry: true` 时使用的最大重试次数
    pub default_max_retries: u32,
    pub max_error_message_bytes: usize,
    pub max_backtrace_lines: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 25,
            max_error_message_bytes: 10_000,
            max_backtrace_lines: 50,
        }
    }
}

impl ConfigValidator for RetryConfig {
    fn validate(&self) -> ConveyorResult<()> {
        ValidationUtils::validate_count(
            self.max_error_message_bytes,
            "retry.max_error_message_bytes",
            1_000_000,
        )?;
        ValidationUtils::validate_count(
            self.max_backtrace_lines,
            "retry.max_backtrace_lines",
            10_000,
        )?;
        Ok(())
    }
}

/// 死信集合容量限制，每次写入时按时间后按数量淘汰
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadSetConfig {
    pub max_jobs: usize,
    pub timeout_seconds: u64,
}

impl Default for DeadSetConfig {
    fn default() -> Self {
        Self {
            max_jobs: 10_000,
            timeout_seconds: 180 * 24 * 60 * 60,
        }
    }
}

impl ConfigValidator for DeadSetConfig {
    fn validate(&self) -> ConveyorResult<()> {
        ValidationUtils::validate_count(self.max_jobs, "dead_set.max_jobs", 10_000_000)?;
        if self.timeout_seconds == 0 {
            return Err(crate::errors::ConveyorError::Configuration(
                "dead_set.timeout_seconds must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
