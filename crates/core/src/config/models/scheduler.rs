use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::errors::{ConveyorError, ConveyorResult};

/// 定时任务轮询与孤儿回收配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// 固定的平均轮询间隔（秒），设置后不再按进程数缩放
    pub poll_interval_average: Option<f64>,
    /// 单个进程的基准间隔（秒），乘以存活进程数得到平均间隔
    pub scaled_poll_interval: f64,
    /// 首次轮询前的等待（秒）
    pub initial_wait: f64,
    /// 单次脚本最多迁移的条目数
    pub batch_size: usize,
    pub reaper_enabled: bool,
    pub reaper_interval_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_average: None,
            scaled_poll_interval: 5.0,
            initial_wait: 5.0,
            batch_size: 100,
            reaper_enabled: true,
            reaper_interval_seconds: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }
}

impl ConfigValidator for SchedulerConfig {
    fn validate(&self) -> ConveyorResult<()> {
        if let Some(avg) = self.poll_interval_average {
            ValidationUtils::validate_positive(avg, "scheduler.poll_interval_average")?;
        }
        ValidationUtils::validate_positive(
            self.scaled_poll_interval,
            "scheduler.scaled_poll_interval",
        )?;
        if !self.initial_wait.is_finite() || self.initial_wait < 0.0 {
            return Err(ConveyorError::Configuration(
                "scheduler.initial_wait must be a non-negative number".to_string(),
            ));
        }
        ValidationUtils::validate_count(self.batch_size, "scheduler.batch_size", 10000)?;
        if self.reaper_enabled && self.reaper_interval_seconds == 0 {
            return Err(ConveyorError::Configuration(
                "scheduler.reaper_interval_seconds must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_validation() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = config.clone();
        invalid.poll_interval_average = Some(0.0);
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.initial_wait = -1.0;
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.batch_size = 0;
        assert!(invalid.validate().is_err());
    }
}
