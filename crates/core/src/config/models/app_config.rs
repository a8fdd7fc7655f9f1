use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::{
    api_observability::{ApiConfig, ObservabilityConfig},
    redis::RedisConfig,
    retry::{DeadSetConfig, RetryConfig},
    scheduler::SchedulerConfig,
    worker::WorkerConfig,
};
use crate::config::validation::ConfigValidator;
use crate::errors::ConveyorResult;

/// 环境变量前缀，如 `CONVEYOR__WORKER__CONCURRENCY=20`
pub const ENV_PREFIX: &str = "CONVEYOR";

const DEFAULT_PATHS: [&str; 3] = [
    "config/conveyor.toml",
    "conveyor.toml",
    "/etc/conveyor/config.toml",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub redis: RedisConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub dead_set: DeadSetConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 加载配置：TOML文件（显式路径或默认位置）叠加环境变量
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else if let Some(path) = DEFAULT_PATHS.iter().find(|p| Path::new(p).exists()) {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = ConfigBuilder::builder()
            .add_source(File::from_str(toml_str, FileFormat::Toml))
            .build()
            .context("解析TOML配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;
        config.validate().context("配置校验失败")?;
        Ok(config)
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> ConveyorResult<()> {
        self.redis.validate()?;
        self.worker.validate()?;
        self.scheduler.validate()?;
        self.retry.validate()?;
        self.dead_set.validate()?;
        self.api.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}
