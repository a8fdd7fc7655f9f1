use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::errors::ConveyorResult;

/// 共享存储（Redis）连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// 完整连接串，设置后忽略 host/port/database/password
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: i64,
    pub password: Option<String>,
    /// 所有键的前缀，形如 `<namespace>:`
    pub namespace: Option<String>,
    pub connection_timeout_seconds: u64,
    /// 普通命令等待响应的上限，超时按连接错误处理
    pub response_timeout_seconds: u64,
    /// 阻塞式取任务使用的专用连接数
    pub blocking_pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
            namespace: None,
            connection_timeout_seconds: 5,
            response_timeout_seconds: 5,
            blocking_pool_size: 10,
        }
    }
}

impl RedisConfig {
    pub fn build_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match &self.password {
            Some(password) if !password.is_empty() => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.database
            ),
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

impl ConfigValidator for RedisConfig {
    fn validate(&self) -> ConveyorResult<()> {
        match &self.url {
            Some(url) => ValidationUtils::validate_url(url, "redis.url")?,
            None => {
                ValidationUtils::validate_not_empty(&self.host, "redis.host")?;
                ValidationUtils::validate_port(self.port, "redis.port")?;
            }
        }
        if let Some(ns) = &self.namespace {
            ValidationUtils::validate_not_empty(ns, "redis.namespace")?;
        }
        ValidationUtils::validate_count(
            self.response_timeout_seconds as usize,
            "redis.response_timeout_seconds",
            300,
        )?;
        ValidationUtils::validate_count(self.blocking_pool_size, "redis.blocking_pool_size", 1000)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url() {
        let mut config = RedisConfig::default();
        assert_eq!(config.build_url(), "redis://127.0.0.1:6379/0");

        config.password = Some("secret".to_string());
        config.database = 2;
        assert_eq!(config.build_url(), "redis://:secret@127.0.0.1:6379/2");

        config.url = Some("redis://cache:6380/1".to_string());
        assert_eq!(config.build_url(), "redis://cache:6380/1");
    }

    #[test]
    fn test_redis_config_validation() {
        assert!(RedisConfig::default().validate().is_ok());

        let mut invalid = RedisConfig::default();
        invalid.port = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = RedisConfig::default();
        invalid.namespace = Some(" ".to_string());
        assert!(invalid.validate().is_err());

        let mut invalid = RedisConfig::default();
        invalid.response_timeout_seconds = 0;
        assert!(invalid.validate().is_err());
    }
}
