use crate::errors::{ConveyorError, ConveyorResult};

/// 配置校验接口
pub trait ConfigValidator {
    fn validate(&self) -> ConveyorResult<()>;
}

/// 通用校验工具
pub struct ValidationUtils;

impl ValidationUtils {
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConveyorResult<()> {
        if value.trim().is_empty() {
            return Err(ConveyorError::Configuration(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    pub fn validate_port(port: u16, field_name: &str) -> ConveyorResult<()> {
        if port == 0 {
            return Err(ConveyorError::Configuration(format!(
                "{field_name} cannot be 0"
            )));
        }
        Ok(())
    }

    /// 校验计数范围 `1..=max`
    pub fn validate_count(count: usize, field_name: &str, max: usize) -> ConveyorResult<()> {
        if count == 0 {
            return Err(ConveyorError::Configuration(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if count > max {
            return Err(ConveyorError::Configuration(format!(
                "{field_name} must be less than or equal to {max}"
            )));
        }
        Ok(())
    }

    pub fn validate_positive(value: f64, field_name: &str) -> ConveyorResult<()> {
        if !value.is_finite() || value <= 0.0 {
            return Err(ConveyorError::Configuration(format!(
                "{field_name} must be a positive number"
            )));
        }
        Ok(())
    }

    pub fn validate_url(url: &str, field_name: &str) -> ConveyorResult<()> {
        Self::validate_not_empty(url, field_name)?;
        if !url.contains("://") {
            return Err(ConveyorError::Configuration(format!(
                "{field_name} must be a valid URL with protocol"
            )));
        }
        Ok(())
    }
}
