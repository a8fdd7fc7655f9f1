use thiserror::Error;

/// 任务引擎错误类型定义
#[derive(Debug, Error)]
pub enum ConveyorError {
    #[error("存储错误: {0}")]
    Store(String),

    #[error("存储连接错误: {0}")]
    Connection(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("无法解析的任务记录: {0}")]
    MalformedJob(String),

    #[error("未注册的任务类型: {class}")]
    UnknownJobClass { class: String },

    #[error("无效的任务参数: {0}")]
    InvalidJob(String),

    #[error("任务未找到: {jid}")]
    JobNotFound { jid: String },

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("心跳连续失败 {failures} 次，进程无法证明存活")]
    HeartbeatLost { failures: u32 },

    #[error("进程已在运行")]
    AlreadyRunning,

    #[error("内部错误: {0}")]
    Internal(String),
}

impl ConveyorError {
    /// 错误的类别名称，写入任务记录的 `error_class` 字段
    pub fn kind(&self) -> &'static str {
        match self {
            ConveyorError::Store(_) => "StoreError",
            ConveyorError::Connection(_) => "ConnectionError",
            ConveyorError::Serialization(_) => "SerializationError",
            ConveyorError::MalformedJob(_) => "MalformedJob",
            ConveyorError::UnknownJobClass { .. } => "UnknownJobClass",
            ConveyorError::InvalidJob(_) => "InvalidJob",
            ConveyorError::JobNotFound { .. } => "JobNotFound",
            ConveyorError::Configuration(_) => "ConfigurationError",
            ConveyorError::HeartbeatLost { .. } => "HeartbeatLost",
            ConveyorError::AlreadyRunning => "AlreadyRunning",
            ConveyorError::Internal(_) => "InternalError",
        }
    }

    /// 是否为存储层的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, ConveyorError::Store(_) | ConveyorError::Connection(_))
    }
}

/// 统一的Result类型
pub type ConveyorResult<T> = std::result::Result<T, ConveyorError>;

/// 任务处理器可以返回的带类别的错误
///
/// 处理器返回的其他错误类型统一记为 `JobError` 类别。
#[derive(Debug, Error)]
#[error("{message}")]
pub struct JobError {
    pub class: String,
    pub message: String,
}

impl JobError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }
}
