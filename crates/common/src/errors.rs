/// 统一错误类型
///
/// 同步拒绝（前置条件、校验、容量、未找到）在提交任务之前返回；
/// JobFailed 只能在轮询任务或订阅进度流之后观察到。

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// 字段级错误码（供客户端机器匹配）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FieldErrorCode {
    Invalid,
    MissingParameter,
    Duplicate,
    InsufficientCapacity,
}

impl FieldErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldErrorCode::Invalid => "Invalid",
            FieldErrorCode::MissingParameter => "MissingParameter",
            FieldErrorCode::Duplicate => "Duplicate",
            FieldErrorCode::InsufficientCapacity => "InsufficientCapacity",
        }
    }
}

/// 字段级错误详情
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub code: FieldErrorCode,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, code: FieldErrorCode, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code,
            message: message.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(field, FieldErrorCode::Invalid, message)
    }

    pub fn missing(field: impl Into<String>) -> Self {
        let field = field.into();
        let message = format!("{} is required", field);
        Self::new(field, FieldErrorCode::MissingParameter, message)
    }

    pub fn duplicate(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(field, FieldErrorCode::Duplicate, message)
    }
}

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 阶段/状态不匹配、实例角色被排除、已有进行中的迁移
    #[error("{0}")]
    PreconditionFailed(String),

    /// 磁盘、配额、参数等校验失败
    #[error("{message}")]
    ValidationFailed {
        message: String,
        errors: Vec<FieldError>,
    },

    /// 容量不足（校验失败的特化，携带具体差额）
    #[error("{message}")]
    InsufficientCapacity {
        field: String,
        required: i64,
        available: i64,
        message: String,
    },

    #[error("{0}")]
    NotFound(String),

    /// 委托的异步任务失败
    #[error("job {job_uuid} failed: {message}")]
    JobFailed {
        job_uuid: Uuid,
        message: String,
        manual_intervention: bool,
    },

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 单字段 Invalid 校验错误
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::from(FieldError::invalid(field, message))
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Error::PreconditionFailed(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    /// 容量不足，消息格式固定，客户端依赖该文本做模式匹配
    pub fn insufficient_capacity(resource: &str, field: impl Into<String>, required: i64, available: i64) -> Self {
        Error::InsufficientCapacity {
            field: field.into(),
            required,
            available,
            message: format!(
                "Required additional {} ({}) exceeds the server's available {} ({})",
                resource, required, resource, available
            ),
        }
    }

    /// 机器可读的错误名
    pub fn code(&self) -> &'static str {
        match self {
            Error::PreconditionFailed(_) => "PreconditionFailed",
            Error::ValidationFailed { .. } => "ValidationFailed",
            Error::InsufficientCapacity { .. } => "InsufficientCapacity",
            Error::NotFound(_) => "ResourceNotFound",
            Error::JobFailed { .. } => "JobFailed",
            _ => "InternalError",
        }
    }

    /// 字段级错误列表
    pub fn field_errors(&self) -> Vec<FieldError> {
        match self {
            Error::ValidationFailed { errors, .. } => errors.clone(),
            Error::InsufficientCapacity { field, message, .. } => vec![FieldError::new(
                field.clone(),
                FieldErrorCode::InsufficientCapacity,
                message.clone(),
            )],
            _ => Vec::new(),
        }
    }

    /// 是否属于调用方错误（HTTP 4xx）
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::PreconditionFailed(_)
                | Error::ValidationFailed { .. }
                | Error::InsufficientCapacity { .. }
                | Error::NotFound(_)
        )
    }

    /// 调用方是否可以原样重试
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::InsufficientCapacity { .. } => true,
            Error::JobFailed { manual_intervention, .. } => !manual_intervention,
            _ => false,
        }
    }
}

impl From<FieldError> for Error {
    fn from(err: FieldError) -> Self {
        Error::ValidationFailed {
            message: err.message.clone(),
            errors: vec![err],
        }
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
