//! 领域模型错误定义
//!
//! 定义了同步层领域对象可能产生的错误类型。

use thiserror::Error;

use crate::{MessageId, MessageStatus};

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// 消息状态回退
    #[error("消息 {id} 状态不可从 {from} 回退到 {to}")]
    StatusRegression {
        id: MessageId,
        from: MessageStatus,
        to: MessageStatus,
    },

    /// 资源不存在错误
    #[error("资源不存在: {resource_type} ID {resource_id}")]
    ResourceNotFound {
        resource_type: String,
        resource_id: String,
    },

    /// 验证错误
    #[error("验证失败: {field}: {message}")]
    ValidationError { field: String, message: String },
}

impl DomainError {
    /// 创建资源不存在错误
    pub fn not_found(resource_type: impl Into<String>, resource_id: impl ToString) -> Self {
        Self::ResourceNotFound {
            resource_type: resource_type.into(),
            resource_id: resource_id.to_string(),
        }
    }

    /// 创建验证错误
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// 存储访问错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("记录不存在")]
    NotFound,
    #[error("存储错误: {0}")]
    Storage(String),
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}

/// 存储层结果类型
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// 领域层结果类型
pub type DomainResult<T> = Result<T, DomainError>;
