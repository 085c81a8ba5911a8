use domain::{DomainError, RepositoryError, TransportKind};
use thiserror::Error;

use crate::rate_limiter::RateLimitError;

/// 传输层错误：建连、协商或读写失败，按重连策略重试
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 中间设施（代理、网关）拒绝了该传输方式
    #[error("transport {transport} rejected: {reason}")]
    Rejected {
        transport: TransportKind,
        reason: String,
    },
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("connection attempt timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no transport configured")]
    NoTransport,
}

impl TransportError {
    pub fn rejected(transport: TransportKind, reason: impl Into<String>) -> Self {
        TransportError::Rejected {
            transport,
            reason: reason.into(),
        }
    }

    /// 认证失败换一种传输也无济于事
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }
}

/// connect() 的失败结果
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel transport failed: {0}")]
    Transport(#[from] TransportError),
    /// 连接尝试结束但未建立（被本地断开或重连耗尽）
    #[error("channel unavailable")]
    Unavailable,
    #[error("channel manager already installed")]
    AlreadyInstalled,
}

/// 同步网关（推送通道 / REST 降级）调用错误
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("channel unavailable")]
    ChannelUnavailable,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("http request failed: {0}")]
    Http(String),
    #[error("server rejected request: {status} {message}")]
    Rejected { status: u16, message: String },
}

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    /// 会话已封禁，对应错误码 CONVERSATION_BLOCKED
    #[error("conversation is blocked")]
    ConversationBlocked,
    #[error("rate limited: {0}")]
    RateLimited(#[from] RateLimitError),
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
    #[error("authentication failed")]
    Authentication,
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure(message.into())
    }
}
