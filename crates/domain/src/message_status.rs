use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DomainError, MessageId};

/// 消息投递状态
/// 只能前进：sent → delivered → read，服务端为最终权威
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }

    /// 是否允许从当前状态迁移到 `next`（相同状态视为幂等）
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        next >= self
    }

    /// 单调合并：返回两者中更靠后的状态
    pub fn merge(current: Option<MessageStatus>, incoming: MessageStatus) -> MessageStatus {
        match current {
            Some(current) => current.max(incoming),
            None => incoming,
        }
    }

    /// 严格校验迁移，回退时返回错误
    pub fn advance(self, id: MessageId, next: MessageStatus) -> Result<MessageStatus, DomainError> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(DomainError::StatusRegression {
                id,
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
