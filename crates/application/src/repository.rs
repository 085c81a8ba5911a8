use async_trait::async_trait;
use domain::{ChatMessage, MessageId, MessageStatus, RepositoryError, UserId};

/// 用户之间的封禁关系
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    /// `blocker` 是否封禁了 `blocked`
    async fn is_blocked_by(&self, blocker: UserId, blocked: UserId) -> Result<bool, RepositoryError>;

    async fn set_blocked(
        &self,
        blocker: UserId,
        blocked: UserId,
        is_blocked: bool,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    // 保存消息并分配 ID
    async fn save_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
    ) -> Result<ChatMessage, RepositoryError>;

    async fn find_by_id(&self, id: MessageId) -> Result<Option<ChatMessage>, RepositoryError>;

    /// 批量写入状态，整体作为一次操作；返回实际存在的消息（含更新后的状态）
    async fn update_statuses(
        &self,
        ids: &[MessageId],
        status: MessageStatus,
    ) -> Result<Vec<ChatMessage>, RepositoryError>;
}
