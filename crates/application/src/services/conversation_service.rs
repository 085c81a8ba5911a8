use std::sync::Arc;

use domain::{ChatMessage, ConversationStatus, MessageId, MessageStatus, UserId};
use tracing::{debug, info};

use crate::cache::TtlCache;
use crate::error::ApplicationError;
use crate::repository::{ConversationDirectory, MessageStore};

/// 会话状态缓存的命名空间
pub const CONVERSATION_STATUS_NAMESPACE: &str = "conversation-status";

pub struct ConversationServiceDependencies {
    pub directory: Arc<dyn ConversationDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub status_cache: Arc<TtlCache<ConversationStatus>>,
}

/// 批量状态更新的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusBatchOutcome {
    pub status: MessageStatus,
    /// 实际被推进的消息，保持请求顺序
    pub ids: Vec<MessageId>,
    /// 这些消息的发送方（去重），需要收到确认
    pub senders: Vec<UserId>,
}

impl StatusBatchOutcome {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// 封禁变更后双方各自视角的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockChange {
    /// 发起方看到的状态（user_id 为被封禁方）
    pub blocker_view: ConversationStatus,
    /// 被封禁方看到的状态（user_id 为发起方）
    pub blocked_view: ConversationStatus,
}

pub struct ConversationService {
    deps: ConversationServiceDependencies,
}

impl ConversationService {
    pub fn new(deps: ConversationServiceDependencies) -> Self {
        Self { deps }
    }

    pub fn status_cache(&self) -> &Arc<TtlCache<ConversationStatus>> {
        &self.deps.status_cache
    }

    /// `viewer` 视角下与 `other` 的会话状态，读穿缓存
    pub async fn conversation_status(
        &self,
        viewer: UserId,
        other: UserId,
    ) -> Result<ConversationStatus, ApplicationError> {
        let id = status_cache_id(viewer, other);
        self.deps
            .status_cache
            .get_or_set(
                CONVERSATION_STATUS_NAMESPACE,
                &id,
                || self.load_status(viewer, other),
                None,
            )
            .await
    }

    /// 跳过缓存重新读取，结果写回缓存
    pub async fn refresh_conversation_status(
        &self,
        viewer: UserId,
        other: UserId,
    ) -> Result<ConversationStatus, ApplicationError> {
        self.deps
            .status_cache
            .invalidate(CONVERSATION_STATUS_NAMESPACE, &status_cache_id(viewer, other));
        self.conversation_status(viewer, other).await
    }

    /// 设置封禁关系并失效双方缓存
    pub async fn set_blocked(
        &self,
        blocker: UserId,
        blocked: UserId,
        is_blocked: bool,
    ) -> Result<BlockChange, ApplicationError> {
        self.deps
            .directory
            .set_blocked(blocker, blocked, is_blocked)
            .await?;

        let cache = &self.deps.status_cache;
        cache.invalidate(CONVERSATION_STATUS_NAMESPACE, &status_cache_id(blocker, blocked));
        cache.invalidate(CONVERSATION_STATUS_NAMESPACE, &status_cache_id(blocked, blocker));
        info!(%blocker, %blocked, is_blocked, "会话封禁状态已变更");

        Ok(BlockChange {
            blocker_view: self.conversation_status(blocker, blocked).await?,
            blocked_view: self.conversation_status(blocked, blocker).await?,
        })
    }

    /// 保存私聊消息；任一方封禁时拒绝
    pub async fn send_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
    ) -> Result<ChatMessage, ApplicationError> {
        if content.trim().is_empty() {
            return Err(domain::DomainError::validation_error("content", "消息内容不能为空").into());
        }

        let status = self.conversation_status(sender_id, receiver_id).await?;
        if status.is_blocked {
            debug!(%sender_id, %receiver_id, "会话已封禁，拒绝消息");
            return Err(ApplicationError::ConversationBlocked);
        }

        let message = self
            .deps
            .messages
            .save_message(sender_id, receiver_id, content)
            .await?;
        Ok(message)
    }

    pub async fn apply_status(
        &self,
        actor: UserId,
        id: MessageId,
        status: MessageStatus,
    ) -> Result<StatusBatchOutcome, ApplicationError> {
        self.apply_status_batch(actor, &[id], status).await
    }

    /// 批量推进消息状态，作为一次存储操作完成
    ///
    /// 只有接收方可以推进状态；已处于相同或更靠后状态的消息被跳过。
    pub async fn apply_status_batch(
        &self,
        actor: UserId,
        ids: &[MessageId],
        status: MessageStatus,
    ) -> Result<StatusBatchOutcome, ApplicationError> {
        let mut advancing = Vec::with_capacity(ids.len());
        let mut senders = Vec::new();

        for &id in ids {
            if advancing.contains(&id) {
                continue;
            }
            let Some(message) = self.deps.messages.find_by_id(id).await? else {
                debug!(%id, "状态更新的消息不存在，跳过");
                continue;
            };
            if message.receiver_id != actor || message.status >= status {
                continue;
            }
            advancing.push(id);
            if !senders.contains(&message.sender_id) {
                senders.push(message.sender_id);
            }
        }

        if !advancing.is_empty() {
            self.deps
                .messages
                .update_statuses(&advancing, status)
                .await?;
            debug!(count = advancing.len(), %status, "批量状态已写入");
        }

        Ok(StatusBatchOutcome {
            status,
            ids: advancing,
            senders,
        })
    }

    async fn load_status(
        &self,
        viewer: UserId,
        other: UserId,
    ) -> Result<ConversationStatus, ApplicationError> {
        let blocked_by_me = self.deps.directory.is_blocked_by(viewer, other).await?;
        let blocked_by_other = self.deps.directory.is_blocked_by(other, viewer).await?;
        Ok(ConversationStatus {
            user_id: other,
            is_blocked: blocked_by_me || blocked_by_other,
            blocked_by_me,
        })
    }
}

fn status_cache_id(viewer: UserId, other: UserId) -> String {
    format!("{viewer}:{other}")
}
