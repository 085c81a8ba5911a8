//! 内存存储实现
//!
//! 服务端二进制与集成测试使用；持久化存储不在本项目范围内。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use application::{Clock, ConversationDirectory, MessageStore};
use async_trait::async_trait;
use domain::{ChatMessage, MessageId, MessageStatus, RepositoryError, UserId};
use tokio::sync::RwLock;
use tracing::debug;

/// 内存中的封禁关系
#[derive(Default)]
pub struct InMemoryConversationDirectory {
    /// (封禁方, 被封禁方)
    blocks: RwLock<HashSet<(UserId, UserId)>>,
}

impl InMemoryConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationDirectory for InMemoryConversationDirectory {
    async fn is_blocked_by(&self, blocker: UserId, blocked: UserId) -> Result<bool, RepositoryError> {
        Ok(self.blocks.read().await.contains(&(blocker, blocked)))
    }

    async fn set_blocked(
        &self,
        blocker: UserId,
        blocked: UserId,
        is_blocked: bool,
    ) -> Result<(), RepositoryError> {
        let mut blocks = self.blocks.write().await;
        if is_blocked {
            blocks.insert((blocker, blocked));
        } else {
            blocks.remove(&(blocker, blocked));
        }
        Ok(())
    }
}

/// 内存中的消息存储
pub struct InMemoryMessageStore {
    messages: RwLock<HashMap<MessageId, ChatMessage>>,
    next_id: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl InMemoryMessageStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            clock,
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn save_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: String,
    ) -> Result<ChatMessage, RepositoryError> {
        let message = ChatMessage {
            id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst)),
            sender_id,
            receiver_id,
            content,
            status: MessageStatus::Sent,
            created_at: self.clock.now(),
        };
        self.messages
            .write()
            .await
            .insert(message.id, message.clone());
        Ok(message)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<ChatMessage>, RepositoryError> {
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn update_statuses(
        &self,
        ids: &[MessageId],
        status: MessageStatus,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        // 一次写锁内完成整批更新
        let mut messages = self.messages.write().await;
        let mut updated = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(message) = messages.get_mut(id) {
                message.status = MessageStatus::merge(Some(message.status), status);
                updated.push(message.clone());
            }
        }
        debug!(requested = ids.len(), updated = updated.len(), %status, "批量更新消息状态");
        Ok(updated)
    }
}
