use std::sync::Arc;

use application::{
    CacheOptions, ConversationService, ConversationServiceDependencies, SystemClock, TtlCache,
};
use config::AppConfig;
use domain::ConversationStatus;
use tokio::task::JoinHandle;

use crate::memory::{InMemoryConversationDirectory, InMemoryMessageStore};

/// 服务端依赖的具体实现
#[derive(Clone)]
pub struct Infrastructure {
    pub directory: Arc<InMemoryConversationDirectory>,
    pub messages: Arc<InMemoryMessageStore>,
    pub status_cache: Arc<TtlCache<ConversationStatus>>,
}

impl Infrastructure {
    pub fn in_memory(config: &AppConfig) -> Self {
        Self {
            directory: Arc::new(InMemoryConversationDirectory::new()),
            messages: Arc::new(InMemoryMessageStore::new(Arc::new(SystemClock))),
            status_cache: TtlCache::new(CacheOptions::from(&config.cache)),
        }
    }

    /// 启动缓存后台清理
    pub fn spawn_background(&self) -> JoinHandle<()> {
        self.status_cache.spawn_sweeper()
    }

    pub fn conversation_service(&self) -> ConversationService {
        ConversationService::new(ConversationServiceDependencies {
            directory: self.directory.clone(),
            messages: self.messages.clone(),
            status_cache: self.status_cache.clone(),
        })
    }
}
