//! 应用层实现。
//!
//! 客户端一侧：持久通道、事件分发、缓存失效协调、消息状态上报与同步网关。
//! 服务端一侧：TTL 缓存与会话服务，以及对存储的 trait 抽象。

pub mod cache;
pub mod channel;
pub mod client;
pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod invalidation;
pub mod rate_limiter;
pub mod reactions;
pub mod repository;
pub mod services;
pub mod status;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::{cache_key, CacheOptions, CacheStats, TtlCache};
pub use channel::{ChannelManager, ChannelOptions, ConnectionHandle, ConnectionState};
pub use client::{SyncClient, SyncClientBuilder};
pub use clock::{Clock, SystemClock};
pub use dispatcher::{EventDispatcher, Listener, Subscription};
pub use error::{ApplicationError, ChannelError, SyncError, TransportError};
pub use gateway::{PushTransport, Route, SyncGateway, SyncTransport};
pub use invalidation::{
    InvalidationCoordinator, InvalidationOutcome, InvalidationRequest, KeySegment, QueryCache,
    QueryKey, Strategy,
};
pub use rate_limiter::{MessageRateLimiter, RateLimitError};
pub use reactions::{InvalidationRoutes, Notice, NoticeSink, RouteTimings, TracingNoticeSink};
pub use repository::{ConversationDirectory, MessageStore};
pub use services::{
    BlockChange, ConversationService, ConversationServiceDependencies, StatusBatchOutcome,
    CONVERSATION_STATUS_NAMESPACE,
};
pub use status::{BatchOptions, StatusBatcher, StatusDispatch, StatusEntry, StatusLedger};
pub use transport::{
    ChannelLink, Connector, Credential, CredentialProvider, Delivery, EventSink, LinkEndpoint,
    LinkEvent, StaticCredential,
};
