//! 基础设施层实现。
//!
//! 提供通道传输（WebSocket、长轮询）、REST 降级客户端与内存存储，
//! 实现应用层定义的接口。

pub mod builder;
pub mod connector;
pub mod memory;
pub mod polling;
pub mod rest_fallback;
pub mod retry;
pub mod websocket;

pub use builder::Infrastructure;
pub use connector::{DefaultConnector, ServerEndpoint};
pub use memory::{InMemoryConversationDirectory, InMemoryMessageStore};
pub use polling::PollingConnector;
pub use rest_fallback::RestFallback;
pub use retry::{retry_async, Backoff, RetryConfig};
pub use websocket::WebSocketConnector;
