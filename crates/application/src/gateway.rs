//! 同步网关
//!
//! 同一组操作有两条实现路径：持久通道推送与 REST 降级。
//! 网关在通道连通时走推送，否则走 REST；调用方不感知差异。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use domain::{ClientEvent, UserId};
use tracing::{debug, warn};

use crate::channel::ChannelManager;
use crate::error::SyncError;
use crate::transport::Delivery;

/// 实际使用的路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Push,
    Rest,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Push => f.write_str("push"),
            Route::Rest => f.write_str("rest"),
        }
    }
}

/// 同步操作的统一接口
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SyncTransport: Send + Sync {
    fn route(&self) -> Route;

    /// 通知对方自己的输入状态
    async fn send_typing(&self, receiver_id: UserId, is_typing: bool) -> Result<(), SyncError>;

    /// 请求刷新与某用户的会话状态；结果以 conversation_status_update 事件返回
    async fn refresh_conversation(&self, other_user_id: UserId, force: bool) -> Result<(), SyncError>;
}

/// 经持久通道发送
pub struct PushTransport {
    channel: Arc<ChannelManager>,
}

impl PushTransport {
    pub fn new(channel: Arc<ChannelManager>) -> Self {
        Self { channel }
    }

    async fn emit(&self, event: ClientEvent) -> Result<(), SyncError> {
        match self.channel.send(event).await {
            Delivery::Sent => Ok(()),
            Delivery::Dropped | Delivery::TimedOut => Err(SyncError::ChannelUnavailable),
        }
    }
}

#[async_trait]
impl SyncTransport for PushTransport {
    fn route(&self) -> Route {
        Route::Push
    }

    async fn send_typing(&self, receiver_id: UserId, is_typing: bool) -> Result<(), SyncError> {
        self.emit(ClientEvent::TypingIndicator {
            receiver_id,
            is_typing,
        })
        .await
    }

    async fn refresh_conversation(&self, other_user_id: UserId, force: bool) -> Result<(), SyncError> {
        self.emit(ClientEvent::RefreshConversation {
            other_user_id,
            force,
        })
        .await
    }
}

/// 按连接状态在推送与 REST 之间选择
pub struct SyncGateway {
    channel: Arc<ChannelManager>,
    push: Arc<dyn SyncTransport>,
    fallback: Arc<dyn SyncTransport>,
}

impl SyncGateway {
    pub fn new(
        channel: Arc<ChannelManager>,
        push: Arc<dyn SyncTransport>,
        fallback: Arc<dyn SyncTransport>,
    ) -> Self {
        Self {
            channel,
            push,
            fallback,
        }
    }

    /// 当前会选用的路径
    pub fn select(&self) -> &Arc<dyn SyncTransport> {
        if self.channel.is_connected() {
            &self.push
        } else {
            &self.fallback
        }
    }

    pub async fn send_typing(&self, receiver_id: UserId, is_typing: bool) -> Result<Route, SyncError> {
        let transport = self.select();
        match transport.send_typing(receiver_id, is_typing).await {
            Ok(()) => Ok(transport.route()),
            Err(SyncError::ChannelUnavailable) if transport.route() == Route::Push => {
                warn!("推送通道在发送途中断开，改走 REST");
                self.fallback.send_typing(receiver_id, is_typing).await?;
                Ok(Route::Rest)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn refresh_conversation(&self, other_user_id: UserId, force: bool) -> Result<Route, SyncError> {
        let transport = self.select();
        debug!(route = %transport.route(), %other_user_id, force, "刷新会话状态");
        match transport.refresh_conversation(other_user_id, force).await {
            Ok(()) => Ok(transport.route()),
            Err(SyncError::ChannelUnavailable) if transport.route() == Route::Push => {
                self.fallback.refresh_conversation(other_user_id, force).await?;
                Ok(Route::Rest)
            }
            Err(err) => Err(err),
        }
    }
}
