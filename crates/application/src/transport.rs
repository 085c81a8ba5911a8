//! 通道传输抽象
//!
//! 通道管理器只依赖这里的 trait，具体的 WebSocket / 长轮询实现位于 infrastructure。

use std::fmt;

use async_trait::async_trait;
use domain::{ClientEvent, DisconnectReason, InboundEvent, TransportKind};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// 认证凭据，每次建连前重新读取
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// 凭据来源（例如登录态存储），不在重连之间缓存
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self) -> Result<Credential, TransportError>;
}

/// 固定凭据
#[derive(Debug, Clone)]
pub struct StaticCredential(pub Credential);

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn credential(&self) -> Result<Credential, TransportError> {
        Ok(self.0.clone())
    }
}

/// 传输层上报给通道的事件
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Event(InboundEvent),
    Closed(DisconnectReason),
}

/// 一条已建立的底层链路
///
/// 丢弃 `outbound` 即要求传输层关闭链路；`inbound` 结束视为 transport closed。
pub struct ChannelLink {
    pub outbound: mpsc::UnboundedSender<ClientEvent>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

impl ChannelLink {
    /// 创建一对链路端点，返回（通道侧链路，传输侧端点）
    pub fn pair() -> (ChannelLink, LinkEndpoint) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            ChannelLink {
                outbound: out_tx,
                inbound: in_rx,
            },
            LinkEndpoint {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }
}

/// 传输实现持有的一端
pub struct LinkEndpoint {
    pub outbound: mpsc::UnboundedReceiver<ClientEvent>,
    pub inbound: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEndpoint {
    /// 上报一个服务端事件，通道已关闭时返回 false
    pub fn deliver(&self, event: InboundEvent) -> bool {
        self.inbound.send(LinkEvent::Event(event)).is_ok()
    }

    pub fn close(&self, reason: DisconnectReason) {
        let _ = self.inbound.send(LinkEvent::Closed(reason));
    }
}

/// 按传输种类建立链路
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        transport: TransportKind,
        credential: &Credential,
    ) -> Result<ChannelLink, TransportError>;
}

/// 一次发送的结果；失败以事件形式通知监听器，这里只给调用方一个结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// 已写入当前连接
    Sent,
    /// 无可用连接，载荷被丢弃（不排队、不重放）
    Dropped,
    /// 超过调用方给定的超时
    TimedOut,
}

impl Delivery {
    pub fn is_sent(&self) -> bool {
        matches!(self, Delivery::Sent)
    }
}

/// 上行事件出口，ChannelManager 是生产实现
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ClientEvent) -> Delivery;
}
