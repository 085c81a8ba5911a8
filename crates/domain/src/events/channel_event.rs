use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ChatMessage, MessageId, MessageStatus, UserId};

/// 连接断开原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// 服务端主动关闭
    #[serde(rename = "server closed")]
    ServerClosed,
    /// 底层传输被关闭（网络中断、代理回收空闲连接等）
    #[serde(rename = "transport closed")]
    TransportClosed,
    /// 底层传输出错
    #[serde(rename = "transport error")]
    TransportError,
    /// 心跳超时
    #[serde(rename = "ping timeout")]
    PingTimeout,
    /// 本地调用 disconnect()
    #[serde(rename = "client closed")]
    ClientClosed,
}

impl DisconnectReason {
    /// 是否应当自动重连：只有本地主动断开不重连
    pub fn should_reconnect(&self) -> bool {
        !matches!(self, DisconnectReason::ClientClosed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ServerClosed => "server closed",
            DisconnectReason::TransportClosed => "transport closed",
            DisconnectReason::TransportError => "transport error",
            DisconnectReason::PingTimeout => "ping timeout",
            DisconnectReason::ClientClosed => "client closed",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务端下发的应用级错误码
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// 会话已被封禁：需要失效会话缓存并提示用户
    #[serde(rename = "CONVERSATION_BLOCKED")]
    ConversationBlocked,
    /// 发送过于频繁：仅提示
    #[serde(rename = "rate_limit_exceeded")]
    RateLimitExceeded,
    #[serde(untagged)]
    Other(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::ConversationBlocked => f.write_str("CONVERSATION_BLOCKED"),
            ErrorCode::RateLimitExceeded => f.write_str("rate_limit_exceeded"),
            ErrorCode::Other(code) => f.write_str(code),
        }
    }
}

/// 客户端收到的事件（服务端推送 + 本地连接生命周期）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum InboundEvent {
    /// 连接建立
    Connect,
    /// 连接断开
    Disconnect { reason: DisconnectReason },
    /// 建连失败
    ConnectError { error: String },
    /// 服务端心跳
    Ping,
    /// 应用级错误
    Error { code: ErrorCode, message: String },
    /// 新消息
    NewMessage { message: ChatMessage },
    /// 自己发出的消息已落库
    MessageSent { id: MessageId },
    /// 单条状态确认
    MessageStatus { id: MessageId, status: MessageStatus },
    /// 批量状态确认
    MessageStatusBatch {
        ids: Vec<MessageId>,
        status: MessageStatus,
    },
    /// 对方输入状态
    TypingIndicator { user_id: UserId, is_typing: bool },
    /// 会话封禁状态变化
    ConversationStatusUpdate { user_id: UserId, is_blocked: bool },
    /// 通知列表有更新
    NotificationUpdate,
    /// 重连次数耗尽，客户端进入静默状态
    ReconnectFailed { attempts: u32 },
    /// 本地分发落后，跳过了 `count` 个事件
    EventsSkipped { count: u64 },
}

/// 事件种类，监听器注册表以此为键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    ConnectError,
    Ping,
    Error,
    NewMessage,
    MessageSent,
    MessageStatus,
    MessageStatusBatch,
    TypingIndicator,
    ConversationStatusUpdate,
    NotificationUpdate,
    ReconnectFailed,
    EventsSkipped,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::ConnectError => "connect_error",
            EventKind::Ping => "ping",
            EventKind::Error => "error",
            EventKind::NewMessage => "new_message",
            EventKind::MessageSent => "message_sent",
            EventKind::MessageStatus => "message_status",
            EventKind::MessageStatusBatch => "message_status_batch",
            EventKind::TypingIndicator => "typing_indicator",
            EventKind::ConversationStatusUpdate => "conversation_status_update",
            EventKind::NotificationUpdate => "notification_update",
            EventKind::ReconnectFailed => "reconnect_failed",
            EventKind::EventsSkipped => "events_skipped",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            InboundEvent::Connect => EventKind::Connect,
            InboundEvent::Disconnect { .. } => EventKind::Disconnect,
            InboundEvent::ConnectError { .. } => EventKind::ConnectError,
            InboundEvent::Ping => EventKind::Ping,
            InboundEvent::Error { .. } => EventKind::Error,
            InboundEvent::NewMessage { .. } => EventKind::NewMessage,
            InboundEvent::MessageSent { .. } => EventKind::MessageSent,
            InboundEvent::MessageStatus { .. } => EventKind::MessageStatus,
            InboundEvent::MessageStatusBatch { .. } => EventKind::MessageStatusBatch,
            InboundEvent::TypingIndicator { .. } => EventKind::TypingIndicator,
            InboundEvent::ConversationStatusUpdate { .. } => EventKind::ConversationStatusUpdate,
            InboundEvent::NotificationUpdate => EventKind::NotificationUpdate,
            InboundEvent::ReconnectFailed { .. } => EventKind::ReconnectFailed,
            InboundEvent::EventsSkipped { .. } => EventKind::EventsSkipped,
        }
    }

    /// 创建应用级错误事件
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        InboundEvent::Error {
            code,
            message: message.into(),
        }
    }
}

/// 客户端上行事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// 发送私聊消息
    UserMessage { receiver_id: UserId, content: String },
    /// 单条状态更新
    MessageStatusUpdate {
        message_id: MessageId,
        status: MessageStatus,
    },
    /// 批量状态更新，服务端作为一次逻辑操作处理
    MessageStatusBatchUpdate {
        message_ids: Vec<MessageId>,
        status: MessageStatus,
    },
    /// 输入状态
    TypingIndicator { receiver_id: UserId, is_typing: bool },
    /// 请求刷新会话状态
    RefreshConversation { other_user_id: UserId, force: bool },
    /// 心跳响应
    Pong,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::UserMessage { .. } => "user_message",
            ClientEvent::MessageStatusUpdate { .. } => "message_status_update",
            ClientEvent::MessageStatusBatchUpdate { .. } => "message_status_batch_update",
            ClientEvent::TypingIndicator { .. } => "typing_indicator",
            ClientEvent::RefreshConversation { .. } => "refresh_conversation",
            ClientEvent::Pong => "pong",
        }
    }
}
