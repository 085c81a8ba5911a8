//! 事件到缓存失效的路由，以及面向用户的提示

use std::sync::Arc;
use std::time::Duration;

use config::InvalidationConfig;
use domain::{ErrorCode, EventKind, InboundEvent};
use tracing::{debug, info, warn};

use crate::dispatcher::{EventDispatcher, Subscription};
use crate::invalidation::{InvalidationCoordinator, QueryKey};
use crate::query_key;
use crate::status::StatusLedger;

pub const CONVERSATIONS: &str = "conversations";
pub const MESSAGES: &str = "messages";
pub const CONVERSATION_STATUS: &str = "conversation-status";
pub const NOTIFICATIONS: &str = "notifications";

/// 需要展示给用户的提示
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// 会话已被封禁
    ConversationBlocked { message: String },
    /// 发送过于频繁，短暂提示即可
    RateLimited { message: String },
    /// 重连耗尽，连接已放弃
    ConnectionLost { attempts: u32 },
}

/// 提示出口（UI 层实现）
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait NoticeSink: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// 仅写日志的提示出口，用于无界面的进程
#[derive(Debug, Default, Clone)]
pub struct TracingNoticeSink;

impl NoticeSink for TracingNoticeSink {
    fn notify(&self, notice: Notice) {
        match notice {
            Notice::ConversationBlocked { message } => warn!(%message, "会话已封禁"),
            Notice::RateLimited { message } => info!(%message, "发送过于频繁"),
            Notice::ConnectionLost { attempts } => warn!(attempts, "实时连接已断开"),
        }
    }
}

/// 失效窗口参数
#[derive(Debug, Clone, Copy)]
pub struct RouteTimings {
    pub debounce_window: Duration,
    pub rate_limit_interval: Duration,
}

impl Default for RouteTimings {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(300),
            rate_limit_interval: Duration::from_secs(2),
        }
    }
}

impl From<&InvalidationConfig> for RouteTimings {
    fn from(config: &InvalidationConfig) -> Self {
        Self {
            debounce_window: config.debounce_window(),
            rate_limit_interval: config.rate_limit_interval(),
        }
    }
}

/// 把通道事件映射为失效请求
#[derive(Clone)]
pub struct InvalidationRoutes {
    coordinator: InvalidationCoordinator,
    ledger: Arc<StatusLedger>,
    notices: Arc<dyn NoticeSink>,
    timings: RouteTimings,
}

impl InvalidationRoutes {
    pub fn new(
        coordinator: InvalidationCoordinator,
        ledger: Arc<StatusLedger>,
        notices: Arc<dyn NoticeSink>,
        timings: RouteTimings,
    ) -> Self {
        Self {
            coordinator,
            ledger,
            notices,
            timings,
        }
    }

    /// 在分发器上注册全部路由，返回各自的订阅凭据
    pub fn attach(&self, dispatcher: &EventDispatcher) -> Vec<Subscription> {
        [
            EventKind::Connect,
            EventKind::Disconnect,
            EventKind::NewMessage,
            EventKind::MessageSent,
            EventKind::MessageStatus,
            EventKind::MessageStatusBatch,
            EventKind::ConversationStatusUpdate,
            EventKind::NotificationUpdate,
            EventKind::Error,
            EventKind::ReconnectFailed,
            EventKind::EventsSkipped,
        ]
        .into_iter()
        .map(|kind| {
            let routes = self.clone();
            dispatcher.on(kind, move |event| {
                routes.route(event);
                Ok(())
            })
        })
        .collect()
    }

    /// 处理单个事件
    pub fn route(&self, event: &InboundEvent) {
        let window = self.timings.debounce_window;
        let interval = self.timings.rate_limit_interval;

        match event {
            InboundEvent::Connect | InboundEvent::MessageSent { .. } => {
                self.coordinator.debounce(query_key![CONVERSATIONS], window);
            }
            InboundEvent::Disconnect { reason } => {
                // 断开前写出的状态可能未被服务端处理，交给上层重试
                let discarded = self.ledger.discard_unconfirmed();
                if discarded > 0 {
                    debug!(%reason, discarded, "丢弃未确认的消息状态");
                    self.coordinator.debounce(query_key![MESSAGES], window);
                }
            }
            InboundEvent::NewMessage { message } => {
                self.coordinator.debounce(query_key![CONVERSATIONS], window);
                self.coordinator
                    .debounce(query_key![MESSAGES, message.sender_id], window);
            }
            InboundEvent::MessageStatus { id, status } => {
                self.ledger.confirm(*id, *status);
                self.coordinator.debounce(query_key![MESSAGES], window);
            }
            InboundEvent::MessageStatusBatch { ids, status } => {
                for id in ids {
                    self.ledger.confirm(*id, *status);
                }
                self.coordinator.debounce(query_key![MESSAGES], window);
            }
            InboundEvent::ConversationStatusUpdate { user_id, .. } => {
                self.coordinator
                    .rate_limited(query_key![CONVERSATION_STATUS, *user_id], interval);
            }
            InboundEvent::NotificationUpdate => {
                self.coordinator
                    .rate_limited(query_key![NOTIFICATIONS], interval);
            }
            InboundEvent::Error { code, message } => match code {
                ErrorCode::ConversationBlocked => {
                    self.coordinator
                        .invalidate_now(query_key![CONVERSATION_STATUS]);
                    self.notices.notify(Notice::ConversationBlocked {
                        message: message.clone(),
                    });
                }
                ErrorCode::RateLimitExceeded => {
                    self.notices.notify(Notice::RateLimited {
                        message: message.clone(),
                    });
                }
                ErrorCode::Other(other) => warn!(code = %other, %message, "未处理的服务端错误"),
            },
            InboundEvent::EventsSkipped { count } => {
                // 可能漏掉了新消息与状态确认
                warn!(count, "分发落后，重新拉取消息与会话");
                self.coordinator.debounce(query_key![CONVERSATIONS], window);
                self.coordinator.debounce(query_key![MESSAGES], window);
            }
            InboundEvent::ReconnectFailed { attempts } => {
                self.notices.notify(Notice::ConnectionLost {
                    attempts: *attempts,
                });
            }
            _ => {}
        }
    }
}

/// 会话状态查询键
pub fn conversation_status_key(user: impl Into<crate::invalidation::KeySegment>) -> QueryKey {
    query_key![CONVERSATION_STATUS].with(user)
}
