//! 在线会话表
//!
//! 每个通道会话（WebSocket 或长轮询）登记一个下行队列；同一用户可以同时有多个会话，
//! 推送给用户即推送给他的全部会话。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use domain::{InboundEvent, UserId};
use tokio::sync::mpsc;
use tracing::debug;

/// 会话标识，进程内唯一
pub type SessionId = u64;

/// 某个用户的某个会话
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub user: UserId,
    pub session: SessionId,
}

#[derive(Default)]
pub struct SessionHub {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<UserId, HashMap<SessionId, mpsc::UnboundedSender<InboundEvent>>>>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(
        &self,
    ) -> MutexGuard<'_, HashMap<UserId, HashMap<SessionId, mpsc::UnboundedSender<InboundEvent>>>>
    {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 登记新会话，返回会话标识与下行队列
    pub fn register(&self, user: UserId) -> (Peer, mpsc::UnboundedReceiver<InboundEvent>) {
        let session = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions().entry(user).or_default().insert(session, tx);
        debug!(%user, session, "通道会话已登记");
        (Peer { user, session }, rx)
    }

    pub fn unregister(&self, peer: Peer) {
        let mut sessions = self.sessions();
        if let Some(user_sessions) = sessions.get_mut(&peer.user) {
            user_sessions.remove(&peer.session);
            if user_sessions.is_empty() {
                sessions.remove(&peer.user);
            }
        }
        debug!(user = %peer.user, session = peer.session, "通道会话已注销");
    }

    /// 推送给用户的全部会话，返回送达的会话数
    pub fn send_to_user(&self, user: UserId, event: &InboundEvent) -> usize {
        self.sessions()
            .get(&user)
            .map(|user_sessions| {
                user_sessions
                    .values()
                    .filter(|tx| tx.send(event.clone()).is_ok())
                    .count()
            })
            .unwrap_or(0)
    }

    /// 只回复发起请求的那个会话
    pub fn send_to_peer(&self, peer: Peer, event: InboundEvent) -> bool {
        self.sessions()
            .get(&peer.user)
            .and_then(|user_sessions| user_sessions.get(&peer.session))
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.sessions().contains_key(&user)
    }

    pub fn session_count(&self) -> usize {
        self.sessions().values().map(HashMap::len).sum()
    }
}
