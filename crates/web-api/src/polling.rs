//! 长轮询通道会话
//!
//! `POST /channel/sessions` 创建会话并登记到会话表；`GET .../events` 挂起直到有下行事件，
//! 等待超时则返回一个 ping，既保持连接也充当心跳。事件持续到达时，每隔 `ping_interval`
//! 也在批次末尾附带一个 ping。长时间没有拉取的会话由清理任务回收。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use domain::{ClientEvent, InboundEvent};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::hub::{Peer, SessionHub};
use crate::protocol::handle_client_event;
use crate::state::AppState;

/// 单次拉取最多返回的事件数
const MAX_EVENTS_PER_POLL: usize = 64;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub session_id: String,
}

struct PollSession {
    peer: Peer,
    events: AsyncMutex<mpsc::UnboundedReceiver<InboundEvent>>,
    last_seen: Mutex<Instant>,
    last_ping: Mutex<Instant>,
}

impl PollSession {
    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn mark_pinged(&self) {
        *self.last_ping.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// 距上次下发 ping 已超过 `interval` 时重新计时并返回 true
    fn ping_due(&self, interval: Duration) -> bool {
        let mut last_ping = self.last_ping.lock().unwrap_or_else(PoisonError::into_inner);
        if last_ping.elapsed() >= interval {
            *last_ping = Instant::now();
            true
        } else {
            false
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

#[derive(Default)]
pub struct PollingSessions {
    sessions: Mutex<HashMap<String, Arc<PollSession>>>,
}

impl PollingSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<PollSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, hub: &SessionHub, user: domain::UserId) -> String {
        let (peer, events) = hub.register(user);
        let id = Uuid::new_v4().simple().to_string();
        self.sessions().insert(
            id.clone(),
            Arc::new(PollSession {
                peer,
                events: AsyncMutex::new(events),
                last_seen: Mutex::new(Instant::now()),
                last_ping: Mutex::new(Instant::now()),
            }),
        );
        id
    }

    /// 会话只对创建它的用户可见
    fn find(&self, id: &str, user: domain::UserId) -> Option<Arc<PollSession>> {
        self.sessions()
            .get(id)
            .filter(|session| session.peer.user == user)
            .cloned()
    }

    fn remove(&self, id: &str) -> Option<Arc<PollSession>> {
        self.sessions().remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 回收空闲超过 `max_idle` 的会话，返回回收的会话
    fn take_idle(&self, max_idle: Duration) -> Vec<Peer> {
        let mut sessions = self.sessions();
        let idle: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.idle_for() > max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        idle.iter()
            .filter_map(|id| sessions.remove(id))
            .map(|session| session.peer)
            .collect()
    }
}

/// 周期性回收客户端已消失却没有删除的会话，顺带清理过期的消息配额
pub fn spawn_reaper(state: &AppState) -> JoinHandle<()> {
    let max_idle = state.server.poll_wait() * 3;
    let sessions = Arc::downgrade(&state.polling);
    let hub = Arc::downgrade(&state.hub);
    let limiter = Arc::downgrade(&state.rate_limiter);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(max_idle);
        loop {
            ticker.tick().await;
            let (Some(sessions), Some(hub), Some(limiter)) =
                (Weak::upgrade(&sessions), Weak::upgrade(&hub), Weak::upgrade(&limiter))
            else {
                break;
            };
            let reaped = sessions.take_idle(max_idle);
            for peer in &reaped {
                hub.unregister(*peer);
                limiter.remove_connection(peer.user);
            }
            if !reaped.is_empty() {
                info!(count = reaped.len(), "回收空闲长轮询会话");
            }
            let expired = limiter.cleanup_expired_quotas();
            if expired > 0 {
                debug!(count = expired, "清理过期消息配额");
            }
        }
    })
}

pub async fn create_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<SessionCreated>, ApiError> {
    state
        .rate_limiter
        .add_connection(user)
        .map_err(|err| ApiError::too_many_requests(err.to_string()))?;

    let session_id = state.polling.open(&state.hub, user);
    info!(%user, %session_id, "长轮询会话已创建");
    Ok(Json(SessionCreated { session_id }))
}

pub async fn poll_events(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<InboundEvent>>, ApiError> {
    let session = state
        .polling
        .find(&session_id, user)
        .ok_or_else(|| ApiError::not_found("unknown session"))?;
    session.touch();

    let mut events = session.events.lock().await;
    let mut batch = match timeout(state.server.poll_wait(), events.recv()).await {
        Ok(Some(first)) => {
            let mut batch = vec![first];
            while batch.len() < MAX_EVENTS_PER_POLL {
                match events.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(_) => break,
                }
            }
            batch
        }
        Ok(None) => {
            return Err(ApiError::new(
                StatusCode::GONE,
                "SESSION_CLOSED",
                "session closed",
            ))
        }
        Err(_) => Vec::new(),
    };
    drop(events);

    if batch.is_empty() {
        session.mark_pinged();
        batch.push(InboundEvent::Ping);
    } else if session.ping_due(state.server.ping_interval()) {
        batch.push(InboundEvent::Ping);
    }
    session.touch();
    debug!(%session_id, count = batch.len(), "长轮询返回事件");
    Ok(Json(batch))
}

pub async fn submit_event(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<String>,
    Json(event): Json<ClientEvent>,
) -> Result<StatusCode, ApiError> {
    let session = state
        .polling
        .find(&session_id, user)
        .ok_or_else(|| ApiError::not_found("unknown session"))?;
    session.touch();

    handle_client_event(&state, session.peer, event).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn close_session(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.polling.find(&session_id, user).is_none() {
        return Err(ApiError::not_found("unknown session"));
    }
    if let Some(session) = state.polling.remove(&session_id) {
        state.hub.unregister(session.peer);
        state.rate_limiter.remove_connection(user);
        info!(%user, %session_id, "长轮询会话已关闭");
    }
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::UserId;

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_taken_and_active_ones_kept() {
        let hub = SessionHub::new();
        let sessions = PollingSessions::new();
        let (alice, bob) = (UserId(Uuid::new_v4()), UserId(Uuid::new_v4()));

        let stale = sessions.open(&hub, alice);
        let active = sessions.open(&hub, bob);
        tokio::time::advance(Duration::from_secs(30)).await;
        sessions.find(&active, bob).unwrap().touch();
        tokio::time::advance(Duration::from_secs(30)).await;

        let reaped = sessions.take_idle(Duration::from_secs(45));
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].user, alice);
        assert!(sessions.find(&stale, alice).is_none());
        assert!(sessions.find(&active, bob).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn ping_is_due_once_per_interval() {
        let hub = SessionHub::new();
        let sessions = PollingSessions::new();
        let user = UserId(Uuid::new_v4());
        let id = sessions.open(&hub, user);
        let session = sessions.find(&id, user).unwrap();
        let interval = Duration::from_secs(1);

        assert!(!session.ping_due(interval));
        tokio::time::advance(Duration::from_millis(1_100)).await;
        assert!(session.ping_due(interval));
        assert!(!session.ping_due(interval));

        // 空闲超时下发的 ping 同样重新计时
        tokio::time::advance(Duration::from_millis(900)).await;
        session.mark_pinged();
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!session.ping_due(interval));
    }

    #[tokio::test]
    async fn sessions_are_private_to_their_owner() {
        let hub = SessionHub::new();
        let sessions = PollingSessions::new();
        let (alice, mallory) = (UserId(Uuid::new_v4()), UserId(Uuid::new_v4()));

        let id = sessions.open(&hub, alice);
        assert!(sessions.find(&id, mallory).is_none());
        assert!(sessions.find(&id, alice).is_some());
        assert_eq!(sessions.len(), 1);
    }
}
