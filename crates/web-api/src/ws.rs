//! WebSocket 通道会话
//!
//! 发送任务独占 socket 的写半边，合并下行事件、心跳 ping 与控制帧；
//! 接收任务解析上行事件并交给协议处理。任一任务结束即视为连接断开。

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use domain::{ClientEvent, InboundEvent};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::hub::Peer;
use crate::protocol::handle_client_event;
use crate::state::AppState;

pub async fn websocket_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Response, ApiError> {
    state
        .rate_limiter
        .add_connection(user)
        .map_err(|err| ApiError::too_many_requests(err.to_string()))?;

    let limiter = state.rate_limiter.clone();
    Ok(ws
        .on_failed_upgrade(move |err| {
            warn!(%user, error = %err, "WebSocket 升级失败");
            limiter.remove_connection(user);
        })
        .on_upgrade(move |socket| async move {
            let (peer, events) = state.hub.register(user);
            WebSocketSession { state, peer }.run(socket, events).await;
        }))
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    Event(InboundEvent),
    Pong(Vec<u8>),
}

struct WebSocketSession {
    state: AppState,
    peer: Peer,
}

impl WebSocketSession {
    async fn run(self, socket: WebSocket, mut events: mpsc::UnboundedReceiver<InboundEvent>) {
        info!(user = %self.peer.user, session = self.peer.session, "WebSocket 连接已建立");
        let (mut sender, mut incoming) = socket.split();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        let ping_period = self.state.server.ping_interval();
        let mut send_task = tokio::spawn(async move {
            let mut ping = interval_at(Instant::now() + ping_period, ping_period);
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let frame = tokio::select! {
                    Some(event) = events.recv() => encode(&event),
                    Some(cmd) = cmd_rx.recv() => match cmd {
                        WsCommand::Event(event) => encode(&event),
                        WsCommand::Pong(data) => Some(WsMessage::Pong(data.into())),
                    },
                    _ = ping.tick() => encode(&InboundEvent::Ping),
                };
                let Some(frame) = frame else { continue };
                if sender.send(frame).await.is_err() {
                    warn!("WebSocket 写入失败");
                    break;
                }
            }
            let _ = sender.send(WsMessage::Close(None)).await;
        });

        let state = self.state.clone();
        let peer = self.peer;
        let mut recv_task = tokio::spawn(async move {
            while let Some(Ok(message)) = incoming.next().await {
                match message {
                    WsMessage::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => handle_client_event(&state, peer, event).await,
                        Err(err) => {
                            warn!(error = %err, "无法解析的上行事件");
                            let event = InboundEvent::error(
                                domain::ErrorCode::Other("BAD_EVENT".to_string()),
                                err.to_string(),
                            );
                            if cmd_tx.send(WsCommand::Event(event)).await.is_err() {
                                break;
                            }
                        }
                    },
                    WsMessage::Ping(data) => {
                        if cmd_tx.send(WsCommand::Pong(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Close(_) => {
                        debug!("WebSocket 收到关闭帧");
                        break;
                    }
                    WsMessage::Pong(_) | WsMessage::Binary(_) => {}
                }
            }
        });

        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }

        self.state.hub.unregister(self.peer);
        self.state.rate_limiter.remove_connection(self.peer.user);
        info!(user = %self.peer.user, session = self.peer.session, "WebSocket 连接已断开");
    }
}

fn encode(event: &InboundEvent) -> Option<WsMessage> {
    match serde_json::to_string(event) {
        Ok(json) => Some(WsMessage::Text(json.into())),
        Err(err) => {
            warn!(error = %err, "下行事件序列化失败");
            None
        }
    }
}
