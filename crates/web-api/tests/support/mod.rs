use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use application::{
    ChannelManager, ChannelOptions, Credential, MessageRateLimiter, StaticCredential,
};
use config::AppConfig;
use domain::{ClientEvent, InboundEvent, TransportKind, UserId};
use infrastructure::{DefaultConnector, Infrastructure, ServerEndpoint};
use tokio::{net::TcpListener, sync::broadcast, sync::oneshot};
use uuid::Uuid;
use web_api::{router, spawn_reaper, AppState, JwtService};

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(MessageRateLimiter::default()).await
    }

    pub async fn start_with(rate_limiter: MessageRateLimiter) -> Self {
        let mut config = AppConfig::default();
        config.server.ping_interval_ms = 1_000;
        config.server.poll_wait_ms = 500;

        let infrastructure = Infrastructure::in_memory(&config);
        let state = AppState::new(
            Arc::new(infrastructure.conversation_service()),
            Arc::new(JwtService::new(config.jwt.clone())),
            config.server.clone(),
        )
        .with_rate_limiter(rate_limiter);
        spawn_reaper(&state);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint::new(self.base_url())
    }

    pub fn token(&self, user: UserId) -> String {
        self.state.jwt_service.generate_token(user).expect("token")
    }

    /// 以 `user` 身份建立客户端通道（尚未连接）
    pub fn channel(&self, user: UserId, transports: Vec<TransportKind>) -> Arc<ChannelManager> {
        self.channel_with_heartbeat(user, transports, Duration::from_secs(5))
    }

    pub fn channel_with_heartbeat(
        &self,
        user: UserId,
        transports: Vec<TransportKind>,
        heartbeat_timeout: Duration,
    ) -> Arc<ChannelManager> {
        ChannelManager::new(
            DefaultConnector::shared(self.endpoint(), Duration::from_secs(5)),
            Arc::new(StaticCredential(Credential::new(self.token(user)))),
            ChannelOptions {
                transports,
                reconnect_attempts: 2,
                reconnect_delay: Duration::from_millis(100),
                connect_timeout: Duration::from_secs(2),
                heartbeat_timeout: Some(heartbeat_timeout),
                event_buffer: 256,
            },
        )
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub fn new_user() -> UserId {
    UserId(Uuid::new_v4())
}

/// 等待第一个满足条件的事件
pub async fn expect_event<F>(events: &mut broadcast::Receiver<InboundEvent>, mut matches: F) -> InboundEvent
where
    F: FnMut(&InboundEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

/// 连接并做一次往返，确保服务端已登记该会话
pub async fn connect_ready(
    channel: &ChannelManager,
    events: &mut broadcast::Receiver<InboundEvent>,
) {
    channel.connect().await.expect("channel connects");
    let stranger = new_user();
    channel
        .send(ClientEvent::RefreshConversation {
            other_user_id: stranger,
            force: false,
        })
        .await;
    expect_event(events, |event| {
        matches!(event, InboundEvent::ConversationStatusUpdate { user_id, .. } if *user_id == stranger)
    })
    .await;
}
