//! 持久通道管理器
//!
//! 进程内唯一的双工连接，负责：
//! - 幂等的 connect()：已连接返回现有句柄，建连中等待同一次尝试
//! - 按顺序协商传输方式，被拒绝时自动降级
//! - 服务端原因断开后按固定间隔重连，次数有上限；本地 disconnect() 不重连
//! - 应答服务端 ping，超时未收到 ping 视为连接失效
//!
//! 所有连接问题都以 [`InboundEvent`] 的形式广播给订阅者，send() 从不返回错误。

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use config::ChannelConfig;
use domain::{ClientEvent, DisconnectReason, DomainError, InboundEvent, TransportKind};
use once_cell::sync::OnceCell;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{ChannelError, TransportError};
use crate::transport::{
    ChannelLink, Connector, CredentialProvider, Delivery, EventSink, LinkEvent,
};

static GLOBAL_CHANNEL: OnceCell<Arc<ChannelManager>> = OnceCell::new();

/// 未启用心跳检测时的占位时长，对应分支被 select! 条件禁用
const IDLE_HEARTBEAT: Duration = Duration::from_secs(24 * 60 * 60);

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// 通道运行参数
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub transports: Vec<TransportKind>,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    /// None 表示不检测心跳超时
    pub heartbeat_timeout: Option<Duration>,
    pub event_buffer: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            transports: vec![TransportKind::WebSocket, TransportKind::Polling],
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            heartbeat_timeout: Some(Duration::from_secs(60)),
            event_buffer: 1024,
        }
    }
}

impl ChannelOptions {
    pub fn from_config(config: &ChannelConfig) -> Result<Self, DomainError> {
        let transports = config
            .transports
            .iter()
            .map(|name| TransportKind::from_str(name))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            transports,
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
            connect_timeout: config.connect_timeout(),
            heartbeat_timeout: (config.heartbeat_timeout_ms > 0)
                .then(|| config.heartbeat_timeout()),
            event_buffer: config.event_buffer,
        })
    }
}

/// 当前连接的句柄；同一连接周期内的所有克隆都指向同一条链路
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    epoch: u64,
    transport: TransportKind,
    sender: mpsc::UnboundedSender<ClientEvent>,
}

impl ConnectionHandle {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    fn send(&self, event: ClientEvent) -> Delivery {
        match self.sender.send(event) {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Dropped,
        }
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.epoch == other.epoch && self.sender.same_channel(&other.sender)
    }
}

impl Eq for ConnectionHandle {}

struct ChannelInner {
    /// 每次 connect() 从 Disconnected 启动或 disconnect() 时递增，旧会话据此失效
    epoch: u64,
    handle: Option<ConnectionHandle>,
    session: Option<JoinHandle<()>>,
    reconnect_attempts: u32,
    last_heartbeat: Option<Instant>,
}

pub struct ChannelManager {
    this: Weak<ChannelManager>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    options: ChannelOptions,
    events: broadcast::Sender<InboundEvent>,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<ChannelInner>,
}

impl ChannelManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        options: ChannelOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(options.event_buffer.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            connector,
            credentials,
            options,
            events,
            state,
            inner: Mutex::new(ChannelInner {
                epoch: 0,
                handle: None,
                session: None,
                reconnect_attempts: 0,
                last_heartbeat: None,
            }),
        })
    }

    /// 安装进程级单例
    pub fn install(manager: Arc<ChannelManager>) -> Result<Arc<ChannelManager>, ChannelError> {
        GLOBAL_CHANNEL
            .set(manager.clone())
            .map_err(|_| ChannelError::AlreadyInstalled)?;
        Ok(manager)
    }

    /// 获取进程级单例
    pub fn global() -> Option<Arc<ChannelManager>> {
        GLOBAL_CHANNEL.get().cloned()
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// 订阅通道事件；订阅之前发生的事件不会补发
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.lock().last_heartbeat
    }

    /// 建立（或复用）连接
    pub async fn connect(&self) -> Result<ConnectionHandle, ChannelError> {
        let state_rx = {
            let mut inner = self.lock();
            match self.state() {
                ConnectionState::Connected => {
                    if let Some(handle) = inner.handle.clone() {
                        return Ok(handle);
                    }
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    debug!("连接尝试进行中，等待同一次尝试完成");
                }
                ConnectionState::Disconnected => self.start_session(&mut inner),
            }
            self.state.subscribe()
        };

        self.wait_connected(state_rx).await
    }

    /// 本地主动断开：不会触发自动重连
    pub fn disconnect(&self) {
        let (session, was_active) = {
            let mut inner = self.lock();
            inner.epoch += 1;
            inner.handle = None;
            inner.reconnect_attempts = 0;
            let was_active = self.state() != ConnectionState::Disconnected;
            self.state.send_replace(ConnectionState::Disconnected);
            (inner.session.take(), was_active)
        };

        if let Some(session) = session {
            session.abort();
        }

        if was_active {
            info!("通道已由本地断开");
            self.publish(InboundEvent::Disconnect {
                reason: DisconnectReason::ClientClosed,
            });
        }
    }

    /// 发送上行事件；连接不可用时先触发重连，连上后再写入，不做排队
    pub async fn send(&self, event: ClientEvent) -> Delivery {
        let current = self.current_handle();
        let handle = match current {
            Some(handle) => handle,
            None => match self.connect().await {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(event = event.name(), error = %err, "通道不可用，丢弃上行事件");
                    return Delivery::Dropped;
                }
            },
        };

        let delivery = handle.send(event);
        if !delivery.is_sent() {
            warn!(epoch = handle.epoch(), "连接已失效，上行事件被丢弃");
        }
        delivery
    }

    /// 与调用方超时赛跑的发送；已写入的数据无法撤回
    pub async fn send_with_timeout(&self, event: ClientEvent, limit: Duration) -> Delivery {
        match timeout(limit, self.send(event)).await {
            Ok(delivery) => delivery,
            Err(_) => Delivery::TimedOut,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_handle(&self) -> Option<ConnectionHandle> {
        if !self.is_connected() {
            return None;
        }
        self.lock().handle.clone().filter(ConnectionHandle::is_open)
    }

    fn publish(&self, event: InboundEvent) {
        if self.events.send(event).is_err() {
            debug!("当前没有通道事件订阅者");
        }
    }

    fn start_session(&self, inner: &mut ChannelInner) {
        // 管理器正在析构时不再启动会话
        let Some(manager) = self.this.upgrade() else {
            return;
        };
        inner.epoch += 1;
        inner.reconnect_attempts = 0;
        inner.handle = None;
        self.state.send_replace(ConnectionState::Connecting);

        let epoch = inner.epoch;
        inner.session = Some(tokio::spawn(async move {
            manager.run_session(epoch).await;
        }));
    }

    async fn wait_connected(
        &self,
        mut state_rx: watch::Receiver<ConnectionState>,
    ) -> Result<ConnectionHandle, ChannelError> {
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                ConnectionState::Connected => {
                    return self.lock().handle.clone().ok_or(ChannelError::Unavailable);
                }
                ConnectionState::Disconnected => return Err(ChannelError::Unavailable),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
            }
            state_rx
                .changed()
                .await
                .map_err(|_| ChannelError::Unavailable)?;
        }
    }

    /// 仅当会话仍属于当前周期时执行变更
    fn with_epoch<R>(&self, epoch: u64, f: impl FnOnce(&mut ChannelInner) -> R) -> Option<R> {
        let mut inner = self.lock();
        (inner.epoch == epoch).then(|| f(&mut inner))
    }

    async fn run_session(self: Arc<Self>, epoch: u64) {
        loop {
            match self.negotiate().await {
                Ok((transport, link)) => {
                    let reason = self.drive(epoch, transport, link).await;
                    if self.with_epoch(epoch, |_| ()).is_none() {
                        return;
                    }
                    info!(%reason, epoch, "通道断开");
                    self.publish(InboundEvent::Disconnect { reason });
                    if !reason.should_reconnect() {
                        self.with_epoch(epoch, |_| {
                            self.state.send_replace(ConnectionState::Disconnected);
                        });
                        return;
                    }
                }
                Err(err) => {
                    warn!(error = %err, epoch, "通道建立失败");
                    self.publish(InboundEvent::ConnectError {
                        error: err.to_string(),
                    });
                }
            }

            let max_attempts = self.options.reconnect_attempts;
            let attempt = self.with_epoch(epoch, |inner| {
                inner.handle = None;
                inner.reconnect_attempts += 1;
                let attempt = inner.reconnect_attempts;
                if attempt > max_attempts {
                    inner.session = None;
                    self.state.send_replace(ConnectionState::Disconnected);
                } else {
                    self.state.send_replace(ConnectionState::Reconnecting);
                }
                attempt
            });

            let Some(attempt) = attempt else { return };
            if attempt > max_attempts {
                warn!(attempts = max_attempts, "重连次数耗尽，等待下一次显式 connect()");
                self.publish(InboundEvent::ReconnectFailed {
                    attempts: max_attempts,
                });
                return;
            }

            info!(attempt, max_attempts, delay = ?self.options.reconnect_delay, "计划重连");
            sleep(self.options.reconnect_delay).await;
        }
    }

    /// 依次尝试配置的传输方式，凭据每次重新读取
    async fn negotiate(&self) -> Result<(TransportKind, ChannelLink), TransportError> {
        let credential = self.credentials.credential().await?;
        let mut last_error = TransportError::NoTransport;

        for &transport in &self.options.transports {
            debug!(%transport, "尝试建立通道");
            match timeout(
                self.options.connect_timeout,
                self.connector.open(transport, &credential),
            )
            .await
            {
                Ok(Ok(link)) => return Ok((transport, link)),
                Ok(Err(err)) if err.is_auth() => return Err(err),
                Ok(Err(err)) => {
                    warn!(%transport, error = %err, "传输协商失败，尝试下一种传输");
                    last_error = err;
                }
                Err(_) => {
                    warn!(%transport, "传输建连超时，尝试下一种传输");
                    last_error = TransportError::Timeout;
                }
            }
        }

        Err(last_error)
    }

    /// 驱动一条已建立的链路直到其关闭，返回断开原因
    async fn drive(&self, epoch: u64, transport: TransportKind, link: ChannelLink) -> DisconnectReason {
        let (sender, mut commands) = mpsc::unbounded_channel::<ClientEvent>();
        let handle = ConnectionHandle {
            epoch,
            transport,
            sender,
        };

        let installed = self.with_epoch(epoch, |inner| {
            inner.handle = Some(handle);
            inner.reconnect_attempts = 0;
            inner.last_heartbeat = Some(Instant::now());
            self.state.send_replace(ConnectionState::Connected);
        });
        if installed.is_none() {
            return DisconnectReason::ClientClosed;
        }

        info!(%transport, epoch, "通道已连接");
        self.publish(InboundEvent::Connect);

        let ChannelLink {
            outbound,
            mut inbound,
        } = link;
        let heartbeat_timeout = self.options.heartbeat_timeout;
        let heartbeat = sleep(heartbeat_timeout.unwrap_or(IDLE_HEARTBEAT));
        tokio::pin!(heartbeat);

        let reason = loop {
            tokio::select! {
                incoming = inbound.recv() => match incoming {
                    Some(LinkEvent::Event(InboundEvent::Ping)) => {
                        let now = Instant::now();
                        self.with_epoch(epoch, |inner| inner.last_heartbeat = Some(now));
                        if let Some(limit) = heartbeat_timeout {
                            heartbeat.as_mut().reset(now + limit);
                        }
                        if outbound.send(ClientEvent::Pong).is_err() {
                            break DisconnectReason::TransportClosed;
                        }
                        self.publish(InboundEvent::Ping);
                    }
                    Some(LinkEvent::Event(event)) => self.publish(event),
                    Some(LinkEvent::Closed(reason)) => break reason,
                    None => break DisconnectReason::TransportClosed,
                },
                Some(command) = commands.recv() => {
                    if outbound.send(command).is_err() {
                        break DisconnectReason::TransportClosed;
                    }
                }
                () = &mut heartbeat, if heartbeat_timeout.is_some() => {
                    warn!(epoch, "心跳超时，关闭连接");
                    break DisconnectReason::PingTimeout;
                }
            }
        };

        self.with_epoch(epoch, |inner| {
            inner.handle = None;
            self.state.send_replace(ConnectionState::Reconnecting);
        });
        reason
    }
}

#[async_trait]
impl EventSink for ChannelManager {
    async fn emit(&self, event: ClientEvent) -> Delivery {
        self.send(event).await
    }
}
