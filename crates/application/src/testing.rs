//! 测试替身：内存链路、记录型缓存与事件出口

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use domain::{ClientEvent, DisconnectReason, InboundEvent, TransportKind};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::invalidation::{QueryCache, QueryKey};
use crate::transport::{ChannelLink, Connector, Credential, Delivery, EventSink, LinkEvent};

/// 某种传输被打开时的行为
#[derive(Debug, Clone)]
pub enum OpenBehavior {
    Accept,
    Fail(TransportError),
}

/// 服务端一侧的链路，用于注入事件或关闭连接
#[derive(Debug, Clone)]
pub struct RemoteEnd {
    inbound: mpsc::UnboundedSender<LinkEvent>,
}

impl RemoteEnd {
    pub fn deliver(&self, event: InboundEvent) -> bool {
        self.inbound.send(LinkEvent::Event(event)).is_ok()
    }

    pub fn close(&self, reason: DisconnectReason) {
        let _ = self.inbound.send(LinkEvent::Closed(reason));
    }
}

#[derive(Default)]
struct ConnectorState {
    behaviors: HashMap<TransportKind, OpenBehavior>,
    opened: Vec<TransportKind>,
    credentials: Vec<String>,
    remotes: Vec<RemoteEnd>,
}

/// 内存连接器：记录每次打开，并保留最近一条链路的上行队列
pub struct MemoryConnector {
    open_delay: Duration,
    state: Mutex<ConnectorState>,
    outbound: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Self::delayed(Duration::ZERO)
    }

    /// 每次打开前等待 `delay`，用于构造并发建连
    pub fn delayed(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            open_delay: delay,
            state: Mutex::new(ConnectorState::default()),
            outbound: tokio::sync::Mutex::new(None),
        })
    }

    pub fn set_behavior(&self, transport: TransportKind, behavior: OpenBehavior) {
        self.lock().behaviors.insert(transport, behavior);
    }

    /// 包括失败在内的打开次数
    pub fn open_count(&self) -> usize {
        self.lock().opened.len()
    }

    pub fn opened_transports(&self) -> Vec<TransportKind> {
        self.lock().opened.clone()
    }

    pub fn credentials_seen(&self) -> Vec<String> {
        self.lock().credentials.clone()
    }

    pub fn last_endpoint(&self) -> Option<RemoteEnd> {
        self.lock().remotes.last().cloned()
    }

    /// 读取最近一条链路上客户端写出的下一个事件
    pub async fn next_outbound(&self) -> Option<ClientEvent> {
        let mut guard = self.outbound.lock().await;
        guard.as_mut()?.recv().await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(
        &self,
        transport: TransportKind,
        credential: &Credential,
    ) -> Result<ChannelLink, TransportError> {
        let behavior = {
            let mut state = self.lock();
            state.opened.push(transport);
            state.credentials.push(credential.token().to_string());
            state
                .behaviors
                .get(&transport)
                .cloned()
                .unwrap_or(OpenBehavior::Accept)
        };

        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        match behavior {
            OpenBehavior::Fail(err) => Err(err),
            OpenBehavior::Accept => {
                let (link, endpoint) = ChannelLink::pair();
                self.lock().remotes.push(RemoteEnd {
                    inbound: endpoint.inbound,
                });
                *self.outbound.lock().await = Some(endpoint.outbound);
                Ok(link)
            }
        }
    }
}

/// 记录每次失效调用及其发生时间
#[derive(Default)]
pub struct RecordingQueryCache {
    calls: Mutex<Vec<(QueryKey, Instant)>>,
}

impl RecordingQueryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<(QueryKey, Instant)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.calls().into_iter().map(|(key, _)| key).collect()
    }

    pub fn count_for(&self, key: &QueryKey) -> usize {
        self.calls().iter().filter(|(k, _)| k == key).count()
    }
}

#[async_trait]
impl QueryCache for RecordingQueryCache {
    async fn invalidate(&self, key: &QueryKey) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((key.clone(), Instant::now()));
    }
}

/// 记录上行事件的出口，可切换为丢弃模式
pub struct RecordingSink {
    delivery: Mutex<Delivery>,
    events: Mutex<Vec<ClientEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            delivery: Mutex::new(Delivery::Sent),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn set_delivery(&self, delivery: Delivery) {
        *self.delivery.lock().unwrap_or_else(PoisonError::into_inner) = delivery;
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, event: ClientEvent) -> Delivery {
        let delivery = *self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        if delivery.is_sent() {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event);
        }
        delivery
    }
}
