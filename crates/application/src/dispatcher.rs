//! 事件分发
//!
//! 按事件种类维护监听器列表。同一个回调重复注册只保留一份；
//! 单个监听器失败（返回错误或 panic）只记录日志，不影响其余监听器。

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use domain::{EventKind, InboundEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::channel::ChannelManager;

/// 事件监听器
pub type Listener = Arc<dyn Fn(&InboundEvent) -> anyhow::Result<()> + Send + Sync>;

struct Entry {
    id: u64,
    listener: Listener,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<Entry>>,
}

/// 监听器注册表
#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Mutex<Registry>>,
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册监听器；同一回调（同一个 Arc）重复注册返回已有的订阅
    pub fn add_listener(&self, kind: EventKind, listener: Listener) -> Subscription {
        let mut registry = self.lock();
        let next_id = registry.next_id;
        let entries = registry.listeners.entry(kind).or_default();

        let id = match entries.iter().find(|e| same_listener(&e.listener, &listener)) {
            Some(existing) => existing.id,
            None => {
                entries.push(Entry {
                    id: next_id,
                    listener,
                });
                registry.next_id += 1;
                next_id
            }
        };

        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// 以闭包注册，便捷写法
    pub fn on<F>(&self, kind: EventKind, f: F) -> Subscription
    where
        F: Fn(&InboundEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_listener(kind, Arc::new(f))
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock().listeners.get(&kind).map_or(0, Vec::len)
    }

    /// 同步调用该种类的全部监听器
    ///
    /// 调用前复制监听器快照，监听器内部可以安全地注册或注销。
    pub fn dispatch(&self, event: &InboundEvent) {
        let kind = event.kind();
        let snapshot: Vec<Listener> = self
            .lock()
            .listeners
            .get(&kind)
            .map(|entries| entries.iter().map(|e| e.listener.clone()).collect())
            .unwrap_or_default();

        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(event = %kind, error = %err, "事件监听器执行失败"),
                Err(_) => error!(event = %kind, "事件监听器 panic"),
            }
        }
    }

    /// 把通道事件泵入分发器，直到通道关闭
    pub fn bind(&self, channel: &ChannelManager) -> JoinHandle<()> {
        self.pump(channel.subscribe())
    }

    fn pump(&self, mut events: broadcast::Receiver<InboundEvent>) -> JoinHandle<()> {
        let dispatcher = self.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => dispatcher.dispatch(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        // 被跳过的事件无法找回，通知监听器按服务端状态重新对齐
                        warn!(skipped, "事件分发落后，部分事件被跳过");
                        dispatcher.dispatch(&InboundEvent::EventsSkipped { count: skipped });
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        lock_registry(&self.registry)
    }
}

fn lock_registry(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 监听器订阅凭据，调用 unsubscribe() 注销
#[must_use = "丢弃订阅凭据后无法再注销该监听器"]
#[derive(Debug, Clone)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// 注销监听器；注册表已释放或已注销时无操作
    pub fn unsubscribe(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = lock_registry(&registry);
        if let Some(entries) = registry.listeners.get_mut(&self.kind) {
            entries.retain(|e| e.id != self.id);
            if entries.is_empty() {
                registry.listeners.remove(&self.kind);
            }
        }
    }
}
