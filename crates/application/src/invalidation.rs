//! 查询缓存失效协调
//!
//! 推送事件频繁到达时，直接失效会引发大量重复的重新拉取。
//! 这里按查询键合并失效请求：
//! - Debounce：窗口内的多次请求只在最后一次之后执行一次
//! - RateLimited：距上次执行不足最小间隔的请求直接丢弃

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use domain::{MessageId, UserId};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};
use uuid::Uuid;

/// 查询键的一段；数字和 UUID 统一成规范形式，保证 "42" 与 42 命中同一个键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeySegment {
    Number(i64),
    Text(String),
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        if let Ok(number) = value.parse::<i64>() {
            return KeySegment::Number(number);
        }
        if let Ok(uuid) = Uuid::parse_str(value) {
            return KeySegment::Text(uuid.to_string());
        }
        KeySegment::Text(value.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        KeySegment::from(value.as_str())
    }
}

impl From<i64> for KeySegment {
    fn from(value: i64) -> Self {
        KeySegment::Number(value)
    }
}

impl From<Uuid> for KeySegment {
    fn from(value: Uuid) -> Self {
        KeySegment::Text(value.to_string())
    }
}

impl From<UserId> for KeySegment {
    fn from(value: UserId) -> Self {
        KeySegment::from(value.0)
    }
}

impl From<MessageId> for KeySegment {
    fn from(value: MessageId) -> Self {
        KeySegment::Number(value.0)
    }
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySegment::Number(n) => write!(f, "{n}"),
            KeySegment::Text(s) => f.write_str(s),
        }
    }
}

/// 查询键：有序的段列表
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
    pub fn new(segments: Vec<KeySegment>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    /// 追加一段，返回新键
    pub fn with(mut self, segment: impl Into<KeySegment>) -> Self {
        self.0.push(segment.into());
        self
    }

    /// 本键是否以 `prefix` 开头
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// 构造查询键：`query_key!["messages", user_id]`
#[macro_export]
macro_rules! query_key {
    ($($segment:expr),* $(,)?) => {
        $crate::invalidation::QueryKey::new(vec![$($crate::invalidation::KeySegment::from($segment)),*])
    };
}

/// 客户端查询缓存；失效后由缓存自身决定何时重新拉取
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait QueryCache: Send + Sync {
    async fn invalidate(&self, key: &QueryKey);
}

/// 合并策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Debounce { window: Duration },
    RateLimited { min_interval: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationRequest {
    pub key: QueryKey,
    pub strategy: Strategy,
}

impl InvalidationRequest {
    pub fn debounce(key: QueryKey, window: Duration) -> Self {
        Self {
            key,
            strategy: Strategy::Debounce { window },
        }
    }

    pub fn rate_limited(key: QueryKey, min_interval: Duration) -> Self {
        Self {
            key,
            strategy: Strategy::RateLimited { min_interval },
        }
    }
}

/// 单次请求的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationOutcome {
    /// 已（重新）安排定时器
    Scheduled,
    /// 已立即执行
    Executed,
    /// 在限流间隔内，被丢弃
    Dropped,
}

struct Pending {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct CoordinatorState {
    generation: u64,
    pending: HashMap<QueryKey, Pending>,
    last_run: HashMap<QueryKey, Instant>,
    /// 见过的最长限流间隔；更早的执行记录不会再导致丢弃
    longest_interval: Duration,
}

impl CoordinatorState {
    fn record_run(&mut self, key: QueryKey, now: Instant) {
        let horizon = self.longest_interval;
        self.last_run
            .retain(|_, last| now.duration_since(*last) < horizon);
        self.last_run.insert(key, now);
    }
}

/// 失效协调器，每个键独立计时
#[derive(Clone)]
pub struct InvalidationCoordinator {
    cache: Arc<dyn QueryCache>,
    state: Arc<Mutex<CoordinatorState>>,
}

impl InvalidationCoordinator {
    pub fn new(cache: Arc<dyn QueryCache>) -> Self {
        Self {
            cache,
            state: Arc::new(Mutex::new(CoordinatorState::default())),
        }
    }

    pub fn request(&self, request: InvalidationRequest) -> InvalidationOutcome {
        match request.strategy {
            Strategy::Debounce { window } => self.debounce(request.key, window),
            Strategy::RateLimited { min_interval } => self.rate_limited(request.key, min_interval),
        }
    }

    /// 窗口内再次请求会取消旧定时器并重新计时
    pub fn debounce(&self, key: QueryKey, window: Duration) -> InvalidationOutcome {
        let mut state = self.lock();
        state.generation += 1;
        let generation = state.generation;

        if let Some(previous) = state.pending.remove(&key) {
            previous.task.abort();
            trace!(%key, "合并防抖失效请求");
        }

        let cache = self.cache.clone();
        let shared = self.state.clone();
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            sleep(window).await;
            {
                let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                match state.pending.get(&task_key) {
                    Some(pending) if pending.generation == generation => {
                        state.pending.remove(&task_key);
                        state.record_run(task_key.clone(), Instant::now());
                    }
                    _ => return,
                }
            }
            debug!(key = %task_key, "执行防抖失效");
            cache.invalidate(&task_key).await;
        });

        state.pending.insert(key, Pending { generation, task });
        InvalidationOutcome::Scheduled
    }

    /// 距上次执行满 `min_interval` 才执行，否则丢弃
    pub fn rate_limited(&self, key: QueryKey, min_interval: Duration) -> InvalidationOutcome {
        let now = Instant::now();
        {
            let mut state = self.lock();
            if let Some(last) = state.last_run.get(&key) {
                if now.duration_since(*last) < min_interval {
                    trace!(%key, "限流期内，丢弃失效请求");
                    return InvalidationOutcome::Dropped;
                }
            }
            state.longest_interval = state.longest_interval.max(min_interval);
            state.record_run(key.clone(), now);
        }

        self.spawn_invalidate(key);
        InvalidationOutcome::Executed
    }

    /// 立即失效，同时取消该键上挂起的防抖定时器
    pub fn invalidate_now(&self, key: QueryKey) -> InvalidationOutcome {
        {
            let mut state = self.lock();
            if let Some(previous) = state.pending.remove(&key) {
                previous.task.abort();
            }
            state.record_run(key.clone(), Instant::now());
        }
        self.spawn_invalidate(key);
        InvalidationOutcome::Executed
    }

    /// 挂起中的防抖定时器数量
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// 取消全部挂起的定时器
    pub fn cancel_all(&self) {
        let mut state = self.lock();
        for (_, pending) in state.pending.drain() {
            pending.task.abort();
        }
    }

    fn spawn_invalidate(&self, key: QueryKey) {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            debug!(%key, "执行失效");
            cache.invalidate(&key).await;
        });
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
