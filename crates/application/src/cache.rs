//! 服务端 TTL 缓存
//!
//! 键形如 `namespace:id`。条目自写入起计时，读取不续期；
//! 后台任务定期清理过期条目。并发未命中不做合并，可能重复计算。

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use config::CacheConfig;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// 缓存统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub keys: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
    pub max_keys: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            max_keys: 10_000,
        }
    }
}

impl From<&CacheConfig> for CacheOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            default_ttl: config.default_ttl(),
            sweep_interval: config.sweep_interval(),
            max_keys: config.max_keys,
        }
    }
}

pub fn cache_key(namespace: &str, id: &str) -> String {
    format!("{namespace}:{id}")
}

pub struct TtlCache<V> {
    options: CacheOptions,
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(options: CacheOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// 命中直接返回；未命中执行 `compute` 并写入。计算失败时原样返回错误，不写入
    pub async fn get_or_set<F, Fut, E>(
        &self,
        namespace: &str,
        id: &str,
        compute: F,
        ttl: Option<Duration>,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let key = cache_key(namespace, id);
        if let Some(value) = self.lookup(&key) {
            return Ok(value);
        }

        let value = compute().await?;
        self.insert(key, value.clone(), ttl.unwrap_or(self.options.default_ttl));
        Ok(value)
    }

    pub fn get(&self, namespace: &str, id: &str) -> Option<V> {
        self.lookup(&cache_key(namespace, id))
    }

    pub fn set(&self, namespace: &str, id: &str, value: V, ttl: Option<Duration>) {
        self.insert(
            cache_key(namespace, id),
            value,
            ttl.unwrap_or(self.options.default_ttl),
        );
    }

    /// 删除单个键，返回是否存在
    pub fn invalidate(&self, namespace: &str, id: &str) -> bool {
        self.write().remove(&cache_key(namespace, id)).is_some()
    }

    /// 删除命名空间下全部键，一次加锁完成
    pub fn invalidate_namespace(&self, namespace: &str) -> usize {
        let prefix = format!("{namespace}:");
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(&prefix));
        let removed = before - entries.len();
        debug!(namespace, removed, "命名空间缓存已失效");
        removed
    }

    pub fn clear(&self) {
        self.write().clear();
        debug!("缓存已清空");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            keys: self.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// 清除所有过期条目，返回清除数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// 启动后台清理任务；缓存释放后任务自动结束
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.options.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else { break };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "清理过期缓存");
                }
            }
        })
    }

    fn lookup(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let found = self
            .read()
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone());

        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key, "缓存命中");
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(key, "缓存未命中");
                None
            }
        }
    }

    fn insert(&self, key: String, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.write();

        if !entries.contains_key(&key) && entries.len() >= self.options.max_keys {
            entries.retain(|_, entry| !entry.is_expired(now));
            if entries.len() >= self.options.max_keys {
                let victim = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(k, _)| k.clone());
                if let Some(victim) = victim {
                    trace!(key = %victim, "缓存已满，淘汰最早过期的条目");
                    entries.remove(&victim);
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn cache(max_keys: usize) -> Arc<TtlCache<String>> {
        TtlCache::new(CacheOptions {
            default_ttl: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
            max_keys,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn miss_computes_then_hit_serves_cached_value() {
        let cache = cache(100);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_set("status", "u1", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>("open".to_string())
                }, None)
                .await
                .unwrap();
            assert_eq!(value, "open");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.stats(),
            CacheStats {
                keys: 1,
                hits: 2,
                misses: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_without_refresh_on_read() {
        let cache = cache(100);
        cache.set("status", "u1", "open".into(), Some(Duration::from_secs(2)));

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(cache.get("status", "u1").as_deref(), Some("open"));
        sleep(Duration::from_millis(600)).await;
        assert_eq!(cache.get("status", "u1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn get_or_set_recomputes_only_after_ttl() {
        let cache = cache(100);
        let calls = AtomicUsize::new(0);
        let load = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>("open".to_string())
        };
        let ttl = Some(Duration::from_secs(1));

        cache.get_or_set("status", "u1", load, ttl).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(500)).await;
        cache.get_or_set("status", "u1", load, ttl).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(1000)).await;
        cache.get_or_set("status", "u1", load, ttl).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn compute_error_is_propagated_and_not_cached() {
        let cache = cache(100);

        let result: Result<String, &str> = cache
            .get_or_set("status", "u1", || async { Err("db down") }, None)
            .await;
        assert_eq!(result, Err("db down"));
        assert_eq!(cache.stats().keys, 0);
    }

    #[test]
    fn namespace_invalidation_leaves_other_namespaces() {
        let cache = cache(100);
        cache.set("status", "a", "1".into(), None);
        cache.set("status", "b", "2".into(), None);
        cache.set("statuses", "a", "3".into(), None);
        cache.set("profile", "a", "4".into(), None);

        assert_eq!(cache.invalidate_namespace("status"), 2);
        assert_eq!(cache.get("status", "a"), None);
        assert_eq!(cache.get("statuses", "a").as_deref(), Some("3"));
        assert_eq!(cache.get("profile", "a").as_deref(), Some("4"));

        assert!(cache.invalidate("profile", "a"));
        assert!(!cache.invalidate("profile", "a"));
        cache.clear();
        assert_eq!(cache.stats().keys, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_evicts_entry_closest_to_expiry() {
        let cache = cache(2);
        cache.set("ns", "short", "s".into(), Some(Duration::from_secs(1)));
        cache.set("ns", "long", "l".into(), Some(Duration::from_secs(60)));
        cache.set("ns", "new", "n".into(), None);

        assert_eq!(cache.stats().keys, 2);
        assert_eq!(cache.get("ns", "short"), None);
        assert_eq!(cache.get("ns", "long").as_deref(), Some("l"));
        assert_eq!(cache.get("ns", "new").as_deref(), Some("n"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_expired_entries() {
        let cache = cache(100);
        let sweeper = cache.spawn_sweeper();
        cache.set("ns", "a", "a".into(), Some(Duration::from_secs(1)));
        cache.set("ns", "b", "b".into(), Some(Duration::from_secs(60)));

        sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.stats().keys, 1);

        sweeper.abort();
    }
}
