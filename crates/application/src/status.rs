//! 消息状态上报
//!
//! 三条路径：单条立即发送、批量一次发送、缓冲后按数量或定时刷新。
//! 本地先做乐观更新，服务端确认后按单调规则合并；发送失败回滚乐观状态，
//! 并请求失效消息查询，以服务端状态为准。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use config::{BatchingConfig, InvalidationConfig};
use domain::{ClientEvent, MessageId, MessageStatus};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::invalidation::{InvalidationCoordinator, QueryKey};
use crate::query_key;
use crate::transport::{Delivery, EventSink};

/// 单条消息的本地状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusEntry {
    /// 服务端已确认的状态
    pub confirmed: Option<MessageStatus>,
    /// 已发出、尚未确认的状态
    pub optimistic: Option<MessageStatus>,
}

impl StatusEntry {
    /// 对外展示的状态：两者中更靠后的一个
    pub fn effective(&self) -> Option<MessageStatus> {
        match (self.confirmed, self.optimistic) {
            (Some(c), Some(o)) => Some(c.max(o)),
            (c, o) => c.or(o),
        }
    }
}

/// 本地消息状态账本
#[derive(Debug, Default)]
pub struct StatusLedger {
    entries: Mutex<HashMap<MessageId, StatusEntry>>,
}

impl StatusLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录乐观状态，返回是否需要上报
    ///
    /// 低于当前展示状态的更新被拒绝；服务端已确认到该状态时也无需上报。
    /// 同一未确认状态可以重复上报，链路断开后由上层重试。
    pub fn apply_optimistic(&self, id: MessageId, status: MessageStatus) -> bool {
        let mut entries = self.lock();
        let entry = entries.entry(id).or_default();
        if entry.confirmed.is_some_and(|confirmed| confirmed >= status) {
            return false;
        }
        if entry
            .effective()
            .is_some_and(|current| !current.can_advance_to(status))
        {
            return false;
        }
        entry.optimistic = Some(status);
        true
    }

    /// 合并服务端确认，返回合并后的已确认状态
    pub fn confirm(&self, id: MessageId, status: MessageStatus) -> MessageStatus {
        let mut entries = self.lock();
        let entry = entries.entry(id).or_default();
        let merged = MessageStatus::merge(entry.confirmed, status);
        entry.confirmed = Some(merged);
        if entry.optimistic.is_some_and(|o| o <= merged) {
            entry.optimistic = None;
        }
        merged
    }

    /// 丢弃未确认的乐观状态
    pub fn rollback(&self, id: MessageId) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.optimistic = None;
            if entry.confirmed.is_none() {
                entries.remove(&id);
            }
        }
    }

    /// 连接断开时丢弃全部未确认状态，返回受影响的消息数
    pub fn discard_unconfirmed(&self) -> usize {
        let mut entries = self.lock();
        let mut discarded = 0;
        entries.retain(|_, entry| {
            if entry.optimistic.take().is_some() {
                discarded += 1;
            }
            entry.confirmed.is_some()
        });
        discarded
    }

    pub fn entry(&self, id: MessageId) -> Option<StatusEntry> {
        self.lock().get(&id).copied()
    }

    pub fn effective(&self, id: MessageId) -> Option<MessageStatus> {
        self.lock().get(&id).and_then(StatusEntry::effective)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MessageId, StatusEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 一次上报的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDispatch {
    /// 已写入通道，覆盖 `count` 条消息
    Sent { count: usize },
    /// 没有需要前进的消息
    Skipped,
    /// 通道不可用，乐观状态已回滚
    Dropped { count: usize },
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
    /// 发送失败后失效 `messages` 的防抖窗口
    pub invalidate_window: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            flush_interval: Duration::from_millis(500),
            invalidate_window: Duration::from_millis(300),
        }
    }
}

impl BatchOptions {
    pub fn from_config(batching: &BatchingConfig, invalidation: &InvalidationConfig) -> Self {
        Self {
            max_batch_size: batching.max_batch_size.max(1),
            flush_interval: batching.flush_interval(),
            invalidate_window: invalidation.debounce_window(),
        }
    }
}

#[derive(Default)]
struct PendingBatch {
    items: Vec<(MessageId, MessageStatus)>,
    timer: Option<JoinHandle<()>>,
}

/// 状态上报器
pub struct StatusBatcher {
    sink: Arc<dyn EventSink>,
    ledger: Arc<StatusLedger>,
    coordinator: InvalidationCoordinator,
    options: BatchOptions,
    pending: Mutex<PendingBatch>,
}

impl StatusBatcher {
    pub fn new(
        sink: Arc<dyn EventSink>,
        ledger: Arc<StatusLedger>,
        coordinator: InvalidationCoordinator,
        options: BatchOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            ledger,
            coordinator,
            options,
            pending: Mutex::new(PendingBatch::default()),
        })
    }

    pub fn ledger(&self) -> &Arc<StatusLedger> {
        &self.ledger
    }

    /// 立即发送单条状态更新
    pub async fn update_status(&self, id: MessageId, status: MessageStatus) -> StatusDispatch {
        if !self.ledger.apply_optimistic(id, status) {
            debug!(%id, %status, "状态不前进，跳过上报");
            return StatusDispatch::Skipped;
        }
        self.send(vec![id], status, false).await
    }

    /// 以一个事件发送一组消息的同一状态
    pub async fn update_status_batch(&self, ids: &[MessageId], status: MessageStatus) -> StatusDispatch {
        let mut advancing = Vec::with_capacity(ids.len());
        for &id in ids {
            if !advancing.contains(&id) && self.ledger.apply_optimistic(id, status) {
                advancing.push(id);
            }
        }
        if advancing.is_empty() {
            return StatusDispatch::Skipped;
        }
        self.send(advancing, status, true).await
    }

    /// 放入缓冲区；达到批量上限立即刷新，否则由定时器刷新
    pub async fn enqueue(self: &Arc<Self>, id: MessageId, status: MessageStatus) -> Vec<StatusDispatch> {
        if !self.ledger.apply_optimistic(id, status) {
            return Vec::new();
        }

        let full = {
            let mut pending = self.lock();
            match pending.items.iter_mut().find(|(pending_id, _)| *pending_id == id) {
                Some((_, queued)) => *queued = (*queued).max(status),
                None => pending.items.push((id, status)),
            }

            let full = pending.items.len() >= self.options.max_batch_size;
            if !full && pending.timer.is_none() {
                pending.timer = Some(self.spawn_flush_timer());
            }
            full
        };

        if full {
            self.flush().await
        } else {
            Vec::new()
        }
    }

    /// 刷新缓冲区：按目标状态分组，组内保持入队顺序
    pub async fn flush(&self) -> Vec<StatusDispatch> {
        let items = {
            let mut pending = self.lock();
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut pending.items)
        };

        let mut groups: Vec<(MessageStatus, Vec<MessageId>)> = Vec::new();
        for (id, status) in items {
            match groups.iter_mut().find(|(s, _)| *s == status) {
                Some((_, ids)) => ids.push(id),
                None => groups.push((status, vec![id])),
            }
        }

        let mut results = Vec::with_capacity(groups.len());
        for (status, ids) in groups {
            results.push(self.send(ids, status, true).await);
        }
        results
    }

    pub fn pending_len(&self) -> usize {
        self.lock().items.len()
    }

    fn spawn_flush_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.options.flush_interval;
        tokio::spawn(async move {
            sleep(interval).await;
            if let Some(batcher) = weak.upgrade() {
                // 计时器即将被 flush() 取消，先摘下自己的句柄
                batcher.lock().timer = None;
                batcher.flush().await;
            }
        })
    }

    /// 批量路径始终发送 `message_status_batch_update`，即便只有一条
    async fn send(&self, ids: Vec<MessageId>, status: MessageStatus, batch: bool) -> StatusDispatch {
        let count = ids.len();
        let event = match (batch, ids.as_slice()) {
            (false, [id]) => ClientEvent::MessageStatusUpdate {
                message_id: *id,
                status,
            },
            _ => ClientEvent::MessageStatusBatchUpdate {
                message_ids: ids.clone(),
                status,
            },
        };

        match self.sink.emit(event).await {
            Delivery::Sent => StatusDispatch::Sent { count },
            delivery @ (Delivery::Dropped | Delivery::TimedOut) => {
                warn!(?delivery, count, %status, "状态上报未送达，回滚乐观状态");
                for id in &ids {
                    self.ledger.rollback(*id);
                }
                self.coordinator
                    .debounce(messages_key(), self.options.invalidate_window);
                StatusDispatch::Dropped { count }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingBatch> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn messages_key() -> QueryKey {
    query_key!["messages"]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingQueryCache, RecordingSink};

    fn batcher(
        sink: Arc<RecordingSink>,
        cache: Arc<RecordingQueryCache>,
        max_batch_size: usize,
    ) -> Arc<StatusBatcher> {
        StatusBatcher::new(
            sink,
            Arc::new(StatusLedger::new()),
            InvalidationCoordinator::new(cache),
            BatchOptions {
                max_batch_size,
                flush_interval: Duration::from_millis(500),
                invalidate_window: Duration::from_millis(300),
            },
        )
    }

    #[test]
    fn ledger_is_monotonic_across_confirmations() {
        let ledger = StatusLedger::new();
        let id = MessageId(1);

        assert!(ledger.apply_optimistic(id, MessageStatus::Read));
        assert_eq!(ledger.confirm(id, MessageStatus::Delivered), MessageStatus::Delivered);
        assert_eq!(ledger.effective(id), Some(MessageStatus::Read));

        // 确认追上乐观状态后清除乐观标记
        ledger.confirm(id, MessageStatus::Read);
        assert_eq!(
            ledger.entry(id),
            Some(StatusEntry {
                confirmed: Some(MessageStatus::Read),
                optimistic: None
            })
        );

        // 迟到的旧确认不会回退
        assert_eq!(ledger.confirm(id, MessageStatus::Sent), MessageStatus::Read);
        assert!(!ledger.apply_optimistic(id, MessageStatus::Delivered));
    }

    #[test]
    fn rollback_restores_confirmed_state() {
        let ledger = StatusLedger::new();
        let id = MessageId(2);
        ledger.confirm(id, MessageStatus::Delivered);
        ledger.apply_optimistic(id, MessageStatus::Read);

        ledger.rollback(id);
        assert_eq!(ledger.effective(id), Some(MessageStatus::Delivered));

        let fresh = MessageId(3);
        ledger.apply_optimistic(fresh, MessageStatus::Read);
        ledger.rollback(fresh);
        assert_eq!(ledger.entry(fresh), None);
    }

    #[tokio::test]
    async fn batch_update_emits_one_event_for_all_ids() {
        let sink = RecordingSink::new();
        let batcher = batcher(sink.clone(), RecordingQueryCache::new(), 50);
        let ids = [MessageId(1), MessageId(2), MessageId(3)];

        let result = batcher.update_status_batch(&ids, MessageStatus::Read).await;
        assert_eq!(result, StatusDispatch::Sent { count: 3 });
        assert_eq!(
            sink.events(),
            vec![ClientEvent::MessageStatusBatchUpdate {
                message_ids: ids.to_vec(),
                status: MessageStatus::Read,
            }]
        );
        for id in ids {
            assert_eq!(batcher.ledger().effective(id), Some(MessageStatus::Read));
        }
    }

    #[tokio::test]
    async fn single_id_batch_still_uses_batch_event() {
        let sink = RecordingSink::new();
        let batcher = batcher(sink.clone(), RecordingQueryCache::new(), 50);

        let result = batcher
            .update_status_batch(&[MessageId(2)], MessageStatus::Read)
            .await;
        assert_eq!(result, StatusDispatch::Sent { count: 1 });
        assert_eq!(
            sink.events(),
            vec![ClientEvent::MessageStatusBatchUpdate {
                message_ids: vec![MessageId(2)],
                status: MessageStatus::Read,
            }]
        );
    }

    #[tokio::test]
    async fn unconfirmed_update_can_be_sent_again() {
        let sink = RecordingSink::new();
        let batcher = batcher(sink.clone(), RecordingQueryCache::new(), 50);
        let id = MessageId(1);

        assert_eq!(
            batcher.update_status(id, MessageStatus::Read).await,
            StatusDispatch::Sent { count: 1 }
        );
        // 未收到确认，重试照常发出
        assert_eq!(
            batcher.update_status(id, MessageStatus::Read).await,
            StatusDispatch::Sent { count: 1 }
        );
        assert_eq!(sink.events().len(), 2);

        // 低于乐观状态的更新仍被拒绝
        assert_eq!(
            batcher.update_status(id, MessageStatus::Delivered).await,
            StatusDispatch::Skipped
        );

        batcher.ledger().confirm(id, MessageStatus::Read);
        assert_eq!(
            batcher.update_status(id, MessageStatus::Read).await,
            StatusDispatch::Skipped
        );
        assert_eq!(sink.events().len(), 2);
    }

    #[test]
    fn discard_unconfirmed_keeps_confirmed_state() {
        let ledger = StatusLedger::new();
        ledger.confirm(MessageId(1), MessageStatus::Delivered);
        ledger.apply_optimistic(MessageId(1), MessageStatus::Read);
        ledger.apply_optimistic(MessageId(2), MessageStatus::Delivered);

        assert_eq!(ledger.discard_unconfirmed(), 2);
        assert_eq!(ledger.effective(MessageId(1)), Some(MessageStatus::Delivered));
        assert_eq!(ledger.entry(MessageId(2)), None);
    }

    #[tokio::test]
    async fn regressing_update_is_skipped() {
        let sink = RecordingSink::new();
        let batcher = batcher(sink.clone(), RecordingQueryCache::new(), 50);
        let id = MessageId(5);

        batcher.ledger().confirm(id, MessageStatus::Read);
        assert_eq!(
            batcher.update_status(id, MessageStatus::Delivered).await,
            StatusDispatch::Skipped
        );
        assert!(sink.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn undelivered_send_rolls_back_and_invalidates_messages() {
        let sink = RecordingSink::new();
        sink.set_delivery(Delivery::Dropped);
        let cache = RecordingQueryCache::new();
        let batcher = batcher(sink.clone(), cache.clone(), 50);
        let id = MessageId(8);

        assert_eq!(
            batcher.update_status(id, MessageStatus::Read).await,
            StatusDispatch::Dropped { count: 1 }
        );
        assert_eq!(batcher.ledger().effective(id), None);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(cache.keys(), vec![query_key!["messages"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_flushes_on_timer_grouped_by_status() {
        let sink = RecordingSink::new();
        let batcher = batcher(sink.clone(), RecordingQueryCache::new(), 50);

        batcher.enqueue(MessageId(1), MessageStatus::Delivered).await;
        batcher.enqueue(MessageId(2), MessageStatus::Read).await;
        batcher.enqueue(MessageId(3), MessageStatus::Delivered).await;
        // 同一消息再次入队取更靠后的状态
        batcher.enqueue(MessageId(1), MessageStatus::Read).await;
        assert!(sink.events().is_empty());

        sleep(Duration::from_millis(600)).await;

        assert_eq!(
            sink.events(),
            vec![
                ClientEvent::MessageStatusBatchUpdate {
                    message_ids: vec![MessageId(1), MessageId(2)],
                    status: MessageStatus::Read,
                },
                ClientEvent::MessageStatusBatchUpdate {
                    message_ids: vec![MessageId(3)],
                    status: MessageStatus::Delivered,
                },
            ]
        );
        assert_eq!(batcher.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_flushes_when_batch_is_full() {
        let sink = RecordingSink::new();
        let batcher = batcher(sink.clone(), RecordingQueryCache::new(), 3);

        batcher.enqueue(MessageId(1), MessageStatus::Read).await;
        batcher.enqueue(MessageId(2), MessageStatus::Read).await;
        let results = batcher.enqueue(MessageId(3), MessageStatus::Read).await;

        assert_eq!(results, vec![StatusDispatch::Sent { count: 3 }]);
        assert_eq!(sink.events().len(), 1);

        // 定时器已取消，不会再发一次空批次
        sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.events().len(), 1);
    }
}
