use domain::UserId;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// 用户消息配额
#[derive(Debug, Clone)]
struct UserQuota {
    /// 当前时间窗口内的消息数量
    message_count: u32,
    /// 当前时间窗口的开始时间
    window_start: Instant,
}

impl UserQuota {
    fn new(now: Instant) -> Self {
        Self {
            message_count: 0,
            window_start: now,
        }
    }
}

/// 限流错误类型
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded: {current}/{max} messages per window")]
    RateLimitExceeded { current: u32, max: u32 },

    #[error("Too many connections: {current}/{max} connections per user")]
    TooManyConnections { current: u32, max: u32 },
}

/// 消息限流器
/// 服务端在收到 user_message 时调用，超限时向发送方推送 rate_limit_exceeded
pub struct MessageRateLimiter {
    max_messages: u32,
    max_connections_per_user: u32,
    window_duration: Duration,
    user_quotas: Mutex<HashMap<UserId, UserQuota>>,
    user_connections: Mutex<HashMap<UserId, u32>>,
}

impl MessageRateLimiter {
    pub fn new(max_messages_per_minute: u32, max_connections_per_user: u32) -> Self {
        Self::with_window(
            max_messages_per_minute,
            max_connections_per_user,
            Duration::from_secs(60),
        )
    }

    pub fn with_window(max_messages: u32, max_connections_per_user: u32, window: Duration) -> Self {
        Self {
            max_messages,
            max_connections_per_user,
            window_duration: window,
            user_quotas: Mutex::new(HashMap::new()),
            user_connections: Mutex::new(HashMap::new()),
        }
    }

    /// 检查用户是否可以发送消息，通过时计数
    pub fn check_message_rate(&self, user_id: UserId) -> Result<(), RateLimitError> {
        let now = Instant::now();
        let mut quotas = self
            .user_quotas
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let quota = quotas.entry(user_id).or_insert_with(|| UserQuota::new(now));

        if now.duration_since(quota.window_start) >= self.window_duration {
            *quota = UserQuota::new(now);
        }

        if quota.message_count >= self.max_messages {
            tracing::debug!(user_id = %user_id, count = quota.message_count, "消息限流触发");
            return Err(RateLimitError::RateLimitExceeded {
                current: quota.message_count,
                max: self.max_messages,
            });
        }

        quota.message_count += 1;
        Ok(())
    }

    /// 用户建立通道时调用
    pub fn add_connection(&self, user_id: UserId) -> Result<(), RateLimitError> {
        let mut connections = self
            .user_connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let count = connections.entry(user_id).or_insert(0);
        if *count >= self.max_connections_per_user {
            return Err(RateLimitError::TooManyConnections {
                current: *count,
                max: self.max_connections_per_user,
            });
        }

        *count += 1;
        Ok(())
    }

    /// 用户通道断开时调用
    pub fn remove_connection(&self, user_id: UserId) {
        let mut connections = self
            .user_connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(count) = connections.get_mut(&user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                connections.remove(&user_id);
            }
        }
    }

    /// 清理过期的配额记录（防止内存泄漏）
    pub fn cleanup_expired_quotas(&self) -> usize {
        let now = Instant::now();
        let window = self.window_duration;
        let mut quotas = self
            .user_quotas
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let before = quotas.len();
        quotas.retain(|_, quota| now.duration_since(quota.window_start) < window * 2);
        before - quotas.len()
    }
}

impl Default for MessageRateLimiter {
    fn default() -> Self {
        Self::new(30, 5) // 默认每分钟30条消息，每用户5个连接
    }
}
