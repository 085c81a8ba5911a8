//! 统一配置中心
//!
//! 提供同步层的全局配置管理，包括：
//! - 服务监听与 JWT 认证
//! - 持久通道（传输顺序、重连、心跳）
//! - 缓存失效协调与状态批处理
//! - 服务端 TTL 缓存
//!
//! 加载顺序：内置默认值 → `chatsync.toml` → `CHATSYNC_*` 环境变量（嵌套键用 `__` 分隔）。

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 默认配置文件名
pub const CONFIG_FILE: &str = "chatsync.toml";
/// 环境变量前缀
pub const ENV_PREFIX: &str = "CHATSYNC_";

/// 已知的传输名称
pub const KNOWN_TRANSPORTS: [&str; 2] = ["websocket", "polling"];

/// 全局应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务配置
    pub server: ServerConfig,
    /// JWT认证配置
    pub jwt: JwtConfig,
    /// 通道配置
    pub channel: ChannelConfig,
    /// 失效协调配置
    pub invalidation: InvalidationConfig,
    /// 状态批处理配置
    pub batching: BatchingConfig,
    /// 服务端缓存配置
    pub cache: CacheConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 服务端 ping 间隔（毫秒）
    pub ping_interval_ms: u64,
    /// 长轮询挂起时长（毫秒）
    pub poll_wait_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ping_interval_ms: 25_000,
            poll_wait_ms: 25_000,
        }
    }
}

impl ServerConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }
}

/// JWT配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_hours: i64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "dev-secret-key-not-for-production-use-minimum-32-chars".to_string(),
            expiration_hours: 24,
        }
    }
}

/// 持久通道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// 服务端基础地址，例如 `http://127.0.0.1:8080`
    pub url: String,
    /// 按优先级排列的传输列表
    pub transports: Vec<String>,
    /// 最大重连次数
    pub reconnect_attempts: u32,
    /// 固定重连间隔（毫秒）
    pub reconnect_delay_ms: u64,
    /// 单次建连超时（毫秒）
    pub connect_timeout_ms: u64,
    /// 多久收不到服务端 ping 视为连接失效（毫秒）
    pub heartbeat_timeout_ms: u64,
    /// 事件广播缓冲容量
    pub event_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            transports: KNOWN_TRANSPORTS.iter().map(|s| s.to_string()).collect(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,
            connect_timeout_ms: 10_000,
            heartbeat_timeout_ms: 60_000,
            event_buffer: 1_024,
        }
    }
}

impl ChannelConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// 缓存失效协调配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationConfig {
    /// 防抖静默窗口（毫秒）
    pub debounce_window_ms: u64,
    /// 限频最小间隔（毫秒）
    pub rate_limit_interval_ms: u64,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: 300,
            rate_limit_interval_ms: 2_000,
        }
    }
}

impl InvalidationConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn rate_limit_interval(&self) -> Duration {
        Duration::from_millis(self.rate_limit_interval_ms)
    }
}

/// 状态批处理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    pub max_batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            flush_interval_ms: 500,
        }
    }
}

impl BatchingConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// 服务端 TTL 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_keys: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            sweep_interval_secs: 60,
            max_keys: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl AppConfig {
    /// 构造 figment：默认值 → 配置文件 → 环境变量
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// 加载并校验配置
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt.secret.len() < 32 {
            return Err(ConfigError::InvalidJwtSecret(
                "JWT secret must be at least 32 characters long".to_string(),
            ));
        }

        if self.server.port == 0 {
            return Err(ConfigError::InvalidServerConfig(
                "port must be greater than 0".to_string(),
            ));
        }

        if self.channel.transports.is_empty() {
            return Err(ConfigError::InvalidChannelConfig(
                "at least one transport is required".to_string(),
            ));
        }

        if let Some(unknown) = self
            .channel
            .transports
            .iter()
            .find(|name| !KNOWN_TRANSPORTS.contains(&name.as_str()))
        {
            return Err(ConfigError::InvalidChannelConfig(format!(
                "unknown transport: {unknown}"
            )));
        }

        if self.channel.event_buffer == 0 {
            return Err(ConfigError::InvalidChannelConfig(
                "event buffer must be greater than 0".to_string(),
            ));
        }

        if self.batching.max_batch_size == 0 {
            return Err(ConfigError::InvalidBatchingConfig(
                "max batch size must be greater than 0".to_string(),
            ));
        }

        if self.cache.max_keys == 0 || self.cache.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidCacheConfig(
                "max keys and sweep interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("配置加载失败: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid JWT secret: {0}")]
    InvalidJwtSecret(String),
    #[error("Invalid server configuration: {0}")]
    InvalidServerConfig(String),
    #[error("Invalid channel configuration: {0}")]
    InvalidChannelConfig(String),
    #[error("Invalid batching configuration: {0}")]
    InvalidBatchingConfig(String),
    #[error("Invalid cache configuration: {0}")]
    InvalidCacheConfig(String),
}
