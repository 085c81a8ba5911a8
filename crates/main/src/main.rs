//! 主应用程序入口
//!
//! 加载配置，装配内存存储与会话服务，启动 Axum 同步服务。

use std::sync::Arc;

use application::MessageRateLimiter;
use config::AppConfig;
use infrastructure::Infrastructure;
use tracing_subscriber::EnvFilter;
use web_api::{router, spawn_reaper, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        cache_ttl_secs = config.cache.default_ttl_secs,
        "配置已加载"
    );

    let infrastructure = Infrastructure::in_memory(&config);
    let sweeper = infrastructure.spawn_background();

    let state = AppState::new(
        Arc::new(infrastructure.conversation_service()),
        Arc::new(JwtService::new(config.jwt.clone())),
        config.server.clone(),
    )
    .with_rate_limiter(MessageRateLimiter::default());
    let reaper = spawn_reaper(&state);

    let app = router(state);
    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    tracing::info!("同步服务启动在 http://{}", address);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    reaper.abort();
    tracing::info!("同步服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "无法监听退出信号");
        std::future::pending::<()>().await;
    }
}
