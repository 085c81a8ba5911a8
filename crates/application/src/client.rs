//! 客户端同步层装配
//!
//! 把通道、分发器、失效协调、状态上报和同步网关按配置连成一体。

use std::sync::Arc;

use config::AppConfig;
use tokio::task::JoinHandle;
use tracing::info;

use crate::channel::{ChannelManager, ChannelOptions};
use crate::dispatcher::{EventDispatcher, Subscription};
use crate::error::ApplicationError;
use crate::gateway::{PushTransport, SyncGateway, SyncTransport};
use crate::invalidation::{InvalidationCoordinator, QueryCache};
use crate::reactions::{InvalidationRoutes, NoticeSink, RouteTimings, TracingNoticeSink};
use crate::status::{BatchOptions, StatusBatcher, StatusLedger};
use crate::transport::{Connector, CredentialProvider};

type FallbackFactory = Box<dyn FnOnce(EventDispatcher) -> Arc<dyn SyncTransport> + Send>;

pub struct SyncClientBuilder {
    config: AppConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    query_cache: Arc<dyn QueryCache>,
    notices: Arc<dyn NoticeSink>,
    fallback: Option<FallbackFactory>,
    install_global: bool,
}

impl SyncClientBuilder {
    pub fn notices(mut self, notices: Arc<dyn NoticeSink>) -> Self {
        self.notices = notices;
        self
    }

    /// REST 降级路径；工厂拿到分发器以便注入合成事件
    pub fn fallback<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(EventDispatcher) -> Arc<dyn SyncTransport> + Send + 'static,
    {
        self.fallback = Some(Box::new(factory));
        self
    }

    /// 同时把通道安装为进程级单例
    pub fn install_global(mut self) -> Self {
        self.install_global = true;
        self
    }

    pub fn build(self) -> Result<SyncClient, ApplicationError> {
        let options = ChannelOptions::from_config(&self.config.channel)?;
        let channel = ChannelManager::new(self.connector, self.credentials, options);
        if self.install_global {
            ChannelManager::install(channel.clone())
                .map_err(|err| ApplicationError::infrastructure(err.to_string()))?;
        }

        let dispatcher = EventDispatcher::new();
        let pump = dispatcher.bind(&channel);

        let coordinator = InvalidationCoordinator::new(self.query_cache);
        let ledger = Arc::new(StatusLedger::new());
        let routes = InvalidationRoutes::new(
            coordinator.clone(),
            ledger.clone(),
            self.notices,
            RouteTimings::from(&self.config.invalidation),
        );
        let subscriptions = routes.attach(&dispatcher);

        let status = StatusBatcher::new(
            channel.clone(),
            ledger,
            coordinator.clone(),
            BatchOptions::from_config(&self.config.batching, &self.config.invalidation),
        );

        let push: Arc<dyn SyncTransport> = Arc::new(PushTransport::new(channel.clone()));
        let fallback = match self.fallback {
            Some(factory) => factory(dispatcher.clone()),
            None => push.clone(),
        };
        let gateway = SyncGateway::new(channel.clone(), push, fallback);

        info!(url = %self.config.channel.url, "同步客户端已装配");

        Ok(SyncClient {
            channel,
            dispatcher,
            coordinator,
            status,
            gateway,
            subscriptions,
            pump,
        })
    }
}

/// 装配完成的同步客户端
pub struct SyncClient {
    channel: Arc<ChannelManager>,
    dispatcher: EventDispatcher,
    coordinator: InvalidationCoordinator,
    status: Arc<StatusBatcher>,
    gateway: SyncGateway,
    subscriptions: Vec<Subscription>,
    pump: JoinHandle<()>,
}

impl SyncClient {
    pub fn builder(
        config: AppConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        query_cache: Arc<dyn QueryCache>,
    ) -> SyncClientBuilder {
        SyncClientBuilder {
            config,
            connector,
            credentials,
            query_cache,
            notices: Arc::new(TracingNoticeSink),
            fallback: None,
            install_global: false,
        }
    }

    pub fn channel(&self) -> &Arc<ChannelManager> {
        &self.channel
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn coordinator(&self) -> &InvalidationCoordinator {
        &self.coordinator
    }

    pub fn status(&self) -> &Arc<StatusBatcher> {
        &self.status
    }

    pub fn gateway(&self) -> &SyncGateway {
        &self.gateway
    }

    /// 断开通道并注销内置路由
    pub fn shutdown(self) {
        self.channel.disconnect();
        self.coordinator.cancel_all();
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
        self.pump.abort();
    }
}
