//! 按传输种类分派到具体连接器

use std::sync::Arc;
use std::time::Duration;

use application::{ChannelLink, Connector, Credential, TransportError};
use async_trait::async_trait;
use domain::TransportKind;

use crate::polling::PollingConnector;
use crate::websocket::WebSocketConnector;

/// 服务端地址，形如 `http://host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    base: String,
}

impl ServerEndpoint {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// WebSocket 地址：http → ws，https → wss
    pub fn ws_url(&self, path: &str) -> String {
        let base = if let Some(rest) = self.base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base.clone()
        };
        format!("{base}{path}")
    }
}

/// 同时支持 WebSocket 与长轮询的连接器
pub struct DefaultConnector {
    websocket: WebSocketConnector,
    polling: PollingConnector,
}

impl DefaultConnector {
    pub fn new(endpoint: ServerEndpoint, poll_timeout: Duration) -> Self {
        Self {
            websocket: WebSocketConnector::new(endpoint.clone()),
            polling: PollingConnector::new(endpoint, poll_timeout),
        }
    }

    pub fn shared(endpoint: ServerEndpoint, poll_timeout: Duration) -> Arc<dyn Connector> {
        Arc::new(Self::new(endpoint, poll_timeout))
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(
        &self,
        transport: TransportKind,
        credential: &Credential,
    ) -> Result<ChannelLink, TransportError> {
        match transport {
            TransportKind::WebSocket => self.websocket.open(transport, credential).await,
            TransportKind::Polling => self.polling.open(transport, credential).await,
        }
    }
}
