//! REST 降级路径
//!
//! 通道不可用时以普通 HTTP 请求完成同样的操作。会话状态的查询结果
//! 被包装成 conversation_status_update 事件注入分发器，监听器看到的载荷与推送一致。

use std::sync::Arc;

use application::{
    CredentialProvider, EventDispatcher, Route, SyncError, SyncTransport,
};
use async_trait::async_trait;
use domain::{ConversationStatus, InboundEvent, UserId};
use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use tracing::debug;

use crate::connector::ServerEndpoint;
use crate::retry::{retry_async, RetryConfig};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TypingIndicatorBody {
    receiver_id: UserId,
    is_typing: bool,
}

pub struct RestFallback {
    endpoint: ServerEndpoint,
    client: Client,
    credentials: Arc<dyn CredentialProvider>,
    dispatcher: EventDispatcher,
    retry: RetryConfig,
}

impl RestFallback {
    pub fn new(
        endpoint: ServerEndpoint,
        credentials: Arc<dyn CredentialProvider>,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            endpoint,
            client: Client::new(),
            credentials,
            dispatcher,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, SyncError> {
        let credential = self.credentials.credential().await?;
        Ok(request.bearer_auth(credential.token()))
    }

    /// 查询会话状态；网络错误与 5xx 会重试
    pub async fn fetch_conversation_status(
        &self,
        other_user_id: UserId,
        force: bool,
    ) -> Result<ConversationStatus, SyncError> {
        let url = self
            .endpoint
            .http_url(&format!("/api/conversations/{other_user_id}/status"));

        retry_async(
            &self.retry,
            |err: &SyncError| match err {
                SyncError::Http(_) => true,
                SyncError::Rejected { status, .. } => *status >= 500,
                _ => false,
            },
            || async {
                let request = self
                    .authorized(self.client.get(&url).query(&[("force", force)]))
                    .await?;
                let response = send(request).await?;
                response
                    .json::<ConversationStatus>()
                    .await
                    .map_err(|e| SyncError::Http(e.to_string()))
            },
        )
        .await
    }
}

async fn send(request: RequestBuilder) -> Result<Response, SyncError> {
    let response = request
        .send()
        .await
        .map_err(|e| SyncError::Http(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(SyncError::Rejected {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl SyncTransport for RestFallback {
    fn route(&self) -> Route {
        Route::Rest
    }

    async fn send_typing(&self, receiver_id: UserId, is_typing: bool) -> Result<(), SyncError> {
        let request = self
            .authorized(
                self.client
                    .post(self.endpoint.http_url("/api/typing-indicator"))
                    .json(&TypingIndicatorBody {
                        receiver_id,
                        is_typing,
                    }),
            )
            .await?;
        send(request).await?;
        Ok(())
    }

    async fn refresh_conversation(&self, other_user_id: UserId, force: bool) -> Result<(), SyncError> {
        let status = self.fetch_conversation_status(other_user_id, force).await?;
        debug!(%other_user_id, is_blocked = status.is_blocked, "REST 会话状态已刷新");

        self.dispatcher.dispatch(&InboundEvent::ConversationStatusUpdate {
            user_id: status.user_id,
            is_blocked: status.is_blocked,
        });
        Ok(())
    }
}
