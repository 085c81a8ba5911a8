//! HTTP 长轮询传输
//!
//! 建连即创建服务端会话；一个任务循环拉取下行事件，另一个任务逐条提交上行事件。
//! 通道侧丢弃链路时删除服务端会话。

use std::time::Duration;

use application::{ChannelLink, Connector, Credential, LinkEvent, TransportError};
use async_trait::async_trait;
use domain::{ClientEvent, DisconnectReason, InboundEvent, TransportKind};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connector::ServerEndpoint;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionCreated {
    session_id: String,
}

pub struct PollingConnector {
    endpoint: ServerEndpoint,
    client: Client,
    poll_timeout: Duration,
}

impl PollingConnector {
    /// `poll_timeout` 需大于服务端的长轮询等待时长
    pub fn new(endpoint: ServerEndpoint, poll_timeout: Duration) -> Self {
        Self {
            endpoint,
            client: Client::new(),
            poll_timeout,
        }
    }
}

fn status_error(status: StatusCode) -> TransportError {
    if status == StatusCode::UNAUTHORIZED {
        TransportError::Unauthorized(format!("HTTP {status}"))
    } else {
        TransportError::rejected(TransportKind::Polling, format!("HTTP {status}"))
    }
}

#[async_trait]
impl Connector for PollingConnector {
    async fn open(
        &self,
        _transport: TransportKind,
        credential: &Credential,
    ) -> Result<ChannelLink, TransportError> {
        let response = self
            .client
            .post(self.endpoint.http_url("/channel/sessions"))
            .bearer_auth(credential.token())
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }
        let created: SessionCreated = response
            .json()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        info!(session_id = %created.session_id, "长轮询会话已建立");

        let session = Session {
            client: self.client.clone(),
            events_url: self
                .endpoint
                .http_url(&format!("/channel/sessions/{}/events", created.session_id)),
            session_url: self
                .endpoint
                .http_url(&format!("/channel/sessions/{}", created.session_id)),
            token: credential.token().to_string(),
            poll_timeout: self.poll_timeout,
        };

        let (link, endpoint) = ChannelLink::pair();
        let poller = tokio::spawn(session.clone().poll(endpoint.inbound));
        tokio::spawn(async move {
            session.forward(endpoint.outbound).await;
            poller.abort();
            session.delete().await;
        });

        Ok(link)
    }
}

#[derive(Clone)]
struct Session {
    client: Client,
    events_url: String,
    session_url: String,
    token: String,
    poll_timeout: Duration,
}

impl Session {
    async fn poll(self, inbound: mpsc::UnboundedSender<LinkEvent>) {
        loop {
            let response = self
                .client
                .get(&self.events_url)
                .bearer_auth(&self.token)
                .timeout(self.poll_timeout)
                .send()
                .await;

            let reason = match response {
                Ok(response) if response.status().is_success() => {
                    match response.json::<Vec<InboundEvent>>().await {
                        Ok(events) => {
                            for event in events {
                                if inbound.send(LinkEvent::Event(event)).is_err() {
                                    return;
                                }
                            }
                            continue;
                        }
                        Err(err) => {
                            warn!(error = %err, "长轮询响应无法解析");
                            DisconnectReason::TransportError
                        }
                    }
                }
                Ok(response)
                    if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::GONE) =>
                {
                    DisconnectReason::ServerClosed
                }
                Ok(response) => {
                    warn!(status = %response.status(), "长轮询请求被拒绝");
                    DisconnectReason::TransportError
                }
                Err(err) if err.is_timeout() => DisconnectReason::TransportClosed,
                Err(err) => {
                    warn!(error = %err, "长轮询请求失败");
                    DisconnectReason::TransportError
                }
            };

            let _ = inbound.send(LinkEvent::Closed(reason));
            return;
        }
    }

    async fn forward(&self, mut outbound: mpsc::UnboundedReceiver<ClientEvent>) {
        while let Some(event) = outbound.recv().await {
            let name = event.name();
            let result = self
                .client
                .post(&self.events_url)
                .bearer_auth(&self.token)
                .json(&event)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => warn!(event = name, status = %response.status(), "上行事件被拒绝"),
                Err(err) => warn!(event = name, error = %err, "上行事件提交失败"),
            }
        }
    }

    async fn delete(&self) {
        match self
            .client
            .delete(&self.session_url)
            .bearer_auth(&self.token)
            .send()
            .await
        {
            Ok(_) => debug!("长轮询会话已删除"),
            Err(err) => debug!(error = %err, "删除长轮询会话失败"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector(server: &MockServer) -> PollingConnector {
        PollingConnector::new(ServerEndpoint::new(server.uri()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn creates_session_and_delivers_polled_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channel/sessions"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sessionId": "s1" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/channel/sessions/s1/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "event": "ping" },
                { "event": "notification_update" }
            ])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/channel/sessions/s1/events"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut link = connector(&server)
            .open(TransportKind::Polling, &Credential::new("secret"))
            .await
            .unwrap();

        assert_eq!(link.inbound.recv().await, Some(LinkEvent::Event(InboundEvent::Ping)));
        assert_eq!(
            link.inbound.recv().await,
            Some(LinkEvent::Event(InboundEvent::NotificationUpdate))
        );
        assert_eq!(
            link.inbound.recv().await,
            Some(LinkEvent::Closed(DisconnectReason::ServerClosed))
        );
    }

    #[tokio::test]
    async fn outbound_events_are_posted_and_session_deleted_on_drop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channel/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sessionId": "s2" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/channel/sessions/s2/events"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([]))
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/channel/sessions/s2/events"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/channel/sessions/s2"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let link = connector(&server)
            .open(TransportKind::Polling, &Credential::new("t"))
            .await
            .unwrap();
        link.outbound.send(ClientEvent::Pong).unwrap();
        drop(link);

        tokio::time::sleep(Duration::from_millis(300)).await;
        server.verify().await;
    }

    #[tokio::test]
    async fn session_rejection_maps_to_transport_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channel/sessions"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = connector(&server)
            .open(TransportKind::Polling, &Credential::new("t"))
            .await
            .err()
            .unwrap();
        assert!(err.is_auth());

        let blocked = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channel/sessions"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&blocked)
            .await;
        let err = connector(&blocked)
            .open(TransportKind::Polling, &Credential::new("t"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Rejected { .. }));
    }
}
