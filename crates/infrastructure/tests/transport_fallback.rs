use std::sync::Arc;
use std::time::Duration;

use application::{
    ChannelManager, ChannelOptions, ConnectionState, Credential, StaticCredential,
};
use domain::{InboundEvent, TransportKind};
use infrastructure::{DefaultConnector, ServerEndpoint};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// WebSocket 升级被拒绝（例如代理不支持）时，通道降级到长轮询
#[tokio::test]
async fn channel_falls_back_to_polling_when_upgrade_is_refused() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ws"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/channel/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "sessionId": "abc" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/channel/sessions/abc/events"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{ "event": "notification_update" }]))
                .set_delay(Duration::from_millis(50)),
        )
        .mount(&server)
        .await;

    let connector = DefaultConnector::shared(ServerEndpoint::new(server.uri()), Duration::from_secs(5));
    let channel = ChannelManager::new(
        connector,
        Arc::new(StaticCredential(Credential::new("token"))),
        ChannelOptions {
            transports: vec![TransportKind::WebSocket, TransportKind::Polling],
            heartbeat_timeout: None,
            ..ChannelOptions::default()
        },
    );
    let mut events = channel.subscribe();

    let handle = channel.connect().await.expect("connected over polling");
    assert_eq!(handle.transport(), TransportKind::Polling);
    assert_eq!(channel.state(), ConnectionState::Connected);

    let event = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(InboundEvent::NotificationUpdate) => break InboundEvent::NotificationUpdate,
                Ok(_) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("polled event arrives");
    assert_eq!(event, InboundEvent::NotificationUpdate);

    channel.disconnect();
}
