mod support;

use std::time::Duration;

use application::MessageRateLimiter;
use domain::{ClientEvent, ErrorCode, InboundEvent, MessageStatus, TransportKind};
use reqwest::Client;
use serde_json::json;

use support::{connect_ready, expect_event, new_user, TestServer};

async fn message_round_trip(sender_transport: TransportKind, receiver_transport: TransportKind) {
    let server = TestServer::start().await;
    let (alice, bob) = (new_user(), new_user());

    let alice_channel = server.channel(alice, vec![sender_transport]);
    let bob_channel = server.channel(bob, vec![receiver_transport]);
    let mut alice_events = alice_channel.subscribe();
    let mut bob_events = bob_channel.subscribe();
    connect_ready(&alice_channel, &mut alice_events).await;
    connect_ready(&bob_channel, &mut bob_events).await;

    assert!(alice_channel
        .send(ClientEvent::UserMessage {
            receiver_id: bob,
            content: "hello bob".into(),
        })
        .await
        .is_sent());

    let received = expect_event(&mut bob_events, |e| matches!(e, InboundEvent::NewMessage { .. })).await;
    let InboundEvent::NewMessage { message } = received else {
        unreachable!()
    };
    assert_eq!(message.sender_id, alice);
    assert_eq!(message.content, "hello bob");
    assert_eq!(message.status, MessageStatus::Sent);

    let sent = expect_event(&mut alice_events, |e| matches!(e, InboundEvent::MessageSent { .. })).await;
    assert_eq!(sent, InboundEvent::MessageSent { id: message.id });

    bob_channel
        .send(ClientEvent::MessageStatusBatchUpdate {
            message_ids: vec![message.id],
            status: MessageStatus::Read,
        })
        .await;

    let expected = InboundEvent::MessageStatusBatch {
        ids: vec![message.id],
        status: MessageStatus::Read,
    };
    let confirmation = expect_event(&mut alice_events, |e| {
        matches!(e, InboundEvent::MessageStatusBatch { .. })
    })
    .await;
    assert_eq!(confirmation, expected);
    let confirmation = expect_event(&mut bob_events, |e| {
        matches!(e, InboundEvent::MessageStatusBatch { .. })
    })
    .await;
    assert_eq!(confirmation, expected);

    alice_channel.disconnect();
    bob_channel.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn websocket_clients_exchange_messages_and_status() {
    message_round_trip(TransportKind::WebSocket, TransportKind::WebSocket).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn polling_client_talks_to_websocket_client() {
    message_round_trip(TransportKind::Polling, TransportKind::WebSocket).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_status_update_yields_single_confirmation() {
    let server = TestServer::start().await;
    let (alice, bob) = (new_user(), new_user());
    let alice_channel = server.channel(alice, vec![TransportKind::WebSocket]);
    let bob_channel = server.channel(bob, vec![TransportKind::Polling]);
    let mut alice_events = alice_channel.subscribe();
    let mut bob_events = bob_channel.subscribe();
    connect_ready(&alice_channel, &mut alice_events).await;
    connect_ready(&bob_channel, &mut bob_events).await;

    alice_channel
        .send(ClientEvent::UserMessage {
            receiver_id: bob,
            content: "ping?".into(),
        })
        .await;
    let InboundEvent::NewMessage { message } =
        expect_event(&mut bob_events, |e| matches!(e, InboundEvent::NewMessage { .. })).await
    else {
        unreachable!()
    };

    bob_channel
        .send(ClientEvent::MessageStatusUpdate {
            message_id: message.id,
            status: MessageStatus::Delivered,
        })
        .await;
    let confirmation = expect_event(&mut alice_events, |e| {
        matches!(e, InboundEvent::MessageStatus { .. } | InboundEvent::MessageStatusBatch { .. })
    })
    .await;
    assert_eq!(
        confirmation,
        InboundEvent::MessageStatus {
            id: message.id,
            status: MessageStatus::Delivered
        }
    );

    alice_channel.disconnect();
    bob_channel.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_pushes_status_and_rejects_messages() {
    let server = TestServer::start().await;
    let (alice, bob) = (new_user(), new_user());
    let alice_channel = server.channel(alice, vec![TransportKind::WebSocket]);
    let mut alice_events = alice_channel.subscribe();
    connect_ready(&alice_channel, &mut alice_events).await;

    let response = Client::new()
        .post(format!("{}/api/conversations/{}/block", server.base_url(), alice))
        .bearer_auth(server.token(bob))
        .json(&json!({ "isBlocked": true }))
        .send()
        .await
        .expect("block request");
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.expect("json body");
    assert_eq!(body["isBlocked"], true);
    assert_eq!(body["blockedByMe"], true);

    let update = expect_event(&mut alice_events, |e| {
        matches!(e, InboundEvent::ConversationStatusUpdate { user_id, .. } if *user_id == bob)
    })
    .await;
    assert_eq!(
        update,
        InboundEvent::ConversationStatusUpdate {
            user_id: bob,
            is_blocked: true
        }
    );

    alice_channel
        .send(ClientEvent::UserMessage {
            receiver_id: bob,
            content: "are you there?".into(),
        })
        .await;
    let error = expect_event(&mut alice_events, |e| matches!(e, InboundEvent::Error { .. })).await;
    assert!(matches!(
        error,
        InboundEvent::Error {
            code: ErrorCode::ConversationBlocked,
            ..
        }
    ));

    alice_channel.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limited_sender_receives_error_event() {
    let server =
        TestServer::start_with(MessageRateLimiter::with_window(1, 5, Duration::from_secs(60))).await;
    let (alice, bob) = (new_user(), new_user());
    let alice_channel = server.channel(alice, vec![TransportKind::WebSocket]);
    let mut alice_events = alice_channel.subscribe();
    connect_ready(&alice_channel, &mut alice_events).await;

    for content in ["one", "two"] {
        alice_channel
            .send(ClientEvent::UserMessage {
                receiver_id: bob,
                content: content.into(),
            })
            .await;
    }

    expect_event(&mut alice_events, |e| matches!(e, InboundEvent::MessageSent { .. })).await;
    let error = expect_event(&mut alice_events, |e| matches!(e, InboundEvent::Error { .. })).await;
    assert!(matches!(
        error,
        InboundEvent::Error {
            code: ErrorCode::RateLimitExceeded,
            ..
        }
    ));

    alice_channel.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn typing_indicator_is_relayed_over_the_channel() {
    let server = TestServer::start().await;
    let (alice, bob) = (new_user(), new_user());
    let alice_channel = server.channel(alice, vec![TransportKind::WebSocket]);
    let bob_channel = server.channel(bob, vec![TransportKind::WebSocket]);
    let mut alice_events = alice_channel.subscribe();
    let mut bob_events = bob_channel.subscribe();
    connect_ready(&alice_channel, &mut alice_events).await;
    connect_ready(&bob_channel, &mut bob_events).await;

    alice_channel
        .send(ClientEvent::TypingIndicator {
            receiver_id: bob,
            is_typing: true,
        })
        .await;

    let typing = expect_event(&mut bob_events, |e| matches!(e, InboundEvent::TypingIndicator { .. })).await;
    assert_eq!(
        typing,
        InboundEvent::TypingIndicator {
            user_id: alice,
            is_typing: true
        }
    );

    alice_channel.disconnect();
    bob_channel.disconnect();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_pings_reach_both_transports() {
    let server = TestServer::start().await;

    for transport in [TransportKind::WebSocket, TransportKind::Polling] {
        let channel = server.channel(new_user(), vec![transport]);
        let mut events = channel.subscribe();
        channel.connect().await.expect("channel connects");

        expect_event(&mut events, |e| matches!(e, InboundEvent::Ping)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(channel.last_heartbeat().is_some(), "{transport} heartbeat recorded");
        assert!(channel.is_connected());

        channel.disconnect();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn busy_polling_link_keeps_its_heartbeat() {
    let server = TestServer::start().await;
    let user = new_user();
    // 服务端 ping 间隔 1s、长轮询等待 500ms；事件不断时轮询从不空闲超时
    let channel =
        server.channel_with_heartbeat(user, vec![TransportKind::Polling], Duration::from_secs(2));
    let mut events = channel.subscribe();
    connect_ready(&channel, &mut events).await;

    let hub = server.state.hub.clone();
    let pusher = tokio::spawn(async move {
        for _ in 0..40 {
            hub.send_to_user(user, &InboundEvent::NotificationUpdate);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    let (mut pings, mut notifications) = (0, 0);
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        match event {
            InboundEvent::Disconnect { reason } => panic!("busy link dropped: {reason}"),
            InboundEvent::Ping => pings += 1,
            InboundEvent::NotificationUpdate => notifications += 1,
            _ => {}
        }
    }
    pusher.await.expect("pusher finished");

    assert!(pings >= 2, "pings interleaved with events: {pings}");
    assert!(notifications >= 30, "notifications delivered: {notifications}");
    assert!(channel.is_connected());

    channel.disconnect();
}
