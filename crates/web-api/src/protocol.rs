//! 上行事件处理
//!
//! WebSocket 与长轮询两种会话收到的客户端事件都交给 [`handle_client_event`]，
//! 结果通过 [`SessionHub`](crate::hub::SessionHub) 推送给相关用户。

use application::ApplicationError;
use domain::{ClientEvent, ConversationStatus, ErrorCode, InboundEvent, MessageId, MessageStatus, UserId};
use tracing::{debug, info, warn};

use crate::hub::Peer;
use crate::state::AppState;

pub async fn handle_client_event(state: &AppState, peer: Peer, event: ClientEvent) {
    debug!(user = %peer.user, event = event.name(), "收到上行事件");

    match event {
        ClientEvent::UserMessage {
            receiver_id,
            content,
        } => user_message(state, peer, receiver_id, content).await,
        ClientEvent::MessageStatusUpdate { message_id, status } => {
            status_update(state, peer, &[message_id], status, false).await
        }
        ClientEvent::MessageStatusBatchUpdate {
            message_ids,
            status,
        } => status_update(state, peer, &message_ids, status, true).await,
        ClientEvent::TypingIndicator {
            receiver_id,
            is_typing,
        } => {
            if let Err(err) = relay_typing(state, peer.user, receiver_id, is_typing).await {
                reply_error(state, peer, &err);
            }
        }
        ClientEvent::RefreshConversation {
            other_user_id,
            force,
        } => refresh_conversation(state, peer, other_user_id, force).await,
        ClientEvent::Pong => {}
    }
}

async fn user_message(state: &AppState, peer: Peer, receiver_id: UserId, content: String) {
    if let Err(err) = state.rate_limiter.check_message_rate(peer.user) {
        reply_error(state, peer, &ApplicationError::from(err));
        return;
    }

    match state
        .conversation_service
        .send_message(peer.user, receiver_id, content)
        .await
    {
        Ok(message) => {
            let id = message.id;
            let delivered = state
                .hub
                .send_to_user(receiver_id, &InboundEvent::NewMessage { message });
            state.hub.send_to_peer(peer, InboundEvent::MessageSent { id });
            info!(sender = %peer.user, receiver = %receiver_id, %id, delivered, "私聊消息已发送");
        }
        Err(err) => reply_error(state, peer, &err),
    }
}

/// 状态确认同时推给操作方与消息发送方；批量请求只产生一条批量确认
async fn status_update(
    state: &AppState,
    peer: Peer,
    ids: &[MessageId],
    status: MessageStatus,
    batch: bool,
) {
    let outcome = match state
        .conversation_service
        .apply_status_batch(peer.user, ids, status)
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            reply_error(state, peer, &err);
            return;
        }
    };
    if outcome.is_empty() {
        debug!(user = %peer.user, requested = ids.len(), "没有可推进的消息状态");
        return;
    }

    let confirmation = match (batch, outcome.ids.as_slice()) {
        (false, [id]) => InboundEvent::MessageStatus {
            id: *id,
            status: outcome.status,
        },
        _ => InboundEvent::MessageStatusBatch {
            ids: outcome.ids.clone(),
            status: outcome.status,
        },
    };

    state.hub.send_to_user(peer.user, &confirmation);
    for sender in outcome.senders.iter().filter(|sender| **sender != peer.user) {
        state.hub.send_to_user(*sender, &confirmation);
    }
}

/// 转发输入状态；封禁的会话静默丢弃
pub async fn relay_typing(
    state: &AppState,
    sender: UserId,
    receiver_id: UserId,
    is_typing: bool,
) -> Result<bool, ApplicationError> {
    let status = state
        .conversation_service
        .conversation_status(sender, receiver_id)
        .await?;
    if status.is_blocked {
        return Ok(false);
    }

    let delivered = state.hub.send_to_user(
        receiver_id,
        &InboundEvent::TypingIndicator {
            user_id: sender,
            is_typing,
        },
    );
    Ok(delivered > 0)
}

async fn refresh_conversation(state: &AppState, peer: Peer, other: UserId, force: bool) {
    let service = &state.conversation_service;
    let result = if force {
        service.refresh_conversation_status(peer.user, other).await
    } else {
        service.conversation_status(peer.user, other).await
    };

    match result {
        Ok(status) => {
            state.hub.send_to_peer(peer, status_event(&status));
        }
        Err(err) => reply_error(state, peer, &err),
    }
}

pub fn status_event(status: &ConversationStatus) -> InboundEvent {
    InboundEvent::ConversationStatusUpdate {
        user_id: status.user_id,
        is_blocked: status.is_blocked,
    }
}

fn reply_error(state: &AppState, peer: Peer, err: &ApplicationError) {
    let event = error_event(err);
    warn!(user = %peer.user, error = %err, "上行事件处理失败");
    state.hub.send_to_peer(peer, event);
}

/// 应用错误到通道错误事件
pub fn error_event(err: &ApplicationError) -> InboundEvent {
    let code = match err {
        ApplicationError::ConversationBlocked => ErrorCode::ConversationBlocked,
        ApplicationError::RateLimited(_) => ErrorCode::RateLimitExceeded,
        ApplicationError::Domain(_) => ErrorCode::Other("INVALID_ARGUMENT".to_string()),
        _ => ErrorCode::Other("INTERNAL_ERROR".to_string()),
    };
    InboundEvent::error(code, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use application::RateLimitError;
    use domain::DomainError;

    #[test]
    fn error_codes_match_channel_contract() {
        let event = error_event(&ApplicationError::ConversationBlocked);
        assert!(matches!(
            event,
            InboundEvent::Error { code: ErrorCode::ConversationBlocked, .. }
        ));

        let event = error_event(&ApplicationError::from(RateLimitError::RateLimitExceeded {
            current: 1,
            max: 1,
        }));
        assert!(matches!(
            event,
            InboundEvent::Error { code: ErrorCode::RateLimitExceeded, .. }
        ));

        let event = error_event(&ApplicationError::from(DomainError::validation_error(
            "content", "empty",
        )));
        assert!(matches!(
            event,
            InboundEvent::Error { code: ErrorCode::Other(ref code), .. } if code == "INVALID_ARGUMENT"
        ));
    }
}
