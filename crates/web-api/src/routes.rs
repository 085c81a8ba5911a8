use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use application::CacheStats;
use domain::{ConversationStatus, UserId};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::polling::{close_session, create_session, poll_events, submit_event};
use crate::protocol::{relay_typing, status_event};
use crate::state::AppState;
use crate::ws::websocket_upgrade;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingPayload {
    receiver_id: Uuid,
    is_typing: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TypingResponse {
    delivered: bool,
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockPayload {
    is_blocked: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket_upgrade))
        .nest("/channel", channel_routes())
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn channel_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{session_id}", delete(close_session))
        .route(
            "/sessions/{session_id}/events",
            get(poll_events).post(submit_event),
        )
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/typing-indicator", post(typing_indicator))
        .route("/conversations/{user_id}/status", get(conversation_status))
        .route("/conversations/{user_id}/block", post(block_user))
        .route("/cache/stats", get(cache_stats))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// 通道不可用时的输入状态上报
async fn typing_indicator(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<TypingPayload>,
) -> Result<Json<TypingResponse>, ApiError> {
    let delivered = relay_typing(&state, user, UserId(payload.receiver_id), payload.is_typing).await?;
    Ok(Json(TypingResponse { delivered }))
}

/// `force=true` 跳过服务端缓存
async fn conversation_status(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(other): Path<Uuid>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<ConversationStatus>, ApiError> {
    let service = &state.conversation_service;
    let status = if query.force {
        service.refresh_conversation_status(user, UserId(other)).await?
    } else {
        service.conversation_status(user, UserId(other)).await?
    };
    Ok(Json(status))
}

/// 变更封禁关系，并通过通道通知双方
async fn block_user(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(other): Path<Uuid>,
    Json(payload): Json<BlockPayload>,
) -> Result<Json<ConversationStatus>, ApiError> {
    let other = UserId(other);
    if other == user {
        return Err(ApiError::bad_request("cannot block yourself"));
    }

    let change = state
        .conversation_service
        .set_blocked(user, other, payload.is_blocked)
        .await?;

    state
        .hub
        .send_to_user(user, &status_event(&change.blocker_view));
    state
        .hub
        .send_to_user(other, &status_event(&change.blocked_view));
    info!(blocker = %user, blocked = %other, is_blocked = payload.is_blocked, "封禁状态已推送");

    Ok(Json(change.blocker_view))
}

async fn cache_stats(
    State(state): State<AppState>,
    AuthUser(_user): AuthUser,
) -> Json<CacheStats> {
    Json(state.conversation_service.status_cache().stats())
}
