//! Web API 层。
//!
//! 提供 Axum 路由：`/ws` 与 `/channel/sessions` 两种通道入口，以及通道不可用时的 REST 降级端点。

mod auth;
mod error;
mod hub;
mod polling;
mod protocol;
mod routes;
mod state;
mod ws;

pub use auth::{AuthUser, Claims, JwtService};
pub use error::ApiError;
pub use hub::{Peer, SessionHub, SessionId};
pub use polling::{spawn_reaper, PollingSessions};
pub use routes::router;
pub use state::AppState;
