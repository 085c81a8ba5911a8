use std::sync::Arc;

use application::{ConversationService, MessageRateLimiter};
use config::ServerConfig;

use crate::hub::SessionHub;
use crate::polling::PollingSessions;
use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub conversation_service: Arc<ConversationService>,
    pub hub: Arc<SessionHub>,
    pub polling: Arc<PollingSessions>,
    pub jwt_service: Arc<JwtService>,
    pub rate_limiter: Arc<MessageRateLimiter>,
    pub server: ServerConfig,
}

impl AppState {
    pub fn new(
        conversation_service: Arc<ConversationService>,
        jwt_service: Arc<JwtService>,
        server: ServerConfig,
    ) -> Self {
        Self {
            conversation_service,
            hub: Arc::new(SessionHub::new()),
            polling: Arc::new(PollingSessions::new()),
            jwt_service,
            rate_limiter: Arc::new(MessageRateLimiter::default()),
            server,
        }
    }

    pub fn with_rate_limiter(mut self, rate_limiter: MessageRateLimiter) -> Self {
        self.rate_limiter = Arc::new(rate_limiter);
        self
    }
}
