mod conversation_service;

pub use conversation_service::{
    BlockChange, ConversationService, ConversationServiceDependencies, StatusBatchOutcome,
    CONVERSATION_STATUS_NAMESPACE,
};
