use shared::{domain::CorrelationId, error::ApiError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Empty or unresolvable peer/group. Fatal to the requested operation.
    #[error("cannot address conversation: {0}")]
    Addressing(String),
    /// Channel open or send failure; handled by reconnect and polling.
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("collaborator rejected message {correlation_id}: {reason}")]
    Submission {
        correlation_id: CorrelationId,
        reason: String,
    },
    #[error("malformed channel event: {0}")]
    MalformedEvent(String),
    #[error("collaborator request failed: {0}")]
    Collaborator(String),
    #[error("session not ready: {0}")]
    NotReady(&'static str),
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("no message with correlation id {0}")]
    UnknownMessage(CorrelationId),
}

impl ChatError {
    pub fn submission(correlation_id: CorrelationId, err: &anyhow::Error) -> Self {
        let reason = match err.downcast_ref::<ApiError>() {
            Some(api) => api.message.clone(),
            None => err.to_string(),
        };
        Self::Submission {
            correlation_id,
            reason,
        }
    }

    pub fn collaborator(err: anyhow::Error) -> Self {
        Self::Collaborator(format!("{err:#}"))
    }
}
