use switchboard_core::socket::SocketError;
use switchboard_core::{SessionId, SessionStatus};
use switchboard_store::StoreError;

/// Caller-facing failures of session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session already exists: {0}")]
    DuplicateSession(SessionId),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session {id} not ready: {reason}")]
    SessionNotReady { id: SessionId, reason: String },

    #[error("initialization failed for {id}: {reason}")]
    Initialization { id: SessionId, reason: String },

    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("session {id} is {status} and is not restored automatically")]
    NotRestorable { id: SessionId, status: SessionStatus },

    #[error("credential storage error: {0}")]
    Credentials(String),

    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SessionError {
    pub(crate) fn not_ready(id: &SessionId, reason: impl Into<String>) -> Self {
        Self::SessionNotReady {
            id: id.clone(),
            reason: reason.into(),
        }
    }
}
