//! Boundary to the external protocol library.
//!
//! A [`SocketConnector`] opens one socket per session and hands back the
//! socket handle plus the ordered stream of [`ProtocolEvent`]s it emits. The
//! lifecycle controller is the only caller of either trait.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::events::ProtocolEvent;
use crate::ids::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("pairing code request failed: {0}")]
    Pairing(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("socket closed")]
    Closed,
}

/// Identity of the authenticated account behind a socket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketUser {
    /// Protocol jid, e.g. `15551234567:12@s.whatsapp.net`.
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl SocketUser {
    /// Bare phone number: the jid with its device and server suffixes removed.
    pub fn phone_number(&self) -> String {
        let bare = self.id.split(':').next().unwrap_or_default();
        bare.split('@').next().unwrap_or_default().to_string()
    }
}

#[derive(Clone, Debug)]
pub struct ConnectRequest {
    pub session_id: SessionId,
    /// Directory holding this session's credential material.
    pub auth_dir: PathBuf,
    pub use_pairing_code: bool,
}

pub struct SocketConnection {
    pub socket: Arc<dyn ProtocolSocket>,
    pub events: mpsc::Receiver<ProtocolEvent>,
}

#[async_trait]
pub trait ProtocolSocket: Send + Sync {
    /// Authenticated account, once the handshake has produced one.
    fn user(&self) -> Option<SocketUser>;

    /// Whether the loaded credentials are already linked to a device.
    fn is_registered(&self) -> bool;

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, SocketError>;

    /// Send `content` to the chat `to`. Returns the protocol's echo of the sent message.
    async fn send_message(&self, to: &str, content: Value) -> Result<Value, SocketError>;

    async fn end(&self, reason: Option<String>) -> Result<(), SocketError>;
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<SocketConnection, SocketError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_number_strips_device_and_server() {
        let user = SocketUser {
            id: "15551234567:12@s.whatsapp.net".into(),
            name: Some("Ada".into()),
        };
        assert_eq!(user.phone_number(), "15551234567");
    }

    #[test]
    fn phone_number_without_device_suffix() {
        let user = SocketUser {
            id: "15551234567@s.whatsapp.net".into(),
            name: None,
        };
        assert_eq!(user.phone_number(), "15551234567");
    }

    #[test]
    fn socket_error_display() {
        assert_eq!(SocketError::Closed.to_string(), "socket closed");
        assert_eq!(
            SocketError::Connect("refused".into()).to_string(),
            "connect failed: refused"
        );
    }
}
