use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SessionId;
use crate::records::{ChatRecord, GroupRecord, MessageRecord, SessionSnapshot};

/// Raw event delivered by a protocol socket, in arrival order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    ConnectionUpdate(ConnectionUpdate),
    CredentialsUpdate {
        creds: Value,
    },
    MessagesUpsert {
        messages: Vec<InboundMessage>,
        #[serde(default)]
        upsert_type: Option<String>,
    },
    MessagesUpdate {
        updates: Vec<MessageStatusUpdate>,
    },
    ChatsUpsert {
        chats: Vec<Value>,
    },
    ContactsUpsert {
        contacts: Vec<Value>,
    },
    GroupsUpsert {
        groups: Vec<Value>,
    },
}

impl ProtocolEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionUpdate(_) => "connection_update",
            Self::CredentialsUpdate { .. } => "credentials_update",
            Self::MessagesUpsert { .. } => "messages_upsert",
            Self::MessagesUpdate { .. } => "messages_update",
            Self::ChatsUpsert { .. } => "chats_upsert",
            Self::ContactsUpsert { .. } => "contacts_upsert",
            Self::GroupsUpsert { .. } => "groups_upsert",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Close,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdate {
    #[serde(default)]
    pub connection: Option<ConnectionState>,
    #[serde(default)]
    pub last_disconnect: Option<DisconnectInfo>,
    #[serde(default)]
    pub qr: Option<String>,
}

impl ConnectionUpdate {
    pub fn qr(payload: impl Into<String>) -> Self {
        Self {
            qr: Some(payload.into()),
            ..Default::default()
        }
    }

    pub fn open() -> Self {
        Self {
            connection: Some(ConnectionState::Open),
            ..Default::default()
        }
    }

    pub fn closed(status_code: Option<u16>) -> Self {
        Self {
            connection: Some(ConnectionState::Close),
            last_disconnect: Some(DisconnectInfo {
                status_code,
                message: None,
            }),
            qr: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectInfo {
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}

impl DisconnectInfo {
    pub fn reason(&self) -> DisconnectReason {
        DisconnectReason::from_code(self.status_code)
    }
}

/// Close reasons reported by the protocol library.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// 401: credentials revoked from the device.
    LoggedOut,
    /// 408: connection lost or timed out.
    ConnectionLost,
    /// 411
    MultideviceMismatch,
    /// 403
    Forbidden,
    /// 428
    ConnectionClosed,
    /// 440: another client took over this session.
    ConnectionReplaced,
    /// 500
    BadSession,
    /// 503
    Unavailable,
    /// 515: the server asks for a fresh socket, typically right after pairing.
    RestartRequired,
    Unknown(Option<u16>),
}

impl DisconnectReason {
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(401) => Self::LoggedOut,
            Some(403) => Self::Forbidden,
            Some(408) => Self::ConnectionLost,
            Some(411) => Self::MultideviceMismatch,
            Some(428) => Self::ConnectionClosed,
            Some(440) => Self::ConnectionReplaced,
            Some(500) => Self::BadSession,
            Some(503) => Self::Unavailable,
            Some(515) => Self::RestartRequired,
            other => Self::Unknown(other),
        }
    }

    /// Only an explicit logout ends a session. Every other close is transient.
    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    #[serde(default)]
    pub remote_jid: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub participant: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub key: MessageKey,
    #[serde(default)]
    pub message: Option<Value>,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub message_timestamp: Option<i64>,
    #[serde(default)]
    pub push_name: Option<String>,
}

impl InboundMessage {
    /// Id of the message this one replies to, if any.
    pub fn quoted_message_id(&self) -> Option<String> {
        let context = self
            .message
            .as_ref()?
            .get("extendedTextMessage")?
            .get("contextInfo")?;
        context.get("quotedMessage").filter(|v| !v.is_null())?;
        context
            .get("stanzaId")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageStatusUpdate {
    pub key: MessageKey,
    #[serde(default)]
    pub update: Value,
}

impl MessageStatusUpdate {
    /// Delivery status carried by the update, numeric codes rendered as text.
    pub fn status(&self) -> Option<String> {
        match self.update.get("status")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Domain event published to live subscribers and the webhook dispatcher.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DomainEvent {
    SessionUpdate {
        session_id: SessionId,
        session: SessionSnapshot,
    },
    Message {
        session_id: SessionId,
        message: MessageRecord,
    },
    MessageUpdate {
        session_id: SessionId,
        update: MessageStatusUpdate,
    },
    ChatUpdate {
        session_id: SessionId,
        chat: ChatRecord,
    },
    ContactUpdate {
        session_id: SessionId,
        contact: Value,
    },
    GroupUpdate {
        session_id: SessionId,
        group: GroupRecord,
    },
}

impl DomainEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionUpdate { session_id, .. }
            | Self::Message { session_id, .. }
            | Self::MessageUpdate { session_id, .. }
            | Self::ChatUpdate { session_id, .. }
            | Self::ContactUpdate { session_id, .. }
            | Self::GroupUpdate { session_id, .. } => session_id,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "sessionUpdate",
            Self::Message { .. } => "message",
            Self::MessageUpdate { .. } => "messageUpdate",
            Self::ChatUpdate { .. } => "chatUpdate",
            Self::ContactUpdate { .. } => "contactUpdate",
            Self::GroupUpdate { .. } => "groupUpdate",
        }
    }
}
