use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{SessionId, UserId, WorkflowId};
use crate::status::SessionStatus;

/// Durable session row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: SessionId,
    pub workflow_id: Option<WorkflowId>,
    pub user_id: Option<UserId>,
    pub status: SessionStatus,
    pub qr_code: Option<String>,
    pub pairing_code: Option<String>,
    pub phone_number: Option<String>,
    pub name: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a session is first created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewSession {
    pub id: SessionId,
    pub workflow_id: Option<WorkflowId>,
    pub user_id: Option<UserId>,
}

/// Partial session update. `None` leaves a column untouched; `Some(None)`
/// clears a nullable column.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub qr_code: Option<Option<String>>,
    pub pairing_code: Option<Option<String>>,
    pub phone_number: Option<Option<String>>,
    pub name: Option<Option<String>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub workflow_id: Option<Option<WorkflowId>>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Structural classification of an inbound message body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Sticker,
    Location,
    Contact,
    Poll,
    Reaction,
}

impl MessageType {
    /// First match wins, in declaration order. Bodies with no known
    /// content key are treated as text.
    pub fn classify(content: Option<&Value>) -> Self {
        const KEYS: &[(&str, MessageType)] = &[
            ("conversation", MessageType::Text),
            ("extendedTextMessage", MessageType::Text),
            ("imageMessage", MessageType::Image),
            ("videoMessage", MessageType::Video),
            ("audioMessage", MessageType::Audio),
            ("documentMessage", MessageType::Document),
            ("stickerMessage", MessageType::Sticker),
            ("locationMessage", MessageType::Location),
            ("contactMessage", MessageType::Contact),
            ("pollCreationMessage", MessageType::Poll),
            ("reactionMessage", MessageType::Reaction),
        ];

        let Some(body) = content.and_then(Value::as_object) else {
            return MessageType::Text;
        };
        KEYS.iter()
            .find(|(key, _)| body.get(*key).is_some_and(|v| !v.is_null()))
            .map(|(_, ty)| *ty)
            .unwrap_or(MessageType::Text)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Image => "IMAGE",
            Self::Video => "VIDEO",
            Self::Audio => "AUDIO",
            Self::Document => "DOCUMENT",
            Self::Sticker => "STICKER",
            Self::Location => "LOCATION",
            Self::Contact => "CONTACT",
            Self::Poll => "POLL",
            Self::Reaction => "REACTION",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TEXT" => Ok(Self::Text),
            "IMAGE" => Ok(Self::Image),
            "VIDEO" => Ok(Self::Video),
            "AUDIO" => Ok(Self::Audio),
            "DOCUMENT" => Ok(Self::Document),
            "STICKER" => Ok(Self::Sticker),
            "LOCATION" => Ok(Self::Location),
            "CONTACT" => Ok(Self::Contact),
            "POLL" => Ok(Self::Poll),
            "REACTION" => Ok(Self::Reaction),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// Persisted inbound or outbound message. Unique on (session_id, message_id).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub session_id: SessionId,
    pub message_id: String,
    pub chat_id: String,
    pub from_me: bool,
    pub from_jid: Option<String>,
    pub to_jid: Option<String>,
    pub message_type: MessageType,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
    pub quoted_message_id: Option<String>,
    pub metadata: Value,
    pub status: Option<String>,
}

/// Denormalized chat snapshot, keyed by (session_id, jid).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub session_id: SessionId,
    pub jid: String,
    pub name: Option<String>,
    pub is_group: bool,
    pub is_archived: bool,
    pub is_pinned: bool,
    pub is_muted: bool,
    pub unread_count: i64,
    pub last_message: Option<Value>,
    pub metadata: Value,
}

impl ChatRecord {
    /// Build a record from a raw protocol chat object. Returns `None` when
    /// the snapshot carries no id.
    pub fn from_snapshot(session_id: &SessionId, chat: &Value) -> Option<Self> {
        let jid = chat.get("id")?.as_str()?.to_string();
        Some(Self {
            session_id: session_id.clone(),
            is_group: is_group_jid(&jid),
            name: str_field(chat, "name"),
            is_archived: truthy(chat, "archived"),
            is_pinned: truthy(chat, "pinned"),
            is_muted: truthy(chat, "mute"),
            unread_count: chat.get("unreadCount").and_then(Value::as_i64).unwrap_or(0),
            last_message: chat.get("lastMessage").filter(|v| !v.is_null()).cloned(),
            metadata: chat.clone(),
            jid,
        })
    }
}

/// Denormalized group snapshot, keyed by (session_id, jid).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    pub session_id: SessionId,
    pub jid: String,
    pub subject: Option<String>,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub participants: Value,
    pub settings: Value,
    pub metadata: Value,
}

impl GroupRecord {
    pub fn from_snapshot(session_id: &SessionId, group: &Value) -> Option<Self> {
        let jid = group.get("id")?.as_str()?.to_string();
        Some(Self {
            session_id: session_id.clone(),
            subject: str_field(group, "subject"),
            description: str_field(group, "desc"),
            owner: str_field(group, "owner"),
            participants: group
                .get("participants")
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new())),
            settings: group.clone(),
            metadata: group.clone(),
            jid,
        })
    }
}

/// Caller-facing view of a live session. Never carries the socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub qr_code: Option<String>,
    pub pairing_code: Option<String>,
    pub phone_number: Option<String>,
    pub name: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub workflow_id: Option<WorkflowId>,
    pub user_id: Option<UserId>,
}

pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with("@g.us")
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn truthy(v: &Value, key: &str) -> bool {
    match v.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_text_variants() {
        assert_eq!(MessageType::classify(Some(&json!({"conversation": "hi"}))), MessageType::Text);
        assert_eq!(
            MessageType::classify(Some(&json!({"extendedTextMessage": {"text": "hi"}}))),
            MessageType::Text
        );
    }

    #[test]
    fn classify_media_and_structured() {
        let cases = [
            ("imageMessage", MessageType::Image),
            ("videoMessage", MessageType::Video),
            ("audioMessage", MessageType::Audio),
            ("documentMessage", MessageType::Document),
            ("stickerMessage", MessageType::Sticker),
            ("locationMessage", MessageType::Location),
            ("contactMessage", MessageType::Contact),
            ("pollCreationMessage", MessageType::Poll),
            ("reactionMessage", MessageType::Reaction),
        ];
        for (key, expected) in cases {
            let body = json!({ key: {} });
            assert_eq!(MessageType::classify(Some(&body)), expected, "{key}");
        }
    }

    #[test]
    fn classify_first_match_wins() {
        let body = json!({"imageMessage": {}, "conversation": "caption"});
        assert_eq!(MessageType::classify(Some(&body)), MessageType::Text);
    }

    #[test]
    fn classify_defaults_to_text() {
        assert_eq!(MessageType::classify(None), MessageType::Text);
        assert_eq!(MessageType::classify(Some(&json!({"unknownMessage": {}}))), MessageType::Text);
        assert_eq!(MessageType::classify(Some(&json!({"imageMessage": null}))), MessageType::Text);
    }

    #[test]
    fn chat_from_snapshot() {
        let sid = SessionId::from_raw("s1");
        let chat = json!({
            "id": "123@g.us",
            "name": "Team",
            "archived": true,
            "mute": 1700000000,
            "unreadCount": 3
        });
        let rec = ChatRecord::from_snapshot(&sid, &chat).unwrap();
        assert_eq!(rec.jid, "123@g.us");
        assert!(rec.is_group);
        assert!(rec.is_archived);
        assert!(!rec.is_pinned);
        assert!(rec.is_muted);
        assert_eq!(rec.unread_count, 3);
        assert_eq!(rec.metadata, chat);
    }

    #[test]
    fn chat_without_id_is_skipped() {
        let sid = SessionId::from_raw("s1");
        assert!(ChatRecord::from_snapshot(&sid, &json!({"name": "x"})).is_none());
    }

    #[test]
    fn group_from_snapshot() {
        let sid = SessionId::from_raw("s1");
        let group = json!({
            "id": "42@g.us",
            "subject": "Weekend",
            "desc": "plans",
            "owner": "1@s.whatsapp.net",
            "participants": [{"id": "1@s.whatsapp.net"}]
        });
        let rec = GroupRecord::from_snapshot(&sid, &group).unwrap();
        assert_eq!(rec.subject.as_deref(), Some("Weekend"));
        assert_eq!(rec.description.as_deref(), Some("plans"));
        assert_eq!(rec.participants.as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn patch_helpers() {
        assert!(SessionPatch::default().is_empty());
        let p = SessionPatch::status(SessionStatus::Connected);
        assert!(!p.is_empty());
        assert_eq!(p.status, Some(SessionStatus::Connected));
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let snap = SessionSnapshot {
            session_id: SessionId::from_raw("s1"),
            status: SessionStatus::QrRequired,
            qr_code: Some("data".into()),
            pairing_code: None,
            phone_number: None,
            name: None,
            last_seen: None,
            workflow_id: None,
            user_id: Some(UserId::from_raw("u1")),
        };
        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["sessionId"], "s1");
        assert_eq!(v["status"], "QR_REQUIRED");
        assert_eq!(v["qrCode"], "data");
        assert_eq!(v["userId"], "u1");
    }
}
