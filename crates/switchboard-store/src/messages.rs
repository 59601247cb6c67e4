use chrono::Utc;
use tracing::instrument;

use switchboard_core::records::MessageRecord;
use switchboard_core::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{get, parse_enum, parse_json, parse_time};

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn exists(&self, session_id: &SessionId, message_id: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let found: i64 = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE session_id = ?1 AND message_id = ?2)",
                rusqlite::params![session_id.as_str(), message_id],
                |row| row.get(0),
            )?;
            Ok(found != 0)
        })
    }

    /// Insert unless (session_id, message_id) is already stored. Returns
    /// whether a row was written.
    #[instrument(skip(self, msg), fields(session_id = %msg.session_id, message_id = %msg.message_id))]
    pub fn insert(&self, msg: &MessageRecord) -> Result<bool, StoreError> {
        let content = serde_json::to_string(&msg.content)?;
        let metadata = serde_json::to_string(&msg.metadata)?;
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO messages (session_id, message_id, chat_id, from_me, from_jid, to_jid,
                                       message_type, content, timestamp, quoted_message_id,
                                       metadata, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(session_id, message_id) DO NOTHING",
                rusqlite::params![
                    msg.session_id.as_str(),
                    msg.message_id,
                    msg.chat_id,
                    msg.from_me,
                    msg.from_jid,
                    msg.to_jid,
                    msg.message_type.as_str(),
                    content,
                    msg.timestamp.to_rfc3339(),
                    msg.quoted_message_id,
                    metadata,
                    msg.status,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(changed > 0)
        })
    }

    /// Returns false when no such message is stored.
    pub fn update_status(
        &self,
        session_id: &SessionId,
        message_id: &str,
        status: &str,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = ?1 WHERE session_id = ?2 AND message_id = ?3",
                rusqlite::params![status, session_id.as_str(), message_id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Messages for a session in insertion order.
    pub fn list(&self, session_id: &SessionId, limit: u32) -> Result<Vec<MessageRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, message_id, chat_id, from_me, from_jid, to_jid, message_type,
                        content, timestamp, quoted_message_id, metadata, status
                 FROM messages WHERE session_id = ?1 ORDER BY id LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<MessageRecord, StoreError> {
    const T: &str = "messages";
    let message_type: String = get(row, 6, T, "message_type")?;
    let content: String = get(row, 7, T, "content")?;
    let timestamp: String = get(row, 8, T, "timestamp")?;
    let metadata: String = get(row, 10, T, "metadata")?;

    Ok(MessageRecord {
        session_id: SessionId::from_raw(get::<String>(row, 0, T, "session_id")?),
        message_id: get(row, 1, T, "message_id")?,
        chat_id: get(row, 2, T, "chat_id")?,
        from_me: get(row, 3, T, "from_me")?,
        from_jid: get(row, 4, T, "from_jid")?,
        to_jid: get(row, 5, T, "to_jid")?,
        message_type: parse_enum(&message_type, T, "message_type")?,
        content: parse_json(&content, T, "content")?,
        timestamp: parse_time(&timestamp, T, "timestamp")?,
        quoted_message_id: get(row, 9, T, "quoted_message_id")?,
        metadata: parse_json(&metadata, T, "metadata")?,
        status: get(row, 11, T, "status")?,
    })
}
