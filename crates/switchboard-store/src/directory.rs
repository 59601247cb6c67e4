//! Chat and group snapshots. Both are keyed by (session_id, jid) and every
//! upsert overwrites the stored fields with the latest snapshot.

use chrono::Utc;
use tracing::instrument;

use switchboard_core::records::{ChatRecord, GroupRecord};
use switchboard_core::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{get, parse_json};

pub struct ChatRepo {
    db: Database,
}

impl ChatRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, chat), fields(session_id = %chat.session_id, jid = %chat.jid))]
    pub fn upsert(&self, chat: &ChatRecord) -> Result<(), StoreError> {
        let last_message = chat.last_message.as_ref().map(serde_json::to_string).transpose()?;
        let metadata = serde_json::to_string(&chat.metadata)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chats (session_id, jid, name, is_group, is_archived, is_pinned,
                                    is_muted, unread_count, last_message, metadata, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(session_id, jid) DO UPDATE SET
                     name = excluded.name,
                     is_group = excluded.is_group,
                     is_archived = excluded.is_archived,
                     is_pinned = excluded.is_pinned,
                     is_muted = excluded.is_muted,
                     unread_count = excluded.unread_count,
                     last_message = excluded.last_message,
                     metadata = excluded.metadata,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    chat.session_id.as_str(),
                    chat.jid,
                    chat.name,
                    chat.is_group,
                    chat.is_archived,
                    chat.is_pinned,
                    chat.is_muted,
                    chat.unread_count,
                    last_message,
                    metadata,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn list(&self, session_id: &SessionId) -> Result<Vec<ChatRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, jid, name, is_group, is_archived, is_pinned, is_muted,
                        unread_count, last_message, metadata
                 FROM chats WHERE session_id = ?1 ORDER BY jid",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                const T: &str = "chats";
                let last_message: Option<String> = get(row, 8, T, "last_message")?;
                let metadata: String = get(row, 9, T, "metadata")?;
                results.push(ChatRecord {
                    session_id: SessionId::from_raw(get::<String>(row, 0, T, "session_id")?),
                    jid: get(row, 1, T, "jid")?,
                    name: get(row, 2, T, "name")?,
                    is_group: get(row, 3, T, "is_group")?,
                    is_archived: get(row, 4, T, "is_archived")?,
                    is_pinned: get(row, 5, T, "is_pinned")?,
                    is_muted: get(row, 6, T, "is_muted")?,
                    unread_count: get(row, 7, T, "unread_count")?,
                    last_message: last_message
                        .map(|raw| parse_json(&raw, T, "last_message"))
                        .transpose()?,
                    metadata: parse_json(&metadata, T, "metadata")?,
                });
            }
            Ok(results)
        })
    }
}

pub struct GroupRepo {
    db: Database,
}

impl GroupRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, group), fields(session_id = %group.session_id, jid = %group.jid))]
    pub fn upsert(&self, group: &GroupRecord) -> Result<(), StoreError> {
        let participants = serde_json::to_string(&group.participants)?;
        let settings = serde_json::to_string(&group.settings)?;
        let metadata = serde_json::to_string(&group.metadata)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_groups (session_id, jid, subject, description, owner,
                                          participants, settings, metadata, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(session_id, jid) DO UPDATE SET
                     subject = excluded.subject,
                     description = excluded.description,
                     owner = excluded.owner,
                     participants = excluded.participants,
                     settings = excluded.settings,
                     metadata = excluded.metadata,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    group.session_id.as_str(),
                    group.jid,
                    group.subject,
                    group.description,
                    group.owner,
                    participants,
                    settings,
                    metadata,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn list(&self, session_id: &SessionId) -> Result<Vec<GroupRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, jid, subject, description, owner, participants, settings, metadata
                 FROM chat_groups WHERE session_id = ?1 ORDER BY jid",
            )?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                const T: &str = "chat_groups";
                let participants: String = get(row, 5, T, "participants")?;
                let settings: String = get(row, 6, T, "settings")?;
                let metadata: String = get(row, 7, T, "metadata")?;
                results.push(GroupRecord {
                    session_id: SessionId::from_raw(get::<String>(row, 0, T, "session_id")?),
                    jid: get(row, 1, T, "jid")?,
                    subject: get(row, 2, T, "subject")?,
                    description: get(row, 3, T, "description")?,
                    owner: get(row, 4, T, "owner")?,
                    participants: parse_json(&participants, T, "participants")?,
                    settings: parse_json(&settings, T, "settings")?,
                    metadata: parse_json(&metadata, T, "metadata")?,
                });
            }
            Ok(results)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_upsert_overwrites_snapshot() {
        let repo = ChatRepo::new(Database::in_memory().unwrap());
        let sid = SessionId::from_raw("s1");
        let first = ChatRecord::from_snapshot(&sid, &json!({"id": "a@s.whatsapp.net", "unreadCount": 5, "pinned": true})).unwrap();
        repo.upsert(&first).unwrap();

        let second = ChatRecord::from_snapshot(&sid, &json!({"id": "a@s.whatsapp.net", "name": "Ada"})).unwrap();
        repo.upsert(&second).unwrap();

        let chats = repo.list(&sid).unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0], second);
        assert_eq!(chats[0].unread_count, 0);
        assert!(!chats[0].is_pinned);
    }

    #[test]
    fn chats_are_scoped_by_session() {
        let repo = ChatRepo::new(Database::in_memory().unwrap());
        let chat = json!({"id": "a@s.whatsapp.net"});
        repo.upsert(&ChatRecord::from_snapshot(&SessionId::from_raw("s1"), &chat).unwrap()).unwrap();
        repo.upsert(&ChatRecord::from_snapshot(&SessionId::from_raw("s2"), &chat).unwrap()).unwrap();
        assert_eq!(repo.list(&SessionId::from_raw("s1")).unwrap().len(), 1);
        assert_eq!(repo.list(&SessionId::from_raw("s2")).unwrap().len(), 1);
    }

    #[test]
    fn group_upsert_overwrites_snapshot() {
        let repo = GroupRepo::new(Database::in_memory().unwrap());
        let sid = SessionId::from_raw("s1");
        let g1 = GroupRecord::from_snapshot(&sid, &json!({"id": "g@g.us", "subject": "Old"})).unwrap();
        let g2 = GroupRecord::from_snapshot(
            &sid,
            &json!({"id": "g@g.us", "subject": "New", "participants": [{"id": "x"}]}),
        )
        .unwrap();
        repo.upsert(&g1).unwrap();
        repo.upsert(&g2).unwrap();
        let groups = repo.list(&sid).unwrap();
        assert_eq!(groups, vec![g2]);
    }
}
