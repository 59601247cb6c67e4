use async_trait::async_trait;

use switchboard_core::records::{
    ChatRecord, GroupRecord, MessageRecord, NewSession, SessionPatch, SessionRecord,
};
use switchboard_core::SessionId;

use crate::database::Database;
use crate::directory::{ChatRepo, GroupRepo};
use crate::error::StoreError;
use crate::messages::MessageRepo;
use crate::sessions::SessionRepo;

/// Result of [`SessionStore::save_message`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    /// (session_id, message_id) was already stored; nothing was written.
    Duplicate,
}

/// Durable store boundary consumed by the session engine.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fails with `Conflict` when a live session with the same id exists.
    async fn create_session(&self, new: NewSession) -> Result<SessionRecord, StoreError>;
    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError>;
    async fn update_session(&self, id: &SessionId, patch: SessionPatch) -> Result<(), StoreError>;
    /// Soft delete. Returns false when there was no live record.
    async fn delete_session(&self, id: &SessionId) -> Result<bool, StoreError>;
    /// Hard delete of the session and everything recorded under it.
    async fn permanently_delete_session(&self, id: &SessionId) -> Result<bool, StoreError>;
    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;

    async fn message_exists(&self, session_id: &SessionId, message_id: &str) -> Result<bool, StoreError>;
    /// A no-op on a duplicate (session_id, message_id), never an error.
    async fn save_message(&self, message: MessageRecord) -> Result<SaveOutcome, StoreError>;
    async fn update_message_status(
        &self,
        session_id: &SessionId,
        message_id: &str,
        status: &str,
    ) -> Result<bool, StoreError>;
    async fn list_messages(&self, session_id: &SessionId, limit: u32) -> Result<Vec<MessageRecord>, StoreError>;

    async fn upsert_chat(&self, chat: ChatRecord) -> Result<(), StoreError>;
    async fn list_chats(&self, session_id: &SessionId) -> Result<Vec<ChatRecord>, StoreError>;
    async fn upsert_group(&self, group: GroupRecord) -> Result<(), StoreError>;
    async fn list_groups(&self, session_id: &SessionId) -> Result<Vec<GroupRecord>, StoreError>;
}

/// [`SessionStore`] over SQLite. Each call runs on the blocking pool so a
/// slow write never stalls the runtime thread that delivered the event.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(db)).await?
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(&self, new: NewSession) -> Result<SessionRecord, StoreError> {
        self.blocking(move |db| SessionRepo::new(db).create(&new)).await
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let id = id.clone();
        self.blocking(move |db| SessionRepo::new(db).get(&id)).await
    }

    async fn update_session(&self, id: &SessionId, patch: SessionPatch) -> Result<(), StoreError> {
        let id = id.clone();
        self.blocking(move |db| SessionRepo::new(db).update(&id, &patch)).await
    }

    async fn delete_session(&self, id: &SessionId) -> Result<bool, StoreError> {
        let id = id.clone();
        self.blocking(move |db| SessionRepo::new(db).soft_delete(&id)).await
    }

    async fn permanently_delete_session(&self, id: &SessionId) -> Result<bool, StoreError> {
        let id = id.clone();
        self.blocking(move |db| SessionRepo::new(db).purge(&id)).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.blocking(|db| SessionRepo::new(db).list()).await
    }

    async fn message_exists(&self, session_id: &SessionId, message_id: &str) -> Result<bool, StoreError> {
        let (sid, mid) = (session_id.clone(), message_id.to_string());
        self.blocking(move |db| MessageRepo::new(db).exists(&sid, &mid)).await
    }

    async fn save_message(&self, message: MessageRecord) -> Result<SaveOutcome, StoreError> {
        self.blocking(move |db| {
            let inserted = MessageRepo::new(db).insert(&message)?;
            Ok(if inserted {
                SaveOutcome::Inserted
            } else {
                SaveOutcome::Duplicate
            })
        })
        .await
    }

    async fn update_message_status(
        &self,
        session_id: &SessionId,
        message_id: &str,
        status: &str,
    ) -> Result<bool, StoreError> {
        let (sid, mid, status) = (session_id.clone(), message_id.to_string(), status.to_string());
        self.blocking(move |db| MessageRepo::new(db).update_status(&sid, &mid, &status))
            .await
    }

    async fn list_messages(&self, session_id: &SessionId, limit: u32) -> Result<Vec<MessageRecord>, StoreError> {
        let sid = session_id.clone();
        self.blocking(move |db| MessageRepo::new(db).list(&sid, limit)).await
    }

    async fn upsert_chat(&self, chat: ChatRecord) -> Result<(), StoreError> {
        self.blocking(move |db| ChatRepo::new(db).upsert(&chat)).await
    }

    async fn list_chats(&self, session_id: &SessionId) -> Result<Vec<ChatRecord>, StoreError> {
        let sid = session_id.clone();
        self.blocking(move |db| ChatRepo::new(db).list(&sid)).await
    }

    async fn upsert_group(&self, group: GroupRecord) -> Result<(), StoreError> {
        self.blocking(move |db| GroupRepo::new(db).upsert(&group)).await
    }

    async fn list_groups(&self, session_id: &SessionId) -> Result<Vec<GroupRecord>, StoreError> {
        let sid = session_id.clone();
        self.blocking(move |db| GroupRepo::new(db).list(&sid)).await
    }
}
