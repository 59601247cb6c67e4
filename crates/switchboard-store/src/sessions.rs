use chrono::Utc;
use rusqlite::types::ToSql;
use tracing::instrument;

use switchboard_core::records::{NewSession, SessionPatch, SessionRecord};
use switchboard_core::{SessionId, UserId, WorkflowId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{get, parse_enum, parse_time, parse_time_opt};

const COLUMNS: &str = "id, workflow_id, user_id, status, qr_code, pairing_code, phone_number,
                       name, last_seen, created_at, updated_at";

/// Session rows. Deletion is soft: a deleted row stays on disk with
/// `deleted_at` set and is invisible to every read.
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a session in INIT status. A soft-deleted row with the same id
    /// is revived with fresh fields; a live one is a conflict.
    #[instrument(skip(self, new), fields(session_id = %new.id))]
    pub fn create(&self, new: &NewSession) -> Result<SessionRecord, StoreError> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT INTO sessions (id, workflow_id, user_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'INIT', ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     workflow_id = excluded.workflow_id,
                     user_id = excluded.user_id,
                     status = 'INIT',
                     qr_code = NULL,
                     pairing_code = NULL,
                     phone_number = NULL,
                     name = NULL,
                     last_seen = NULL,
                     created_at = excluded.created_at,
                     updated_at = excluded.updated_at,
                     deleted_at = NULL
                 WHERE sessions.deleted_at IS NOT NULL",
                rusqlite::params![
                    new.id.as_str(),
                    new.workflow_id.as_ref().map(WorkflowId::as_str),
                    new.user_id.as_ref().map(UserId::as_str),
                    now_str,
                ],
            )?)
        })?;

        if changed == 0 {
            return Err(StoreError::Conflict(format!("session {} already exists", new.id)));
        }

        Ok(SessionRecord {
            id: new.id.clone(),
            workflow_id: new.workflow_id.clone(),
            user_id: new.user_id.clone(),
            status: switchboard_core::SessionStatus::Init,
            qr_code: None,
            pairing_code: None,
            phone_number: None,
            name: None,
            last_seen: None,
            created_at: now,
            updated_at: now,
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM sessions WHERE id = ?1 AND deleted_at IS NULL"
            ))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_session(row).map(Some),
                None => Ok(None),
            }
        })
    }

    /// Live sessions, oldest first.
    pub fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM sessions WHERE deleted_at IS NULL ORDER BY created_at, id"
            ))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Apply a partial update. Fails with NotFound for unknown or deleted ids.
    #[instrument(skip(self, patch), fields(session_id = %id))]
    pub fn update(&self, id: &SessionId, patch: &SessionPatch) -> Result<(), StoreError> {
        let mut columns: Vec<&'static str> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = patch.status {
            columns.push("status");
            params.push(Box::new(status.to_string()));
        }
        if let Some(qr) = &patch.qr_code {
            columns.push("qr_code");
            params.push(Box::new(qr.clone()));
        }
        if let Some(code) = &patch.pairing_code {
            columns.push("pairing_code");
            params.push(Box::new(code.clone()));
        }
        if let Some(phone) = &patch.phone_number {
            columns.push("phone_number");
            params.push(Box::new(phone.clone()));
        }
        if let Some(name) = &patch.name {
            columns.push("name");
            params.push(Box::new(name.clone()));
        }
        if let Some(last_seen) = patch.last_seen {
            columns.push("last_seen");
            params.push(Box::new(last_seen.to_rfc3339()));
        }
        if let Some(workflow_id) = &patch.workflow_id {
            columns.push("workflow_id");
            params.push(Box::new(workflow_id.as_ref().map(|w| w.as_str().to_string())));
        }
        columns.push("updated_at");
        params.push(Box::new(Utc::now().to_rfc3339()));

        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{col} = ?{}", i + 1))
            .collect();
        let sql = format!(
            "UPDATE sessions SET {} WHERE id = ?{} AND deleted_at IS NULL",
            assignments.join(", "),
            params.len() + 1
        );
        params.push(Box::new(id.as_str().to_string()));

        let changed = self.db.with_conn(|conn| {
            let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
            Ok(conn.execute(&sql, refs.as_slice())?)
        })?;

        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    /// Mark a session deleted. Returns false when there was no live row.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn soft_delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET deleted_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND deleted_at IS NULL",
                rusqlite::params![now, id.as_str()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Remove the session row and everything recorded under it, deleted or not.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn purge(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            for table in ["messages", "chats", "chat_groups"] {
                tx.execute(
                    &format!("DELETE FROM {table} WHERE session_id = ?1"),
                    [id.as_str()],
                )?;
            }
            let changed = tx.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            tx.commit()?;
            Ok(changed > 0)
        })
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRecord, StoreError> {
    const T: &str = "sessions";
    let status: String = get(row, 3, T, "status")?;
    let created_at: String = get(row, 9, T, "created_at")?;
    let updated_at: String = get(row, 10, T, "updated_at")?;

    Ok(SessionRecord {
        id: SessionId::from_raw(get::<String>(row, 0, T, "id")?),
        workflow_id: get::<Option<String>>(row, 1, T, "workflow_id")?.map(WorkflowId::from_raw),
        user_id: get::<Option<String>>(row, 2, T, "user_id")?.map(UserId::from_raw),
        status: parse_enum(&status, T, "status")?,
        qr_code: get(row, 4, T, "qr_code")?,
        pairing_code: get(row, 5, T, "pairing_code")?,
        phone_number: get(row, 6, T, "phone_number")?,
        name: get(row, 7, T, "name")?,
        last_seen: parse_time_opt(get(row, 8, T, "last_seen")?, T, "last_seen")?,
        created_at: parse_time(&created_at, T, "created_at")?,
        updated_at: parse_time(&updated_at, T, "updated_at")?,
    })
}
