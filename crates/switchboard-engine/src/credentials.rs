//! Per-session credential directories.
//!
//! Each session owns `<root>/<session_id>/`. The protocol library reads and
//! writes its auth state there; the engine writes `creds.json` whenever the
//! socket reports updated credentials.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use switchboard_core::SessionId;

use crate::error::SessionError;

const CREDS_FILE: &str = "creds.json";

#[derive(Clone, Debug)]
pub struct CredentialVault {
    root: PathBuf,
}

impl CredentialVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for `id`. Rejects ids that would escape the root.
    pub fn session_dir(&self, id: &SessionId) -> Result<PathBuf, SessionError> {
        let raw = id.as_str();
        if raw.is_empty()
            || raw == "."
            || raw.contains("..")
            || raw.contains('/')
            || raw.contains('\\')
        {
            return Err(SessionError::Credentials(format!(
                "session id {raw:?} is not a valid directory name"
            )));
        }
        Ok(self.root.join(raw))
    }

    pub async fn ensure_session_dir(&self, id: &SessionId) -> Result<PathBuf, SessionError> {
        let dir = self.session_dir(id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SessionError::Credentials(format!("{}: {e}", dir.display())))?;
        Ok(dir)
    }

    /// Atomically replace `creds.json` for `id`.
    pub async fn save_credentials(&self, id: &SessionId, creds: &Value) -> Result<(), SessionError> {
        let dir = self.ensure_session_dir(id).await?;
        let bytes = serde_json::to_vec_pretty(creds)
            .map_err(|e| SessionError::Credentials(e.to_string()))?;
        let tmp = dir.join(format!("{CREDS_FILE}.tmp"));
        let target = dir.join(CREDS_FILE);
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| SessionError::Credentials(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| SessionError::Credentials(format!("{}: {e}", target.display())))?;
        debug!(session_id = %id, "credentials saved");
        Ok(())
    }

    pub async fn load_credentials(&self, id: &SessionId) -> Result<Option<Value>, SessionError> {
        let path = self.session_dir(id)?.join(CREDS_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| SessionError::Credentials(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SessionError::Credentials(format!("{}: {e}", path.display()))),
        }
    }

    /// Remove the session's directory. Returns false if there was none.
    pub async fn erase(&self, id: &SessionId) -> Result<bool, SessionError> {
        let dir = self.session_dir(id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SessionError::Credentials(format!("{}: {e}", dir.display()))),
        }
    }
}
