//! In-memory map of live sessions.
//!
//! The registry is the only state shared across sessions. Each entry is a
//! [`SessionHandle`] whose mutable part sits behind its own lock, so event
//! handling for one session never contends with another session's.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use switchboard_core::records::SessionSnapshot;
use switchboard_core::socket::ProtocolSocket;
use switchboard_core::{InvalidTransition, SessionId, SessionStatus, UserId, WorkflowId};

use crate::error::SessionError;

/// Local mirror of the socket's connection state. Close decisions read
/// this instead of the protocol library's internals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketLink {
    /// Socket object exists, handshake not finished.
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SocketLink {
    pub fn is_closable(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

pub struct LiveState {
    pub status: SessionStatus,
    pub workflow_id: Option<WorkflowId>,
    pub qr_code: Option<String>,
    pub pairing_code: Option<String>,
    pub phone_number: Option<String>,
    pub name: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub use_pairing_code: bool,
    pub socket: Option<Arc<dyn ProtocolSocket>>,
    pub link: SocketLink,
    /// Bumped each time a new socket is attached. Connection updates from an
    /// older socket are ignored.
    pub generation: u64,
    /// Pending reconnect timer, at most one.
    pub reconnect: Option<CancellationToken>,
}

pub struct SessionHandle {
    id: SessionId,
    user_id: Option<UserId>,
    /// Cancelled when the session is deleted or the manager shuts down.
    /// Event pumps and reconnect timers hang off this token.
    cancel: CancellationToken,
    state: Mutex<LiveState>,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        workflow_id: Option<WorkflowId>,
        user_id: Option<UserId>,
        use_pairing_code: bool,
    ) -> Self {
        Self {
            id,
            user_id,
            cancel: CancellationToken::new(),
            state: Mutex::new(LiveState {
                status: SessionStatus::Init,
                workflow_id,
                qr_code: None,
                pairing_code: None,
                phone_number: None,
                name: None,
                last_seen: None,
                use_pairing_code,
                socket: None,
                link: SocketLink::Closed,
                generation: 0,
                reconnect: None,
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn link(&self) -> SocketLink {
        self.state.lock().link
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn socket(&self) -> Option<Arc<dyn ProtocolSocket>> {
        self.state.lock().socket.clone()
    }

    pub fn workflow_id(&self) -> Option<WorkflowId> {
        self.state.lock().workflow_id.clone()
    }

    pub fn use_pairing_code(&self) -> bool {
        self.state.lock().use_pairing_code
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.state.lock().reconnect.is_some()
    }

    /// Run `f` with exclusive access to the live state.
    pub fn with_state<T>(&self, f: impl FnOnce(&mut LiveState) -> T) -> T {
        f(&mut self.state.lock())
    }

    /// Move to `to` if the edge is valid. `Ok(false)` means the status was
    /// already `to`.
    pub fn transition(&self, to: SessionStatus) -> Result<bool, InvalidTransition> {
        let mut state = self.state.lock();
        let changed = state.status.transition(to)?;
        state.status = to;
        Ok(changed)
    }

    /// Install a freshly opened socket. Returns its generation.
    pub fn attach(&self, socket: Arc<dyn ProtocolSocket>) -> u64 {
        let mut state = self.state.lock();
        state.socket = Some(socket);
        state.link = SocketLink::Connecting;
        state.generation += 1;
        state.generation
    }

    /// Claim the socket for closing if it is open and not already closing.
    /// The link is marked `Closing` so a concurrent caller gets `None`.
    pub fn begin_close(&self) -> Option<Arc<dyn ProtocolSocket>> {
        let mut state = self.state.lock();
        if !state.link.is_closable() {
            return None;
        }
        state.link = SocketLink::Closing;
        state.socket.clone()
    }

    pub fn mark_link(&self, link: SocketLink) {
        self.state.lock().link = link;
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the session token, stopping the event pump and any pending reconnect.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.state.lock().reconnect = None;
    }

    /// Cancel only the pending reconnect timer, if any.
    pub fn cancel_reconnect(&self) -> bool {
        match self.state.lock().reconnect.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            session_id: self.id.clone(),
            status: state.status,
            qr_code: state.qr_code.clone(),
            pairing_code: state.pairing_code.clone(),
            phone_number: state.phone_number.clone(),
            name: state.name.clone(),
            last_seen: state.last_seen,
            workflow_id: state.workflow_id.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("status", &state.status)
            .field("link", &state.link)
            .field("generation", &state.generation)
            .finish()
    }
}

/// Authoritative id -> handle map. Reads run concurrently; register and
/// remove take the write lock.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: Arc<SessionHandle>) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(handle.id()) {
            return Err(SessionError::DuplicateSession(handle.id().clone()));
        }
        let _ = sessions.insert(handle.id().clone(), handle);
        Ok(())
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// All live handles, ordered by id.
    pub fn list(&self) -> Vec<Arc<SessionHandle>> {
        let mut handles: Vec<_> = self.sessions.read().values().cloned().collect();
        handles.sort_by(|a, b| a.id().cmp(b.id()));
        handles
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.write().remove(id)
    }

    /// Remove `handle` only if it is still the registered entry for its id.
    pub fn remove_if_current(&self, handle: &Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(handle.id()) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                let _ = sessions.remove(handle.id());
                true
            }
            _ => false,
        }
    }

    pub fn is_current(&self, handle: &Arc<SessionHandle>) -> bool {
        self.sessions
            .read()
            .get(handle.id())
            .is_some_and(|current| Arc::ptr_eq(current, handle))
    }

    pub fn drain(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.write().drain().map(|(_, h)| h).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSocket;

    fn handle(id: &str) -> Arc<SessionHandle> {
        Arc::new(SessionHandle::new(SessionId::from_raw(id), None, None, false))
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = SessionRegistry::new();
        registry.register(handle("s1")).unwrap();
        let err = registry.register(handle("s1")).unwrap_err();
        assert!(matches!(err, SessionError::DuplicateSession(id) if id.as_str() == "s1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_list_remove() {
        let registry = SessionRegistry::new();
        registry.register(handle("b")).unwrap();
        registry.register(handle("a")).unwrap();

        let ids: Vec<_> = registry.list().iter().map(|h| h.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(registry.get(&SessionId::from_raw("a")).is_some());

        assert!(registry.remove(&SessionId::from_raw("a")).is_some());
        assert!(registry.remove(&SessionId::from_raw("a")).is_none());
        assert!(!registry.contains(&SessionId::from_raw("a")));
    }

    #[test]
    fn remove_if_current_ignores_replaced_handles() {
        let registry = SessionRegistry::new();
        let old = handle("s1");
        registry.register(old.clone()).unwrap();
        registry.remove(old.id());
        let new = handle("s1");
        registry.register(new.clone()).unwrap();

        assert!(!registry.is_current(&old));
        assert!(!registry.remove_if_current(&old));
        assert!(registry.remove_if_current(&new));
        assert!(registry.is_empty());
    }

    #[test]
    fn handle_transition_enforces_edges() {
        let h = handle("s1");
        assert_eq!(h.transition(SessionStatus::Connecting), Ok(true));
        assert_eq!(h.transition(SessionStatus::Connected), Ok(true));
        assert!(h.transition(SessionStatus::QrRequired).is_err());
        assert_eq!(h.status(), SessionStatus::Connected);
    }

    #[test]
    fn begin_close_is_claimed_once() {
        let h = handle("s1");
        assert!(h.begin_close().is_none(), "no socket yet");

        let generation = h.attach(Arc::new(MockSocket::new(false)));
        assert_eq!(generation, 1);
        assert!(h.begin_close().is_some());
        assert_eq!(h.link(), SocketLink::Closing);
        assert!(h.begin_close().is_none());

        h.mark_link(SocketLink::Closed);
        assert!(h.begin_close().is_none());
    }

    #[test]
    fn cancel_clears_pending_reconnect() {
        let h = handle("s1");
        let timer = h.cancel_token().child_token();
        h.with_state(|s| s.reconnect = Some(timer.clone()));
        assert!(h.has_pending_reconnect());

        h.cancel();
        assert!(timer.is_cancelled());
        assert!(!h.has_pending_reconnect());
        assert!(h.is_cancelled());
    }

    #[test]
    fn snapshot_reflects_state() {
        let h = Arc::new(SessionHandle::new(
            SessionId::from_raw("s1"),
            Some(WorkflowId::from_raw("w")),
            Some(UserId::from_raw("u1")),
            true,
        ));
        h.with_state(|s| s.qr_code = Some("qr".into()));
        let snap = h.snapshot();
        assert_eq!(snap.status, SessionStatus::Init);
        assert_eq!(snap.qr_code.as_deref(), Some("qr"));
        assert_eq!(snap.user_id.as_ref().map(UserId::as_str), Some("u1"));
        assert!(h.use_pairing_code());
    }
}
