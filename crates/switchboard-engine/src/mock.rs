//! Deterministic test doubles for the engine's collaborators: a scripted
//! protocol socket and connector, an in-memory store with failure
//! injection, a recording webhook, and a fixed geocoder.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use switchboard_core::events::{ConnectionUpdate, ProtocolEvent};
use switchboard_core::records::{
    ChatRecord, GroupRecord, MessageRecord, NewSession, SessionPatch, SessionRecord,
};
use switchboard_core::socket::{
    ConnectRequest, ProtocolSocket, SocketConnection, SocketConnector, SocketError, SocketUser,
};
use switchboard_core::{SessionId, SessionStatus};
use switchboard_store::{SaveOutcome, SessionStore, StoreError};

use crate::fanout::{DeliveryError, WebhookDispatcher};
use crate::geocode::{GeocodeError, Geocoder};

// ─────────────────────────────────────────────────────────────────────────────
// Socket
// ─────────────────────────────────────────────────────────────────────────────

/// Scripted protocol socket that records every call made on it.
pub struct MockSocket {
    registered: AtomicBool,
    user: Mutex<Option<SocketUser>>,
    pairing_code: Mutex<Result<String, String>>,
    sent: Mutex<Vec<(String, Value)>>,
    pairing_requests: Mutex<Vec<String>>,
    end_calls: AtomicUsize,
    fail_end: AtomicBool,
}

impl MockSocket {
    pub fn new(registered: bool) -> Self {
        Self {
            registered: AtomicBool::new(registered),
            user: Mutex::new(None),
            pairing_code: Mutex::new(Ok("ABCD-1234".into())),
            sent: Mutex::new(Vec::new()),
            pairing_requests: Mutex::new(Vec::new()),
            end_calls: AtomicUsize::new(0),
            fail_end: AtomicBool::new(false),
        }
    }

    pub fn set_user(&self, id: &str, name: Option<&str>) {
        *self.user.lock() = Some(SocketUser {
            id: id.into(),
            name: name.map(str::to_string),
        });
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    pub fn set_pairing_code(&self, result: Result<&str, &str>) {
        *self.pairing_code.lock() = result.map(str::to_string).map_err(str::to_string);
    }

    pub fn fail_end(&self) {
        self.fail_end.store(true, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().clone()
    }

    pub fn pairing_requests(&self) -> Vec<String> {
        self.pairing_requests.lock().clone()
    }

    pub fn end_calls(&self) -> usize {
        self.end_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolSocket for MockSocket {
    fn user(&self) -> Option<SocketUser> {
        self.user.lock().clone()
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, SocketError> {
        self.pairing_requests.lock().push(phone_number.to_string());
        self.pairing_code.lock().clone().map_err(SocketError::Pairing)
    }

    async fn send_message(&self, to: &str, content: Value) -> Result<Value, SocketError> {
        let mut sent = self.sent.lock();
        sent.push((to.to_string(), content.clone()));
        Ok(json!({
            "key": {"remoteJid": to, "fromMe": true, "id": format!("SENT{}", sent.len())},
            "message": content,
        }))
    }

    async fn end(&self, _reason: Option<String>) -> Result<(), SocketError> {
        self.end_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_end.load(Ordering::SeqCst) {
            return Err(SocketError::Closed);
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connector
// ─────────────────────────────────────────────────────────────────────────────

/// One socket handed out by [`MockConnector`], with the sender that feeds
/// its event stream. Clones share the sender.
#[derive(Clone)]
pub struct MockLink {
    pub request: ConnectRequest,
    pub socket: Arc<MockSocket>,
    events: Arc<Mutex<Option<mpsc::Sender<ProtocolEvent>>>>,
}

impl MockLink {
    pub async fn emit(&self, event: ProtocolEvent) {
        let Some(tx) = self.events.lock().clone() else {
            return;
        };
        // The pump may already be gone in teardown tests.
        let _ = tx.send(event).await;
    }

    /// End the event stream without a close update, as a socket that dies
    /// silently would.
    pub fn hang_up(&self) {
        self.events.lock().take();
    }

    pub async fn connection(&self, update: ConnectionUpdate) {
        self.emit(ProtocolEvent::ConnectionUpdate(update)).await;
    }
}

pub struct MockConnector {
    registered: AtomicBool,
    failures_left: AtomicUsize,
    links: Mutex<Vec<MockLink>>,
    attempts: watch::Sender<usize>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        let (attempts, _) = watch::channel(0);
        Self {
            registered: AtomicBool::new(false),
            failures_left: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
            attempts,
        }
    }

    /// Sockets handed out from now on report already-linked credentials.
    pub fn with_registered(self, registered: bool) -> Self {
        self.registered.store(registered, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` connect calls.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Connect calls so far, failed ones included.
    pub fn attempts(&self) -> usize {
        *self.attempts.borrow()
    }

    pub fn links(&self) -> Vec<MockLink> {
        self.links.lock().clone()
    }

    pub fn last_link(&self) -> Option<MockLink> {
        self.links.lock().last().cloned()
    }

    pub fn links_for(&self, id: &SessionId) -> Vec<MockLink> {
        self.links
            .lock()
            .iter()
            .filter(|l| &l.request.session_id == id)
            .cloned()
            .collect()
    }

    /// Wait until at least `n` connect calls have been made, or `timeout`.
    pub async fn wait_for_attempts(&self, n: usize, timeout: Duration) -> bool {
        let mut rx = self.attempts.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|count| *count >= n))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

#[async_trait]
impl SocketConnector for MockConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<SocketConnection, SocketError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.attempts.send_modify(|n| *n += 1);
            return Err(SocketError::Connect("scripted failure".into()));
        }

        let socket = Arc::new(MockSocket::new(self.registered.load(Ordering::SeqCst)));
        let (tx, rx) = mpsc::channel(64);
        self.links.lock().push(MockLink {
            request,
            socket: socket.clone(),
            events: Arc::new(Mutex::new(Some(tx))),
        });
        self.attempts.send_modify(|n| *n += 1);
        Ok(SocketConnection {
            socket,
            events: rx,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<SessionId, (SessionRecord, bool)>,
    messages: Vec<MessageRecord>,
    chats: HashMap<(SessionId, String), ChatRecord>,
    groups: HashMap<(SessionId, String), GroupRecord>,
}

/// In-memory [`SessionStore`] with the same conflict and duplicate rules as
/// the SQLite store, plus switches for failure injection.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_messages: Mutex<HashSet<String>>,
    fail_session_updates: AtomicBool,
    fail_directory: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `save_message` fail for this message id.
    pub fn fail_message(&self, message_id: &str) {
        self.fail_messages.lock().insert(message_id.to_string());
    }

    pub fn fail_session_updates(&self, fail: bool) {
        self.fail_session_updates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_directory(&self, fail: bool) {
        self.fail_directory.store(fail, Ordering::SeqCst);
    }

    /// Seed a record directly, bypassing the create rules.
    pub fn seed(&self, id: &str, status: SessionStatus) {
        let now = Utc::now();
        let record = SessionRecord {
            id: SessionId::from_raw(id),
            workflow_id: None,
            user_id: None,
            status,
            qr_code: None,
            pairing_code: None,
            phone_number: None,
            name: None,
            last_seen: None,
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .sessions
            .insert(record.id.clone(), (record, false));
    }

    pub fn session(&self, id: &str) -> Option<SessionRecord> {
        self.state
            .lock()
            .sessions
            .get(&SessionId::from_raw(id))
            .filter(|(_, deleted)| !deleted)
            .map(|(r, _)| r.clone())
    }

    pub fn is_soft_deleted(&self, id: &str) -> bool {
        self.state
            .lock()
            .sessions
            .get(&SessionId::from_raw(id))
            .is_some_and(|(_, deleted)| *deleted)
    }

    pub fn messages(&self) -> Vec<MessageRecord> {
        self.state.lock().messages.clone()
    }

    pub fn chats(&self) -> Vec<ChatRecord> {
        self.state.lock().chats.values().cloned().collect()
    }

    pub fn groups(&self) -> Vec<GroupRecord> {
        self.state.lock().groups.values().cloned().collect()
    }

    fn directory_check(&self) -> Result<(), StoreError> {
        if self.fail_directory.load(Ordering::SeqCst) {
            return Err(StoreError::Database("injected directory failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, new: NewSession) -> Result<SessionRecord, StoreError> {
        let mut state = self.state.lock();
        if let Some((_, false)) = state.sessions.get(&new.id) {
            return Err(StoreError::Conflict(format!("session {} exists", new.id)));
        }
        let now = Utc::now();
        let record = SessionRecord {
            id: new.id.clone(),
            workflow_id: new.workflow_id,
            user_id: new.user_id,
            status: SessionStatus::Init,
            qr_code: None,
            pairing_code: None,
            phone_number: None,
            name: None,
            last_seen: None,
            created_at: now,
            updated_at: now,
        };
        state.sessions.insert(new.id, (record.clone(), false));
        Ok(record)
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.session(id.as_str()))
    }

    async fn update_session(&self, id: &SessionId, patch: SessionPatch) -> Result<(), StoreError> {
        if self.fail_session_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Database("injected update failure".into()));
        }
        let mut state = self.state.lock();
        let Some((record, false)) = state.sessions.get_mut(id) else {
            return Err(StoreError::NotFound(format!("session {id}")));
        };
        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(v) = patch.qr_code {
            record.qr_code = v;
        }
        if let Some(v) = patch.pairing_code {
            record.pairing_code = v;
        }
        if let Some(v) = patch.phone_number {
            record.phone_number = v;
        }
        if let Some(v) = patch.name {
            record.name = v;
        }
        if let Some(v) = patch.last_seen {
            record.last_seen = Some(v);
        }
        if let Some(v) = patch.workflow_id {
            record.workflow_id = v;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        match state.sessions.get_mut(id) {
            Some((_, deleted)) if !*deleted => {
                *deleted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn permanently_delete_session(&self, id: &SessionId) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        state.messages.retain(|m| &m.session_id != id);
        state.chats.retain(|(sid, _), _| sid != id);
        state.groups.retain(|(sid, _), _| sid != id);
        Ok(state.sessions.remove(id).is_some())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut records: Vec<_> = self
            .state
            .lock()
            .sessions
            .values()
            .filter(|(_, deleted)| !deleted)
            .map(|(r, _)| r.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn message_exists(&self, session_id: &SessionId, message_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .lock()
            .messages
            .iter()
            .any(|m| &m.session_id == session_id && m.message_id == message_id))
    }

    async fn save_message(&self, message: MessageRecord) -> Result<SaveOutcome, StoreError> {
        if self.fail_messages.lock().contains(&message.message_id) {
            return Err(StoreError::Database(format!(
                "injected failure for {}",
                message.message_id
            )));
        }
        let mut state = self.state.lock();
        let exists = state
            .messages
            .iter()
            .any(|m| m.session_id == message.session_id && m.message_id == message.message_id);
        if exists {
            return Ok(SaveOutcome::Duplicate);
        }
        state.messages.push(message);
        Ok(SaveOutcome::Inserted)
    }

    async fn update_message_status(
        &self,
        session_id: &SessionId,
        message_id: &str,
        status: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        match state
            .messages
            .iter_mut()
            .find(|m| &m.session_id == session_id && m.message_id == message_id)
        {
            Some(m) => {
                m.status = Some(status.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_messages(&self, session_id: &SessionId, limit: u32) -> Result<Vec<MessageRecord>, StoreError> {
        let mut messages: Vec<_> = self
            .state
            .lock()
            .messages
            .iter()
            .filter(|m| &m.session_id == session_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        messages.truncate(limit as usize);
        Ok(messages)
    }

    async fn upsert_chat(&self, chat: ChatRecord) -> Result<(), StoreError> {
        self.directory_check()?;
        self.state
            .lock()
            .chats
            .insert((chat.session_id.clone(), chat.jid.clone()), chat);
        Ok(())
    }

    async fn list_chats(&self, session_id: &SessionId) -> Result<Vec<ChatRecord>, StoreError> {
        Ok(self
            .chats()
            .into_iter()
            .filter(|c| &c.session_id == session_id)
            .collect())
    }

    async fn upsert_group(&self, group: GroupRecord) -> Result<(), StoreError> {
        self.directory_check()?;
        self.state
            .lock()
            .groups
            .insert((group.session_id.clone(), group.jid.clone()), group);
        Ok(())
    }

    async fn list_groups(&self, session_id: &SessionId) -> Result<Vec<GroupRecord>, StoreError> {
        Ok(self
            .groups()
            .into_iter()
            .filter(|g| &g.session_id == session_id)
            .collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Webhook and geocoder
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedDelivery {
    pub session_id: SessionId,
    pub event: String,
    pub payload: Value,
}

pub struct RecordingWebhook {
    deliveries: Mutex<Vec<RecordedDelivery>>,
    count: watch::Sender<usize>,
}

impl Default for RecordingWebhook {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingWebhook {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            deliveries: Mutex::new(Vec::new()),
            count,
        }
    }

    pub fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.deliveries.lock().clone()
    }

    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let mut rx = self.count.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|c| *c >= n))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

#[async_trait]
impl WebhookDispatcher for RecordingWebhook {
    async fn dispatch(
        &self,
        session_id: &SessionId,
        event: &str,
        payload: Value,
    ) -> Result<(), DeliveryError> {
        self.deliveries.lock().push(RecordedDelivery {
            session_id: session_id.clone(),
            event: event.to_string(),
            payload,
        });
        self.count.send_modify(|c| *c += 1);
        Ok(())
    }
}

/// Returns a fixed address, or fails every lookup.
pub struct StaticGeocoder {
    address: Option<Value>,
    fail: bool,
    calls: AtomicUsize,
}

impl StaticGeocoder {
    pub fn new(address: Value) -> Self {
        Self {
            address: Some(address),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            address: None,
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Geocoder for StaticGeocoder {
    async fn reverse(&self, _latitude: f64, _longitude: f64) -> Result<Option<Value>, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(GeocodeError::Status(503));
        }
        Ok(self.address.clone())
    }
}
