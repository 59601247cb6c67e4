//! Session lifecycle controller.
//!
//! [`SessionManager`] owns the registry, opens sockets through the
//! [`SocketConnector`], and runs one event pump task per attached socket.
//! Connection updates drive the status machine here; every other protocol
//! event goes to the [`EventReconciler`]. Mutating socket calls (pairing
//! code, send) go through the per-session [`TaskSerializer`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use switchboard_core::events::{
    ConnectionState, ConnectionUpdate, DisconnectReason, DomainEvent, ProtocolEvent,
};
use switchboard_core::records::{NewSession, SessionPatch, SessionSnapshot};
use switchboard_core::socket::{ConnectRequest, SocketConnector};
use switchboard_core::{SessionId, SessionStatus, UserId, WorkflowId};
use switchboard_settings::SwitchboardSettings;
use switchboard_store::{Database, SessionStore, SqliteStore, StoreError};

use crate::config::EngineConfig;
use crate::credentials::CredentialVault;
use crate::error::SessionError;
use crate::fanout::{Broadcaster, HttpWebhookDispatcher, NoopWebhook, WebhookDispatcher};
use crate::geocode::{Geocoder, NominatimGeocoder};
use crate::qr::{QrRenderer, RawQr};
use crate::reconciler::EventReconciler;
use crate::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::registry::{SessionHandle, SessionRegistry, SocketLink};
use crate::serializer::TaskSerializer;

pub struct SessionManagerBuilder {
    store: Arc<dyn SessionStore>,
    connector: Arc<dyn SocketConnector>,
    config: EngineConfig,
    webhook: Option<Arc<dyn WebhookDispatcher>>,
    geocoder: Option<Arc<dyn Geocoder>>,
    qr: Option<Arc<dyn QrRenderer>>,
}

impl SessionManagerBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn webhook(mut self, webhook: Arc<dyn WebhookDispatcher>) -> Self {
        self.webhook = Some(webhook);
        self
    }

    pub fn geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn qr_renderer(mut self, qr: Arc<dyn QrRenderer>) -> Self {
        self.qr = Some(qr);
        self
    }

    pub fn build(self) -> SessionManager {
        let broadcaster = Broadcaster::new(self.config.broadcast_capacity);
        let vault = CredentialVault::new(self.config.credentials_dir.clone());
        let webhook = self.webhook.unwrap_or_else(|| Arc::new(NoopWebhook));
        let reconciler = EventReconciler::new(
            self.store.clone(),
            broadcaster.clone(),
            webhook,
            self.geocoder,
            vault.clone(),
        );
        SessionManager {
            inner: Arc::new(Inner {
                registry: SessionRegistry::new(),
                serializer: TaskSerializer::new(self.config.operation_spacing),
                policy: ReconnectPolicy::new(self.config.reconnect_delay),
                store: self.store,
                connector: self.connector,
                broadcaster,
                reconciler,
                vault,
                qr: self.qr.unwrap_or_else(|| Arc::new(RawQr)),
                config: self.config,
            }),
        }
    }
}

/// Entry point for every session operation. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    registry: SessionRegistry,
    serializer: TaskSerializer,
    policy: ReconnectPolicy,
    store: Arc<dyn SessionStore>,
    connector: Arc<dyn SocketConnector>,
    broadcaster: Broadcaster,
    reconciler: EventReconciler,
    vault: CredentialVault,
    qr: Arc<dyn QrRenderer>,
}

impl SessionManager {
    pub fn builder(
        store: Arc<dyn SessionStore>,
        connector: Arc<dyn SocketConnector>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            store,
            connector,
            config: EngineConfig::default(),
            webhook: None,
            geocoder: None,
            qr: None,
        }
    }

    /// Wire a manager from loaded settings: SQLite store at `store.dbPath`,
    /// Nominatim geocoder when enabled, HTTP webhook when a URL is set.
    pub fn from_settings(
        settings: &SwitchboardSettings,
        connector: Arc<dyn SocketConnector>,
    ) -> Result<Self, SessionError> {
        let db = Database::open(std::path::Path::new(&settings.store.db_path))?;
        let mut builder = Self::builder(Arc::new(SqliteStore::new(db)), connector)
            .config(EngineConfig::from_settings(settings));

        if let Some(geocoder) = NominatimGeocoder::from_settings(&settings.geocoder)
            .map_err(|e| SessionError::Config(e.to_string()))?
        {
            builder = builder.geocoder(Arc::new(geocoder));
        }
        if let Some(webhook) = HttpWebhookDispatcher::from_settings(&settings.webhook)
            .map_err(|e| SessionError::Config(e.to_string()))?
        {
            builder = builder.webhook(Arc::new(webhook));
        }
        Ok(builder.build())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.inner.store
    }

    /// Live domain events for every session.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.inner.broadcaster.subscribe()
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.inner.registry.get(id).map(|h| h.snapshot())
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        self.inner.registry.list().iter().map(|h| h.snapshot()).collect()
    }

    /// Create a durable record and open its socket. Returns once the socket
    /// is attached; the handshake continues in the background.
    ///
    /// A bring-up failure leaves the record in ERROR and the session
    /// registered so its state stays inspectable.
    #[instrument(skip(self, workflow_id, user_id), fields(session_id = %id))]
    pub async fn create(
        &self,
        id: SessionId,
        workflow_id: Option<WorkflowId>,
        user_id: Option<UserId>,
        use_pairing_code: bool,
    ) -> Result<SessionSnapshot, SessionError> {
        let handle = Arc::new(SessionHandle::new(
            id.clone(),
            workflow_id.clone(),
            user_id.clone(),
            use_pairing_code,
        ));
        // Registering first reserves the id against concurrent creates.
        self.inner.registry.register(handle.clone())?;

        let new = NewSession {
            id: id.clone(),
            workflow_id,
            user_id,
        };
        if let Err(e) = self.inner.store.create_session(new).await {
            let _ = self.inner.registry.remove_if_current(&handle);
            return Err(match e {
                StoreError::Conflict(_) => SessionError::DuplicateSession(id),
                other => other.into(),
            });
        }

        let snapshot = self.inner.start(&handle).await?;
        info!(status = %snapshot.status, "session created");
        Ok(snapshot)
    }

    /// Re-attach a socket for a session that already has a durable record.
    /// Only CONNECTED, CONNECTING and PAIRING_REQUIRED records qualify.
    #[instrument(skip(self, user_id), fields(session_id = %id))]
    pub async fn restore(
        &self,
        id: &SessionId,
        user_id: Option<UserId>,
    ) -> Result<SessionSnapshot, SessionError> {
        if self.inner.registry.contains(id) {
            return Err(SessionError::DuplicateSession(id.clone()));
        }
        let record = self
            .inner
            .store
            .get_session(id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(id.clone()))?;
        if !record.status.is_restorable() {
            return Err(SessionError::NotRestorable {
                id: id.clone(),
                status: record.status,
            });
        }

        let handle = Arc::new(SessionHandle::new(
            id.clone(),
            record.workflow_id.clone(),
            user_id.or(record.user_id.clone()),
            record.status == SessionStatus::PairingRequired,
        ));
        handle.with_state(|s| {
            s.phone_number = record.phone_number.clone();
            s.name = record.name.clone();
            s.last_seen = record.last_seen;
        });
        self.inner.registry.register(handle.clone())?;

        let snapshot = self.inner.start(&handle).await?;
        info!(previous = %record.status, "session restored");
        Ok(snapshot)
    }

    /// Restore every eligible record. Failures are logged and skipped.
    pub async fn restore_all(&self) -> Result<Vec<SessionId>, SessionError> {
        let records = self.inner.store.list_sessions().await?;
        info!(count = records.len(), "restoring sessions");

        let mut restored = Vec::new();
        for record in records {
            if !record.status.is_restorable() {
                debug!(session_id = %record.id, status = %record.status, "not restorable, skipping");
                continue;
            }
            match self.restore(&record.id, record.user_id.clone()).await {
                Ok(_) => restored.push(record.id),
                Err(e) => error!(session_id = %record.id, error = %e, "failed to restore session"),
            }
        }
        Ok(restored)
    }

    /// Re-attach every record marked CONNECTED that has no live handle.
    pub async fn reconnect_all(&self) -> Result<Vec<SessionId>, SessionError> {
        let records = self.inner.store.list_sessions().await?;
        let mut reconnected = Vec::new();
        for record in records {
            if record.status != SessionStatus::Connected || self.inner.registry.contains(&record.id) {
                continue;
            }
            match self.restore(&record.id, record.user_id.clone()).await {
                Ok(_) => reconnected.push(record.id),
                Err(e) => {
                    error!(session_id = %record.id, error = %e, "failed to reconnect session");
                }
            }
        }
        info!(count = reconnected.len(), "reconnected sessions");
        Ok(reconnected)
    }

    /// Request a phone-number pairing code. Requires an attached socket
    /// whose credentials are not yet registered.
    #[instrument(skip(self, phone_number), fields(session_id = %id))]
    pub async fn request_pairing_code(
        &self,
        id: &SessionId,
        phone_number: &str,
    ) -> Result<String, SessionError> {
        let handle = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| SessionError::SessionNotFound(id.clone()))?;

        self.inner
            .serializer
            .run(id, async {
                let socket = handle
                    .socket()
                    .ok_or_else(|| SessionError::not_ready(id, "socket not initialized"))?;
                if !handle.link().is_closable() {
                    return Err(SessionError::not_ready(id, "socket is closed"));
                }
                if socket.is_registered() {
                    return Err(SessionError::not_ready(id, "credentials already registered"));
                }

                let code = socket.request_pairing_code(phone_number).await?;
                handle.with_state(|s| {
                    s.pairing_code = Some(code.clone());
                    s.phone_number = Some(phone_number.to_string());
                });
                self.inner
                    .persist(
                        id,
                        SessionPatch {
                            pairing_code: Some(Some(code.clone())),
                            phone_number: Some(Some(phone_number.to_string())),
                            ..Default::default()
                        },
                    )
                    .await;
                self.inner.publish_snapshot(&handle);
                info!("pairing code issued");
                Ok(code)
            })
            .await
    }

    /// Send a message through a CONNECTED session's socket.
    #[instrument(skip(self, content), fields(session_id = %id))]
    pub async fn send_message(
        &self,
        id: &SessionId,
        to: &str,
        content: Value,
    ) -> Result<Value, SessionError> {
        let handle = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| SessionError::SessionNotFound(id.clone()))?;

        self.inner
            .serializer
            .run(id, async {
                if handle.status() != SessionStatus::Connected {
                    return Err(SessionError::not_ready(id, "session not connected"));
                }
                if !handle.link().is_closable() {
                    return Err(SessionError::not_ready(id, "socket is closed"));
                }
                let socket = handle
                    .socket()
                    .ok_or_else(|| SessionError::not_ready(id, "socket not initialized"))?;
                Ok(socket.send_message(to, content).await?)
            })
            .await
    }

    /// Close the socket, drop the live handle, and soft-delete the record.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn delete(&self, id: &SessionId) -> Result<(), SessionError> {
        let was_live = self.inner.teardown(id, "session deleted").await;
        let was_stored = self.inner.store.delete_session(id).await?;
        if !was_live && !was_stored {
            return Err(SessionError::SessionNotFound(id.clone()));
        }
        info!("session deleted");
        Ok(())
    }

    /// Like [`delete`](Self::delete), but also removes the record with all
    /// its messages and directory entries, and erases the credential
    /// directory. Irreversible.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn permanently_delete(&self, id: &SessionId) -> Result<(), SessionError> {
        let was_live = self.inner.teardown(id, "session permanently deleted").await;
        let purged = self.inner.store.permanently_delete_session(id).await;
        let erased = self.inner.vault.erase(id).await;

        let was_stored = purged?;
        let had_credentials = erased?;
        if !was_live && !was_stored && !had_credentials {
            return Err(SessionError::SessionNotFound(id.clone()));
        }
        info!(had_credentials, "session permanently deleted");
        Ok(())
    }

    /// Permanently delete a session and create it afresh under the same
    /// workflow and user. This is the way back from DISCONNECTED or ERROR.
    /// The new session always pairs by QR.
    #[instrument(skip(self), fields(session_id = %id))]
    pub async fn restart(&self, id: &SessionId) -> Result<SessionSnapshot, SessionError> {
        let record = self
            .inner
            .store
            .get_session(id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(id.clone()))?;

        self.permanently_delete(id).await?;
        let snapshot = self
            .create(id.clone(), record.workflow_id, record.user_id, false)
            .await?;
        info!(previous = %record.status, "session restarted");
        Ok(snapshot)
    }

    /// Reassign the workflow a stored session belongs to.
    #[instrument(skip(self, workflow_id), fields(session_id = %id, workflow_id = %workflow_id))]
    pub async fn set_workflow(
        &self,
        id: &SessionId,
        workflow_id: WorkflowId,
    ) -> Result<(), SessionError> {
        if self.inner.store.get_session(id).await?.is_none() {
            return Err(SessionError::SessionNotFound(id.clone()));
        }
        self.inner
            .store
            .update_session(
                id,
                SessionPatch {
                    workflow_id: Some(Some(workflow_id.clone())),
                    ..Default::default()
                },
            )
            .await?;

        if let Some(handle) = self.inner.registry.get(id) {
            handle.with_state(|s| s.workflow_id = Some(workflow_id));
            self.inner.publish_snapshot(&handle);
        }
        info!("workflow updated");
        Ok(())
    }

    /// Cancel every pending reconnect, close every socket and clear the registry.
    pub async fn shutdown(&self) {
        let handles = self.inner.registry.drain();
        info!(sessions = handles.len(), "shutting down session manager");
        join_all(handles.iter().map(|handle| async move {
            handle.cancel();
            close_socket(handle, "shutdown").await;
        }))
        .await;
        self.inner.serializer.clear();
    }
}

/// End the socket if it is open or connecting and nobody else is closing it.
async fn close_socket(handle: &SessionHandle, reason: &str) {
    let Some(socket) = handle.begin_close() else {
        debug!(session_id = %handle.id(), link = ?handle.link(), "socket not closable, skipping close");
        return;
    };
    if let Err(e) = socket.end(Some(reason.to_string())).await {
        warn!(session_id = %handle.id(), error = %e, "error closing socket");
    }
    handle.mark_link(SocketLink::Closed);
}

impl Inner {
    /// Init -> Connecting, persist, open the socket.
    async fn start(self: &Arc<Self>, handle: &Arc<SessionHandle>) -> Result<SessionSnapshot, SessionError> {
        if let Err(e) = handle.transition(SessionStatus::Connecting) {
            warn!(session_id = %handle.id(), error = %e, "unexpected status at start");
        }
        self.persist(handle.id(), SessionPatch::status(SessionStatus::Connecting))
            .await;
        self.publish_snapshot(handle);

        self.bring_up(handle)
            .await
            .map_err(|e| SessionError::Initialization {
                id: handle.id().clone(),
                reason: e.to_string(),
            })
    }

    /// Open a socket for `handle` and start its event pump. On failure the
    /// session moves to ERROR.
    async fn bring_up(self: &Arc<Self>, handle: &Arc<SessionHandle>) -> Result<SessionSnapshot, SessionError> {
        match self.open_socket(handle).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                self.mark_failed(handle, &e).await;
                Err(e)
            }
        }
    }

    async fn open_socket(self: &Arc<Self>, handle: &Arc<SessionHandle>) -> Result<SessionSnapshot, SessionError> {
        let auth_dir = self.vault.ensure_session_dir(handle.id()).await?;
        let connection = self
            .connector
            .connect(ConnectRequest {
                session_id: handle.id().clone(),
                auth_dir,
                use_pairing_code: handle.use_pairing_code(),
            })
            .await?;

        if handle.is_cancelled() || !self.registry.is_current(handle) {
            debug!(session_id = %handle.id(), "session removed during connect, closing new socket");
            if let Err(e) = connection.socket.end(Some("session removed".into())).await {
                warn!(session_id = %handle.id(), error = %e, "error closing orphaned socket");
            }
            return Ok(handle.snapshot());
        }

        let registered = connection.socket.is_registered();
        let generation = handle.attach(connection.socket);
        debug!(session_id = %handle.id(), generation, registered, "socket attached");

        if handle.use_pairing_code() && !registered {
            match handle.transition(SessionStatus::PairingRequired) {
                Ok(_) => {
                    self.persist(handle.id(), SessionPatch::status(SessionStatus::PairingRequired))
                        .await;
                    self.publish_snapshot(handle);
                }
                Err(e) => warn!(session_id = %handle.id(), error = %e, "cannot enter pairing mode"),
            }
        }

        let snapshot = handle.snapshot();
        self.spawn_pump(handle.clone(), generation, connection.events);
        Ok(snapshot)
    }

    async fn mark_failed(&self, handle: &Arc<SessionHandle>, err: &SessionError) {
        error!(session_id = %handle.id(), error = %err, "socket bring-up failed");
        if let Err(e) = handle.transition(SessionStatus::Error) {
            warn!(session_id = %handle.id(), error = %e, "cannot mark session failed");
            return;
        }
        self.persist(handle.id(), SessionPatch::status(SessionStatus::Error))
            .await;
        self.publish_snapshot(handle);
    }

    fn spawn_pump(
        self: &Arc<Self>,
        handle: Arc<SessionHandle>,
        generation: u64,
        mut events: mpsc::Receiver<ProtocolEvent>,
    ) {
        let inner = self.clone();
        let span = info_span!("session_pump", session_id = %handle.id(), generation);
        let _ = tokio::spawn(
            async move {
                let cancel = handle.cancel_token().clone();
                loop {
                    let event = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        event = events.recv() => event,
                    };
                    let Some(event) = event else {
                        if handle.generation() == generation {
                            warn!("event stream ended without a close update");
                            inner.on_close(&handle, DisconnectReason::Unknown(None)).await;
                        } else {
                            debug!("stale event stream ended");
                        }
                        break;
                    };
                    match event {
                        ProtocolEvent::ConnectionUpdate(update) => {
                            if inner.on_connection_update(&handle, generation, update).await {
                                break;
                            }
                        }
                        other => inner.reconciler.apply(handle.id(), other).await,
                    }
                }
                debug!("event pump stopped");
            }
            .instrument(span),
        );
    }

    /// Apply one connection update. Returns true once this socket has closed.
    async fn on_connection_update(
        self: &Arc<Self>,
        handle: &Arc<SessionHandle>,
        generation: u64,
        update: ConnectionUpdate,
    ) -> bool {
        if handle.generation() != generation {
            debug!(current = handle.generation(), "stale connection update, ignoring");
            return true;
        }
        if let Some(qr) = update.qr.as_deref() {
            self.on_qr(handle, qr).await;
        }
        match update.connection {
            Some(ConnectionState::Open) => {
                self.on_open(handle).await;
                false
            }
            Some(ConnectionState::Close) => {
                let reason = update
                    .last_disconnect
                    .map(|d| d.reason())
                    .unwrap_or(DisconnectReason::Unknown(None));
                self.on_close(handle, reason).await;
                true
            }
            Some(ConnectionState::Connecting) => {
                handle.with_state(|s| {
                    if s.link == SocketLink::Closed {
                        s.link = SocketLink::Connecting;
                    }
                });
                false
            }
            None => false,
        }
    }

    /// A new QR supersedes the previous one.
    async fn on_qr(&self, handle: &Arc<SessionHandle>, payload: &str) {
        let rendered = match self.qr.render(payload) {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "failed to render qr code");
                return;
            }
        };
        let accepted = handle.with_state(|s| match s.status.transition(SessionStatus::QrRequired) {
            Ok(_) => {
                s.status = SessionStatus::QrRequired;
                s.qr_code = Some(rendered.clone());
                true
            }
            Err(_) => false,
        });
        if !accepted {
            debug!(status = %handle.status(), "qr ignored in current status");
            return;
        }
        self.persist(
            handle.id(),
            SessionPatch {
                status: Some(SessionStatus::QrRequired),
                qr_code: Some(Some(rendered)),
                ..Default::default()
            },
        )
        .await;
        self.publish_snapshot(handle);
        info!("qr code updated");
    }

    async fn on_open(&self, handle: &Arc<SessionHandle>) {
        let user = handle.socket().and_then(|s| s.user());
        let now = Utc::now();
        let opened = handle.with_state(|s| {
            if matches!(s.status, SessionStatus::QrRequired | SessionStatus::PairingRequired) {
                s.status = SessionStatus::Connecting;
            }
            s.status.transition(SessionStatus::Connected)?;
            s.status = SessionStatus::Connected;
            s.link = SocketLink::Open;
            s.qr_code = None;
            s.pairing_code = None;
            if let Some(user) = &user {
                s.phone_number = Some(user.phone_number());
                if user.name.is_some() {
                    s.name = user.name.clone();
                }
            }
            s.last_seen = Some(now);
            Ok::<_, switchboard_core::InvalidTransition>((s.phone_number.clone(), s.name.clone()))
        });
        let (phone_number, name) = match opened {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "ignoring open in current status");
                return;
            }
        };

        self.persist(
            handle.id(),
            SessionPatch {
                status: Some(SessionStatus::Connected),
                qr_code: Some(None),
                pairing_code: Some(None),
                phone_number: Some(phone_number),
                name: Some(name),
                last_seen: Some(now),
                ..Default::default()
            },
        )
        .await;
        self.publish_snapshot(handle);
        info!("session connected");
    }

    async fn on_close(self: &Arc<Self>, handle: &Arc<SessionHandle>, reason: DisconnectReason) {
        handle.mark_link(SocketLink::Closed);
        match self.policy.on_close(reason) {
            ReconnectDecision::Terminal => {
                let _ = handle.cancel_reconnect();
                // Only an open session can log out. Before that the
                // credentials were rejected during bring-up.
                let settled = handle.with_state(|s| {
                    let target = if s.status == SessionStatus::Connected {
                        SessionStatus::Disconnected
                    } else {
                        SessionStatus::Error
                    };
                    s.status.transition(target)?;
                    s.status = target;
                    s.qr_code = None;
                    Ok::<_, switchboard_core::InvalidTransition>(target)
                });
                let status = match settled {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(error = %e, "ignoring logout in current status");
                        return;
                    }
                };
                self.persist(
                    handle.id(),
                    SessionPatch {
                        status: Some(status),
                        qr_code: Some(None),
                        ..Default::default()
                    },
                )
                .await;
                self.publish_snapshot(handle);
                if status == SessionStatus::Disconnected {
                    info!("session logged out");
                } else {
                    error!("credentials rejected before the connection opened");
                }
            }
            ReconnectDecision::Retry { after } => {
                if let Err(e) = handle.transition(SessionStatus::Connecting) {
                    warn!(error = %e, ?reason, "not reconnecting from current status");
                    return;
                }
                handle.with_state(|s| s.qr_code = None);
                self.persist(
                    handle.id(),
                    SessionPatch {
                        status: Some(SessionStatus::Connecting),
                        qr_code: Some(None),
                        ..Default::default()
                    },
                )
                .await;
                self.publish_snapshot(handle);
                let delay_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
                info!(?reason, delay_ms, "connection closed, reconnecting");
                self.schedule_reconnect(handle, after);
            }
        }
    }

    /// Arm the single reconnect timer for `handle`. A no-op when one is
    /// already pending.
    fn schedule_reconnect(self: &Arc<Self>, handle: &Arc<SessionHandle>, after: Duration) {
        let token = handle.with_state(|s| {
            if s.reconnect.is_some() {
                return None;
            }
            let token = handle.cancel_token().child_token();
            s.reconnect = Some(token.clone());
            Some(token)
        });
        let Some(token) = token else {
            debug!("reconnect already pending");
            return;
        };

        let inner = self.clone();
        let handle = handle.clone();
        let span = info_span!("reconnect", session_id = %handle.id());
        let _ = tokio::spawn(
            async move {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        debug!("reconnect cancelled");
                        return;
                    }
                    () = tokio::time::sleep(after) => {}
                }
                handle.with_state(|s| s.reconnect = None);
                if handle.is_cancelled() || !inner.registry.is_current(&handle) {
                    return;
                }
                if let Err(e) = inner.bring_up(&handle).await {
                    warn!(error = %e, "reconnect attempt failed");
                }
            }
            .instrument(span),
        );
    }

    /// Remove the live handle and close its socket. Returns whether a live
    /// handle existed.
    async fn teardown(&self, id: &SessionId, reason: &str) -> bool {
        let handle = self.registry.remove(id);
        self.serializer.forget(id);
        let Some(handle) = handle else {
            return false;
        };
        handle.cancel();
        close_socket(&handle, reason).await;
        true
    }

    /// Write a status patch. Failures are logged; live state stays authoritative.
    async fn persist(&self, id: &SessionId, patch: SessionPatch) {
        if patch.is_empty() {
            return;
        }
        if let Err(e) = self.store.update_session(id, patch).await {
            error!(session_id = %id, error = %e, "failed to persist session state");
        }
    }

    fn publish_snapshot(&self, handle: &SessionHandle) {
        let _ = self.broadcaster.publish(DomainEvent::SessionUpdate {
            session_id: handle.id().clone(),
            session: handle.snapshot(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemoryStore, MockConnector, MockLink, RecordingWebhook};
    use serde_json::json;
    use switchboard_core::events::{InboundMessage, MessageKey};

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        manager: SessionManager,
        store: Arc<MemoryStore>,
        connector: Arc<MockConnector>,
        webhook: Arc<RecordingWebhook>,
        events: broadcast::Receiver<DomainEvent>,
        creds: tempfile::TempDir,
    }

    fn harness_with(connector: MockConnector, spacing: Duration) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let connector = Arc::new(connector);
        let webhook = Arc::new(RecordingWebhook::new());
        let creds = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            credentials_dir: creds.path().to_path_buf(),
            reconnect_delay: Duration::from_millis(50),
            operation_spacing: spacing,
            broadcast_capacity: 256,
        };
        let manager = SessionManager::builder(store.clone(), connector.clone())
            .config(config)
            .webhook(webhook.clone())
            .build();
        let events = manager.subscribe();
        Harness {
            manager,
            store,
            connector,
            webhook,
            events,
            creds,
        }
    }

    fn harness() -> Harness {
        harness_with(MockConnector::new(), Duration::ZERO)
    }

    fn sid(s: &str) -> SessionId {
        SessionId::from_raw(s)
    }

    /// Let spawned tasks run up to their next pending await.
    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    impl Harness {
        async fn create(&self, id: &str) -> SessionSnapshot {
            self.manager
                .create(sid(id), None, Some(UserId::from_raw("u1")), false)
                .await
                .unwrap()
        }

        fn link(&self, id: &str) -> MockLink {
            self.connector.links_for(&sid(id)).pop().unwrap()
        }

        /// Wait for a sessionUpdate for `id` carrying `status`.
        async fn wait_status(&mut self, id: &str, status: SessionStatus) -> SessionSnapshot {
            let fut = async {
                loop {
                    match self.events.recv().await {
                        Ok(DomainEvent::SessionUpdate { session, .. })
                            if session.session_id.as_str() == id && session.status == status =>
                        {
                            return session;
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(e) => panic!("event channel closed: {e}"),
                    }
                }
            };
            tokio::time::timeout(WAIT, fut)
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {id} -> {status}"))
        }

        async fn wait_event(&mut self, name: &str) -> DomainEvent {
            let fut = async {
                loop {
                    if let Ok(ev) = self.events.recv().await {
                        if ev.event_name() == name {
                            return ev;
                        }
                    }
                }
            };
            tokio::time::timeout(WAIT, fut)
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
        }

        async fn open(&mut self, id: &str) {
            let link = self.link(id);
            link.socket.set_user("15551234567:3@s.whatsapp.net", Some("Ada"));
            link.connection(ConnectionUpdate::open()).await;
            self.wait_status(id, SessionStatus::Connected).await;
        }
    }

    #[tokio::test]
    async fn create_persists_and_returns_connecting() {
        let h = harness();
        let snap = h.create("s1").await;

        assert_eq!(snap.status, SessionStatus::Connecting);
        assert_eq!(h.store.session("s1").unwrap().status, SessionStatus::Connecting);
        assert_eq!(h.manager.get(&sid("s1")).unwrap().status, SessionStatus::Connecting);
        assert!(h.creds.path().join("s1").is_dir());
        assert_eq!(h.link("s1").request.auth_dir, h.creds.path().join("s1"));
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let h = harness();
        h.create("s1").await;
        let err = h.manager.create(sid("s1"), None, None, false).await.unwrap_err();
        assert!(matches!(err, SessionError::DuplicateSession(_)));
        assert_eq!(h.connector.attempts(), 1);
    }

    #[tokio::test]
    async fn create_conflicting_with_stored_record_is_duplicate() {
        let h = harness();
        h.store.seed("s1", SessionStatus::Disconnected);
        let err = h.manager.create(sid("s1"), None, None, false).await.unwrap_err();
        assert!(matches!(err, SessionError::DuplicateSession(_)));
        assert!(h.manager.get(&sid("s1")).is_none());
    }

    #[tokio::test]
    async fn bring_up_failure_marks_error_and_keeps_record() {
        let h = harness();
        h.connector.fail_next(1);
        let err = h.manager.create(sid("s1"), None, None, false).await.unwrap_err();

        assert!(matches!(err, SessionError::Initialization { .. }));
        assert_eq!(h.store.session("s1").unwrap().status, SessionStatus::Error);
        assert_eq!(h.manager.get(&sid("s1")).unwrap().status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn invalid_session_id_fails_initialization() {
        let h = harness();
        let err = h.manager.create(sid("../escape"), None, None, false).await.unwrap_err();
        assert!(matches!(err, SessionError::Initialization { .. }));
        assert_eq!(h.connector.attempts(), 0);
    }

    #[tokio::test]
    async fn qr_then_open_connects() {
        let mut h = harness();
        h.create("s1").await;
        let link = h.link("s1");

        link.connection(ConnectionUpdate::qr("qr-1")).await;
        let snap = h.wait_status("s1", SessionStatus::QrRequired).await;
        assert_eq!(snap.qr_code.as_deref(), Some("qr-1"));

        link.connection(ConnectionUpdate::qr("qr-2")).await;
        let snap = h.wait_status("s1", SessionStatus::QrRequired).await;
        assert_eq!(snap.qr_code.as_deref(), Some("qr-2"));
        assert_eq!(h.store.session("s1").unwrap().qr_code.as_deref(), Some("qr-2"));

        h.open("s1").await;
        let record = h.store.session("s1").unwrap();
        assert_eq!(record.status, SessionStatus::Connected);
        assert_eq!(record.qr_code, None);
        assert_eq!(record.phone_number.as_deref(), Some("15551234567"));
        assert_eq!(record.name.as_deref(), Some("Ada"));
        assert!(record.last_seen.is_some());
    }

    #[tokio::test]
    async fn open_from_qr_publishes_connected_directly() {
        let mut h = harness();
        h.create("s1").await;
        h.wait_status("s1", SessionStatus::Connecting).await;
        let link = h.link("s1");

        link.connection(ConnectionUpdate::qr("qr-1")).await;
        h.wait_status("s1", SessionStatus::QrRequired).await;
        link.connection(ConnectionUpdate::open()).await;

        let next = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(DomainEvent::SessionUpdate { session, .. }) = h.events.recv().await {
                    return session.status;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(next, SessionStatus::Connected);
    }

    #[tokio::test]
    async fn transient_close_schedules_one_reconnect() {
        let mut h = harness();
        h.create("s1").await;
        h.open("s1").await;

        h.link("s1").connection(ConnectionUpdate::closed(Some(428))).await;
        h.wait_status("s1", SessionStatus::Connecting).await;
        assert!(h.connector.wait_for_attempts(2, WAIT).await);

        let links = h.connector.links_for(&sid("s1"));
        assert_eq!(links.len(), 2);
        assert_eq!(h.manager.get(&sid("s1")).unwrap().status, SessionStatus::Connecting);

        // The new socket drives the session; the old one is stale.
        links[0].connection(ConnectionUpdate::open()).await;
        links[1].connection(ConnectionUpdate::open()).await;
        h.wait_status("s1", SessionStatus::Connected).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.connector.attempts(), 2);
    }

    #[tokio::test]
    async fn logged_out_close_is_terminal() {
        let mut h = harness();
        h.create("s1").await;
        h.open("s1").await;

        h.link("s1").connection(ConnectionUpdate::closed(Some(401))).await;
        h.wait_status("s1", SessionStatus::Disconnected).await;
        assert_eq!(h.store.session("s1").unwrap().status, SessionStatus::Disconnected);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_waits_for_the_fixed_delay() {
        let mut h = harness();
        h.create("s1").await;
        h.open("s1").await;

        h.link("s1").connection(ConnectionUpdate::closed(Some(428))).await;
        h.wait_status("s1", SessionStatus::Connecting).await;
        settle().await;

        tokio::time::advance(Duration::from_millis(49)).await;
        settle().await;
        assert_eq!(h.connector.attempts(), 1);

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(h.connector.wait_for_attempts(2, WAIT).await);
        settle().await;
        assert_eq!(h.connector.attempts(), 2);
    }

    #[tokio::test]
    async fn logged_out_before_open_fails_bring_up() {
        let mut h = harness();
        h.create("s1").await;
        h.create("s2").await;

        h.link("s1").connection(ConnectionUpdate::closed(Some(401))).await;
        let snap = h.wait_status("s1", SessionStatus::Error).await;
        assert_eq!(snap.qr_code, None);
        assert_eq!(h.store.session("s1").unwrap().status, SessionStatus::Error);

        h.link("s2").connection(ConnectionUpdate::qr("qr-1")).await;
        h.wait_status("s2", SessionStatus::QrRequired).await;
        h.link("s2").connection(ConnectionUpdate::closed(Some(401))).await;
        let snap = h.wait_status("s2", SessionStatus::Error).await;
        assert_eq!(snap.qr_code, None);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.connector.attempts(), 2);
    }

    #[tokio::test]
    async fn silent_stream_end_reconnects() {
        let mut h = harness();
        h.create("s1").await;
        h.open("s1").await;

        h.link("s1").hang_up();
        h.wait_status("s1", SessionStatus::Connecting).await;
        let err = h
            .manager
            .send_message(&sid("s1"), "1@s.whatsapp.net", json!({"text": "hi"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionNotReady { .. }));
        assert!(h.connector.links_for(&sid("s1"))[0].socket.sent().is_empty());

        assert!(h.connector.wait_for_attempts(2, WAIT).await);
        h.open("s1").await;
        h.manager
            .send_message(&sid("s1"), "1@s.whatsapp.net", json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(h.link("s1").socket.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_reconnect_lands_in_error() {
        let mut h = harness();
        h.create("s1").await;
        h.open("s1").await;

        h.connector.fail_next(1);
        h.link("s1").connection(ConnectionUpdate::closed(Some(408))).await;
        h.wait_status("s1", SessionStatus::Error).await;
        assert_eq!(h.store.session("s1").unwrap().status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn delete_cancels_pending_reconnect() {
        let mut h = harness();
        h.create("s1").await;
        h.open("s1").await;

        h.link("s1").connection(ConnectionUpdate::closed(Some(515))).await;
        h.wait_status("s1", SessionStatus::Connecting).await;
        h.manager.delete(&sid("s1")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.connector.attempts(), 1);
        assert!(h.manager.get(&sid("s1")).is_none());
        assert!(h.store.is_soft_deleted("s1"));
    }

    #[tokio::test]
    async fn delete_closes_open_socket_once() {
        let mut h = harness();
        h.create("s1").await;
        h.open("s1").await;
        let socket = h.link("s1").socket;

        h.manager.delete(&sid("s1")).await.unwrap();
        assert_eq!(socket.end_calls(), 1);

        let err = h.manager.delete(&sid("s1")).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound(_)));
        assert_eq!(socket.end_calls(), 1);
    }

    #[tokio::test]
    async fn delete_survives_close_error() {
        let mut h = harness();
        h.create("s1").await;
        h.open("s1").await;
        h.link("s1").socket.fail_end();

        h.manager.delete(&sid("s1")).await.unwrap();
        assert!(h.manager.get(&sid("s1")).is_none());
    }

    #[tokio::test]
    async fn delete_skips_closed_socket() {
        let mut h = harness();
        h.create("s1").await;
        h.open("s1").await;
        let socket = h.link("s1").socket;

        h.link("s1").connection(ConnectionUpdate::closed(Some(401))).await;
        h.wait_status("s1", SessionStatus::Disconnected).await;
        h.manager.delete(&sid("s1")).await.unwrap();
        assert_eq!(socket.end_calls(), 0);
    }

    #[tokio::test]
    async fn permanently_delete_erases_everything() {
        let h = harness();
        h.create("s1").await;
        assert!(h.creds.path().join("s1").exists());

        h.manager.permanently_delete(&sid("s1")).await.unwrap();
        assert!(!h.creds.path().join("s1").exists());
        assert!(h.store.session("s1").is_none());
        assert!(!h.store.is_soft_deleted("s1"));

        let err = h.manager.permanently_delete(&sid("s1")).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound(_)));

        let err = h.manager.restore(&sid("s1"), None).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn pairing_mode_enters_pairing_required() {
        let mut h = harness();
        let snap = h
            .manager
            .create(sid("s1"), None, None, true)
            .await
            .unwrap();
        assert_eq!(snap.status, SessionStatus::PairingRequired);
        assert!(h.link("s1").request.use_pairing_code);

        // QR events do not apply while pairing by code.
        h.link("s1").connection(ConnectionUpdate::qr("qr")).await;
        let code = h.manager.request_pairing_code(&sid("s1"), "15551234567").await.unwrap();
        assert_eq!(code, "ABCD-1234");
        assert_eq!(h.link("s1").socket.pairing_requests(), vec!["15551234567"]);

        let record = h.store.session("s1").unwrap();
        assert_eq!(record.status, SessionStatus::PairingRequired);
        assert_eq!(record.pairing_code.as_deref(), Some("ABCD-1234"));
        assert_eq!(record.phone_number.as_deref(), Some("15551234567"));

        h.open("s1").await;
        assert_eq!(h.store.session("s1").unwrap().pairing_code, None);
    }

    #[tokio::test]
    async fn pairing_code_requires_unregistered_socket() {
        let h = harness_with(MockConnector::new().with_registered(true), Duration::ZERO);
        h.create("s1").await;
        let err = h
            .manager
            .request_pairing_code(&sid("s1"), "15551234567")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionNotReady { .. }));
    }

    #[tokio::test]
    async fn pairing_code_for_unknown_session() {
        let h = harness();
        let err = h
            .manager
            .request_pairing_code(&sid("missing"), "1")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn pairing_code_after_failed_bring_up_is_not_ready() {
        let h = harness();
        h.connector.fail_next(1);
        let _ = h.manager.create(sid("s1"), None, None, true).await;
        let err = h
            .manager
            .request_pairing_code(&sid("s1"), "1")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionNotReady { .. }));
    }

    #[tokio::test]
    async fn send_requires_connected() {
        let mut h = harness();
        h.create("s1").await;
        let err = h
            .manager
            .send_message(&sid("s1"), "1@s.whatsapp.net", json!({"text": "hi"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionNotReady { .. }));

        h.open("s1").await;
        let echo = h
            .manager
            .send_message(&sid("s1"), "1@s.whatsapp.net", json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(echo["key"]["fromMe"], true);
        assert_eq!(h.link("s1").socket.sent().len(), 1);
    }

    #[tokio::test]
    async fn sends_on_one_session_are_spaced() {
        let mut h = harness_with(MockConnector::new(), Duration::from_millis(100));
        h.create("s1").await;
        h.open("s1").await;

        let s1 = sid("s1");
        let started = tokio::time::Instant::now();
        let (a, b) = tokio::join!(
            h.manager.send_message(&s1, "1@s.whatsapp.net", json!({"text": "a"})),
            h.manager.send_message(&s1, "1@s.whatsapp.net", json!({"text": "b"})),
        );
        a.unwrap();
        b.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn inbound_events_reach_reconciler() {
        let mut h = harness();
        h.create("s1").await;
        h.open("s1").await;

        let message = InboundMessage {
            key: MessageKey {
                remote_jid: Some("1@s.whatsapp.net".into()),
                from_me: false,
                id: Some("M1".into()),
                participant: None,
            },
            message: Some(json!({"conversation": "hello"})),
            message_timestamp: Some(1_700_000_000),
            push_name: None,
        };
        let upsert = ProtocolEvent::MessagesUpsert {
            messages: vec![message],
            upsert_type: Some("notify".into()),
        };
        h.link("s1").emit(upsert.clone()).await;
        h.link("s1").emit(upsert).await;
        // Contacts act as a marker that both upserts were processed.
        h.link("s1")
            .emit(ProtocolEvent::ContactsUpsert {
                contacts: vec![json!({"id": "1@s.whatsapp.net"})],
            })
            .await;
        h.wait_event("contactUpdate").await;

        assert_eq!(h.store.messages().len(), 1);
        assert!(h.webhook.wait_for(1, WAIT).await);
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let mut h = harness();
        h.create("a").await;
        h.create("b").await;
        h.open("a").await;
        h.open("b").await;

        h.link("a").connection(ConnectionUpdate::closed(Some(401))).await;
        h.wait_status("a", SessionStatus::Disconnected).await;
        assert_eq!(h.manager.get(&sid("b")).unwrap().status, SessionStatus::Connected);

        let ids: Vec<_> = h.manager.list().into_iter().map(|s| s.session_id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn restore_reattaches_eligible_records() {
        let h = harness();
        h.store.seed("connected", SessionStatus::Connected);
        h.store.seed("pairing", SessionStatus::PairingRequired);
        h.store.seed("gone", SessionStatus::Disconnected);
        h.store.seed("broken", SessionStatus::Error);

        let mut restored = h.manager.restore_all().await.unwrap();
        restored.sort();
        assert_eq!(restored, vec![sid("connected"), sid("pairing")]);
        assert!(h.manager.get(&sid("gone")).is_none());
        assert_eq!(
            h.manager.get(&sid("pairing")).unwrap().status,
            SessionStatus::PairingRequired
        );
        assert_eq!(
            h.manager.get(&sid("connected")).unwrap().status,
            SessionStatus::Connecting
        );
    }

    #[tokio::test]
    async fn restore_rejects_terminal_and_unknown() {
        let h = harness();
        h.store.seed("gone", SessionStatus::Disconnected);
        let err = h.manager.restore(&sid("gone"), None).await.unwrap_err();
        assert!(matches!(err, SessionError::NotRestorable { .. }));

        let err = h.manager.restore(&sid("missing"), None).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn restore_failure_skips_only_that_session() {
        let h = harness();
        h.store.seed("a", SessionStatus::Connected);
        h.store.seed("b", SessionStatus::Connected);
        h.connector.fail_next(1);

        let restored = h.manager.restore_all().await.unwrap();
        assert_eq!(restored, vec![sid("b")]);
        assert_eq!(h.store.session("a").unwrap().status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn reconnect_all_skips_live_sessions() {
        let h = harness();
        h.create("live").await;
        h.store.seed("idle", SessionStatus::Connected);
        h.store.seed("waiting", SessionStatus::Connecting);
        h.store
            .update_session(&sid("live"), SessionPatch::status(SessionStatus::Connected))
            .await
            .unwrap();

        let reconnected = h.manager.reconnect_all().await.unwrap();
        assert_eq!(reconnected, vec![sid("idle")]);
        assert_eq!(h.connector.attempts(), 2);
    }

    #[tokio::test]
    async fn restart_recreates_with_stored_ids() {
        let mut h = harness();
        h.manager
            .create(
                sid("s1"),
                Some(WorkflowId::from_raw("w1")),
                Some(UserId::from_raw("u1")),
                false,
            )
            .await
            .unwrap();
        h.open("s1").await;
        h.link("s1").connection(ConnectionUpdate::closed(Some(401))).await;
        h.wait_status("s1", SessionStatus::Disconnected).await;

        let snap = h.manager.restart(&sid("s1")).await.unwrap();
        assert_eq!(snap.status, SessionStatus::Connecting);
        assert_eq!(snap.workflow_id.as_ref().map(WorkflowId::as_str), Some("w1"));
        assert_eq!(snap.user_id.as_ref().map(UserId::as_str), Some("u1"));

        let record = h.store.session("s1").unwrap();
        assert_eq!(record.status, SessionStatus::Connecting);
        assert_eq!(record.phone_number, None);
        assert_eq!(record.workflow_id.as_ref().map(WorkflowId::as_str), Some("w1"));
        assert_eq!(h.connector.attempts(), 2);
        assert!(!h.link("s1").request.use_pairing_code);

        h.open("s1").await;
        assert_eq!(h.manager.get(&sid("s1")).unwrap().status, SessionStatus::Connected);
    }

    #[tokio::test]
    async fn restart_unknown_session_is_not_found() {
        let h = harness();
        let err = h.manager.restart(&sid("missing")).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound(_)));
        assert_eq!(h.connector.attempts(), 0);
    }

    #[tokio::test]
    async fn set_workflow_updates_record_and_live_view() {
        let h = harness();
        h.create("s1").await;
        h.store.seed("stored", SessionStatus::Disconnected);

        h.manager
            .set_workflow(&sid("s1"), WorkflowId::from_raw("w2"))
            .await
            .unwrap();
        let record = h.store.session("s1").unwrap();
        assert_eq!(record.workflow_id.as_ref().map(WorkflowId::as_str), Some("w2"));
        assert_eq!(record.status, SessionStatus::Connecting);
        let live = h.manager.get(&sid("s1")).unwrap();
        assert_eq!(live.workflow_id.as_ref().map(WorkflowId::as_str), Some("w2"));

        h.manager
            .set_workflow(&sid("stored"), WorkflowId::from_raw("w3"))
            .await
            .unwrap();
        assert_eq!(
            h.store.session("stored").unwrap().workflow_id.as_ref().map(WorkflowId::as_str),
            Some("w3")
        );

        let err = h
            .manager
            .set_workflow(&sid("missing"), WorkflowId::from_raw("w"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let mut h = harness();
        h.create("a").await;
        h.create("b").await;
        h.open("a").await;
        h.link("b").connection(ConnectionUpdate::closed(Some(408))).await;
        h.wait_status("b", SessionStatus::Connecting).await;

        h.manager.shutdown().await;
        assert!(h.manager.list().is_empty());
        assert_eq!(h.connector.links_for(&sid("a"))[0].socket.end_calls(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(h.connector.links_for(&sid("b")).len(), 1, "reconnect was cancelled");
    }

    #[tokio::test]
    async fn persistence_failures_do_not_stop_the_session() {
        let mut h = harness();
        h.create("s1").await;
        h.store.fail_session_updates(true);
        h.open("s1").await;
        assert_eq!(h.manager.get(&sid("s1")).unwrap().status, SessionStatus::Connected);
        assert_eq!(h.store.session("s1").unwrap().status, SessionStatus::Connecting);
    }

    #[tokio::test]
    async fn sqlite_store_tracks_lifecycle() {
        let creds = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let connector = Arc::new(MockConnector::new());
        let manager = SessionManager::builder(store.clone(), connector.clone())
            .config(EngineConfig {
                credentials_dir: creds.path().to_path_buf(),
                reconnect_delay: Duration::from_millis(50),
                operation_spacing: Duration::ZERO,
                broadcast_capacity: 64,
            })
            .build();
        let mut events = manager.subscribe();

        manager.create(sid("s1"), None, None, false).await.unwrap();
        let link = connector.last_link().unwrap();
        link.socket.set_user("15550001111@s.whatsapp.net", None);
        link.connection(ConnectionUpdate::open()).await;
        tokio::time::timeout(WAIT, async {
            while let Ok(ev) = events.recv().await {
                if let DomainEvent::SessionUpdate { session, .. } = ev {
                    if session.status == SessionStatus::Connected {
                        break;
                    }
                }
            }
        })
        .await
        .unwrap();

        let record = store.get_session(&sid("s1")).await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Connected);
        assert_eq!(record.phone_number.as_deref(), Some("15550001111"));

        manager.delete(&sid("s1")).await.unwrap();
        assert!(store.get_session(&sid("s1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn from_settings_wires_sqlite_store() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = SwitchboardSettings::default();
        settings.store.db_path = tmp.path().join("sb.db").to_string_lossy().into_owned();
        settings.sessions.credentials_dir = tmp.path().join("auth").to_string_lossy().into_owned();
        settings.geocoder.enabled = false;

        let manager = SessionManager::from_settings(&settings, Arc::new(MockConnector::new())).unwrap();
        manager.create(sid("s1"), None, None, false).await.unwrap();
        let record = manager.store().get_session(&sid("s1")).await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Connecting);
        assert!(tmp.path().join("auth").join("s1").is_dir());
    }
}
