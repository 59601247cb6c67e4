//! Translates raw protocol events into persisted, deduplicated domain events.
//!
//! Connection updates belong to the lifecycle controller and never reach
//! this module. Everything else arrives here one event at a time, in the
//! order the session's socket produced it. A failure on one item of a batch
//! is logged and the rest of the batch still runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use switchboard_core::events::{DomainEvent, InboundMessage, MessageStatusUpdate, ProtocolEvent};
use switchboard_core::records::{ChatRecord, GroupRecord, MessageRecord, MessageType};
use switchboard_core::SessionId;
use switchboard_store::{SaveOutcome, SessionStore, StoreError};

use crate::credentials::CredentialVault;
use crate::fanout::{Broadcaster, WebhookDispatcher};
use crate::geocode::{coordinates, Geocoder, LocationInfo};

pub const MESSAGE_RECEIVED: &str = "message.received";

/// Why a single inbound message was not stored.
#[derive(Debug, PartialEq, Eq)]
enum Skipped {
    MissingKey,
    Duplicate,
}

pub struct EventReconciler {
    store: Arc<dyn SessionStore>,
    broadcaster: Broadcaster,
    webhook: Arc<dyn WebhookDispatcher>,
    geocoder: Option<Arc<dyn Geocoder>>,
    vault: CredentialVault,
}

impl EventReconciler {
    pub fn new(
        store: Arc<dyn SessionStore>,
        broadcaster: Broadcaster,
        webhook: Arc<dyn WebhookDispatcher>,
        geocoder: Option<Arc<dyn Geocoder>>,
        vault: CredentialVault,
    ) -> Self {
        Self {
            store,
            broadcaster,
            webhook,
            geocoder,
            vault,
        }
    }

    #[instrument(skip_all, fields(session_id = %session_id, kind = event.kind()))]
    pub async fn apply(&self, session_id: &SessionId, event: ProtocolEvent) {
        match event {
            ProtocolEvent::ConnectionUpdate(_) => {
                debug!("connection update routed to reconciler, ignoring");
            }
            ProtocolEvent::CredentialsUpdate { creds } => {
                if let Err(e) = self.vault.save_credentials(session_id, &creds).await {
                    error!(error = %e, "failed to save credentials");
                }
            }
            ProtocolEvent::MessagesUpsert {
                messages,
                upsert_type,
            } => {
                for message in messages {
                    self.ingest_message(session_id, message, upsert_type.as_deref())
                        .await;
                }
            }
            ProtocolEvent::MessagesUpdate { updates } => {
                for update in updates {
                    self.apply_status_update(session_id, update).await;
                }
            }
            ProtocolEvent::ChatsUpsert { chats } => {
                for chat in &chats {
                    self.upsert_chat(session_id, chat).await;
                }
            }
            ProtocolEvent::GroupsUpsert { groups } => {
                for group in &groups {
                    self.upsert_group(session_id, group).await;
                }
            }
            ProtocolEvent::ContactsUpsert { contacts } => {
                for contact in contacts {
                    let _ = self.broadcaster.publish(DomainEvent::ContactUpdate {
                        session_id: session_id.clone(),
                        contact,
                    });
                }
            }
        }
    }

    async fn ingest_message(
        &self,
        session_id: &SessionId,
        message: InboundMessage,
        upsert_type: Option<&str>,
    ) {
        let message_id = message.key.id.clone().unwrap_or_default();
        match self.store_message(session_id, message, upsert_type).await {
            Ok(Ok(())) => {}
            Ok(Err(Skipped::Duplicate)) => {
                info!(message_id = %message_id, "skipping duplicate message");
            }
            Ok(Err(Skipped::MissingKey)) => {
                debug!("message without id or chat, skipping");
            }
            Err(e) => {
                error!(message_id = %message_id, error = %e, "failed to persist message");
            }
        }
    }

    /// Persist one message, then broadcast it and notify the webhook.
    async fn store_message(
        &self,
        session_id: &SessionId,
        message: InboundMessage,
        upsert_type: Option<&str>,
    ) -> Result<Result<(), Skipped>, StoreError> {
        let (Some(message_id), Some(chat_id)) =
            (message.key.id.clone(), message.key.remote_jid.clone())
        else {
            return Ok(Err(Skipped::MissingKey));
        };

        if self.store.message_exists(session_id, &message_id).await? {
            return Ok(Err(Skipped::Duplicate));
        }

        let record = self
            .build_record(session_id, message_id, chat_id, &message, upsert_type)
            .await;
        if self.store.save_message(record.clone()).await? == SaveOutcome::Duplicate {
            return Ok(Err(Skipped::Duplicate));
        }

        let _ = self.broadcaster.publish(DomainEvent::Message {
            session_id: session_id.clone(),
            message: record.clone(),
        });

        if !record.from_me {
            let webhook = self.webhook.clone();
            let sid = session_id.clone();
            let payload = json!({
                "sessionId": sid,
                "message": record,
                "type": upsert_type,
            });
            tokio::spawn(async move {
                if let Err(e) = webhook.dispatch(&sid, MESSAGE_RECEIVED, payload).await {
                    warn!(session_id = %sid, error = %e, "webhook delivery failed");
                }
            });
        }
        Ok(Ok(()))
    }

    async fn build_record(
        &self,
        session_id: &SessionId,
        message_id: String,
        chat_id: String,
        message: &InboundMessage,
        upsert_type: Option<&str>,
    ) -> MessageRecord {
        let message_type = MessageType::classify(message.message.as_ref());
        let mut content = message.message.clone().unwrap_or_else(|| json!({}));

        if message_type == MessageType::Location {
            if let Some(info) = self.resolve_location(&content).await {
                if let (Some(obj), Ok(v)) = (content.as_object_mut(), serde_json::to_value(info)) {
                    let _ = obj.insert("locationInfo".into(), v);
                }
            }
        }

        let timestamp = message
            .message_timestamp
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);

        MessageRecord {
            session_id: session_id.clone(),
            from_me: message.key.from_me,
            from_jid: message
                .key
                .participant
                .clone()
                .or_else(|| Some(chat_id.clone())),
            to_jid: Some(chat_id.clone()),
            message_id,
            chat_id,
            message_type,
            content,
            timestamp,
            quoted_message_id: message.quoted_message_id(),
            metadata: json!({
                "type": upsert_type,
                "pushName": message.push_name,
            }),
            status: None,
        }
    }

    /// Geocode a location message. A lookup failure is logged and the
    /// message is stored without the enrichment.
    async fn resolve_location(&self, content: &Value) -> Option<LocationInfo> {
        let geocoder = self.geocoder.as_ref()?;
        let location = content.get("locationMessage")?;
        let (latitude, longitude) = coordinates(location)?;
        match geocoder.reverse(latitude, longitude).await {
            Ok(details) => Some(LocationInfo::new(location, latitude, longitude, details)),
            Err(e) => {
                warn!(latitude, longitude, error = %e, "reverse geocoding failed");
                None
            }
        }
    }

    async fn apply_status_update(&self, session_id: &SessionId, update: MessageStatusUpdate) {
        if let (Some(status), Some(message_id)) = (update.status(), update.key.id.as_deref()) {
            match self
                .store
                .update_message_status(session_id, message_id, &status)
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!(message_id, "status update for unknown message"),
                Err(e) => error!(message_id, error = %e, "failed to update message status"),
            }
        }
        let _ = self.broadcaster.publish(DomainEvent::MessageUpdate {
            session_id: session_id.clone(),
            update,
        });
    }

    async fn upsert_chat(&self, session_id: &SessionId, chat: &Value) {
        let Some(record) = ChatRecord::from_snapshot(session_id, chat) else {
            debug!("chat without id, skipping");
            return;
        };
        if let Err(e) = self.store.upsert_chat(record.clone()).await {
            error!(jid = %record.jid, error = %e, "failed to upsert chat");
        }
        let _ = self.broadcaster.publish(DomainEvent::ChatUpdate {
            session_id: session_id.clone(),
            chat: record,
        });
    }

    async fn upsert_group(&self, session_id: &SessionId, group: &Value) {
        let Some(record) = GroupRecord::from_snapshot(session_id, group) else {
            debug!("group without id, skipping");
            return;
        };
        if let Err(e) = self.store.upsert_group(record.clone()).await {
            error!(jid = %record.jid, error = %e, "failed to upsert group");
        }
        let _ = self.broadcaster.publish(DomainEvent::GroupUpdate {
            session_id: session_id.clone(),
            group: record,
        });
    }
}
