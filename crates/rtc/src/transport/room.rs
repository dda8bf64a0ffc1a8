//! Key broadcast over a room event, visible to all room members.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

use calliope_core::events::call::encryption_keys::{
    CallEncryptionKeysEventContent, EncryptionKeyEntry, CALL_ENCRYPTION_KEYS_EVENT_TYPE,
};
use calliope_core::serde::Base64;
use calliope_core::{
    EventId, OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId, TransactionId, UnixMillis,
};

use crate::client::MatrixRtcClient;
use crate::participant::ParticipantDevice;

use super::{KeyTransport, KeyTransportError, ReceivedKey};

/// An event could not be decrypted.
#[derive(Debug, thiserror::Error)]
#[error("event could not be decrypted: {0}")]
pub struct DecryptionError(pub String);

/// Decrypts room events on demand.
///
/// Implemented by the host on top of its crypto stack; the transport asks
/// for decryption when an inbound key event arrives still encrypted.
#[async_trait]
pub trait EventDecryptor: Send + Sync {
    /// Request the decrypted content of the given event.
    async fn request_decryption(&self, event_id: &EventId)
        -> Result<JsonValue, DecryptionError>;
}

/// The content of an inbound room key event, as the sync glue saw it.
#[derive(Clone, Debug)]
pub enum RoomKeysPayload {
    /// The event was already decrypted (or sent in the clear).
    Plain(JsonValue),
    /// The event is still encrypted; the transport will request
    /// decryption.
    Encrypted,
}

/// An inbound room event carrying media keys.
#[derive(Clone, Debug)]
pub struct RoomKeysEvent {
    /// The event id, used to request decryption.
    pub event_id: OwnedEventId,
    /// The sending user.
    pub sender: OwnedUserId,
    /// The content, possibly still encrypted.
    pub payload: RoomKeysPayload,
}

/// Broadcasts each key as a single room event instead of per-device
/// messages. The target member list is ignored; every room member can see
/// the key.
pub struct RoomKeyTransport {
    client: Arc<dyn MatrixRtcClient>,
    decryptor: Arc<dyn EventDecryptor>,
    room_id: OwnedRoomId,
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    tx: broadcast::Sender<ReceivedKey>,
    started: AtomicBool,
}

impl RoomKeyTransport {
    /// Creates the transport for the given room.
    pub fn new(
        client: Arc<dyn MatrixRtcClient>,
        decryptor: Arc<dyn EventDecryptor>,
        room_id: OwnedRoomId,
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
    ) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            client,
            decryptor,
            room_id,
            user_id,
            device_id,
            tx,
            started: AtomicBool::new(false),
        }
    }

    /// Feeds one inbound room key event into the transport.
    ///
    /// Requests decryption when needed (retrying once after a second),
    /// ignores events of other calls and our own broadcasts, and drops
    /// malformed content with a warning.
    pub async fn receive_room_event(&self, event: RoomKeysEvent) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }

        let content = match event.payload {
            RoomKeysPayload::Plain(content) => content,
            RoomKeysPayload::Encrypted => {
                match self.decrypt_with_retry(&event.event_id).await {
                    Ok(content) => content,
                    Err(error) => {
                        warn!(
                            event_id = %event.event_id,
                            "unable to decrypt inbound media key event: {error}"
                        );
                        return;
                    }
                }
            }
        };

        let content: CallEncryptionKeysEventContent = match serde_json::from_value(content) {
            Ok(content) => content,
            Err(error) => {
                warn!(sender = %event.sender, "dropping malformed media key event: {error}");
                return;
            }
        };

        if !content.call_id.is_empty() {
            debug!(call_id = %content.call_id, "ignoring media keys of another call");
            return;
        }
        if event.sender == self.user_id && content.device_id == self.device_id {
            return;
        }

        for entry in &content.keys {
            let _ = self.tx.send(ReceivedKey {
                user_id: event.sender.clone(),
                device_id: content.device_id.clone(),
                key: entry.key.encode(),
                index: entry.index,
                timestamp: content.sent_ts,
            });
        }
    }

    async fn decrypt_with_retry(
        &self,
        event_id: &EventId,
    ) -> Result<JsonValue, DecryptionError> {
        match self.decryptor.request_decryption(event_id).await {
            Ok(content) => Ok(content),
            Err(_) => {
                // The session key may simply not have arrived yet.
                tokio::time::sleep(Duration::from_secs(1)).await;
                self.decryptor.request_decryption(event_id).await
            }
        }
    }
}

#[async_trait]
impl KeyTransport for RoomKeyTransport {
    async fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    async fn send_key(
        &self,
        key: &str,
        index: u8,
        members: &[ParticipantDevice],
    ) -> Result<(), KeyTransportError> {
        if members.is_empty() {
            return Ok(());
        }

        let key = Base64::parse(key)?;
        let content = CallEncryptionKeysEventContent {
            keys: vec![EncryptionKeyEntry::new(index, key)],
            device_id: self.device_id.clone(),
            call_id: String::new(),
            sent_ts: UnixMillis::now(),
        };

        self.client
            .send_room_event(
                &self.room_id,
                CALL_ENCRYPTION_KEYS_EVENT_TYPE,
                &TransactionId::new(),
                serde_json::to_value(&content).expect("key payload serializes"),
            )
            .await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ReceivedKey> {
        self.tx.subscribe()
    }
}
