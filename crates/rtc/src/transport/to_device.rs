//! Per-device key delivery over to-device messaging.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

use calliope_core::events::call::encryption_keys::{
    CallEncryptionKeysToDeviceContent, EncryptionKeyEntry, KeyDistributionMember,
    CALL_ENCRYPTION_KEYS_EVENT_TYPE,
};
use calliope_core::events::call::member::Application;
use calliope_core::serde::Base64;
use calliope_core::{DeviceId, OwnedDeviceId, OwnedRoomId, TransactionId, UnixMillis, UserId};

use crate::client::{MatrixRtcClient, RequestError, ToDeviceMessages};
use crate::participant::ParticipantDevice;

use super::{KeyTransport, KeyTransportError, ReceivedKey};

/// Sends each key encrypted to every target device individually.
///
/// Inbound traffic is fed in by the host's sync glue through
/// [`receive_to_device_message`](Self::receive_to_device_message).
pub struct ToDeviceKeyTransport {
    client: Arc<dyn MatrixRtcClient>,
    room_id: OwnedRoomId,
    device_id: OwnedDeviceId,
    application: Application,
    tx: broadcast::Sender<ReceivedKey>,
    started: AtomicBool,
}

impl ToDeviceKeyTransport {
    /// Creates the transport for the given session slot.
    pub fn new(
        client: Arc<dyn MatrixRtcClient>,
        room_id: OwnedRoomId,
        device_id: OwnedDeviceId,
        application: Application,
    ) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            client,
            room_id,
            device_id,
            application,
            tx,
            started: AtomicBool::new(false),
        }
    }

    /// Feeds one decrypted to-device message into the transport.
    ///
    /// `sender_device_id` is the device the envelope claims to come from.
    /// Malformed payloads, payloads for other rooms and payloads claiming a
    /// different target device are dropped with a warning.
    pub fn receive_to_device_message(
        &self,
        sender_user_id: &UserId,
        sender_device_id: &DeviceId,
        content: JsonValue,
    ) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }

        let content: CallEncryptionKeysToDeviceContent = match serde_json::from_value(content) {
            Ok(content) => content,
            Err(error) => {
                warn!(sender = %sender_user_id, "dropping malformed media key message: {error}");
                return;
            }
        };

        if content.room_id != self.room_id {
            warn!(
                sender = %sender_user_id,
                room = %content.room_id,
                "dropping media key message for another room"
            );
            return;
        }
        if content.member.claimed_device_id != self.device_id {
            warn!(
                sender = %sender_user_id,
                claimed = %content.member.claimed_device_id,
                "dropping media key message claiming another device"
            );
            return;
        }

        let _ = self.tx.send(ReceivedKey {
            user_id: sender_user_id.to_owned(),
            device_id: sender_device_id.to_owned(),
            key: content.keys.key.encode(),
            index: content.keys.index,
            timestamp: content.sent_ts,
        });
    }
}

#[async_trait]
impl KeyTransport for ToDeviceKeyTransport {
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
        let sent_ts = UnixMillis::now();
        let mut messages = ToDeviceMessages::new();
        for member in members {
            let content = CallEncryptionKeysToDeviceContent {
                keys: EncryptionKeyEntry::new(index, key.clone()),
                room_id: self.room_id.clone(),
                member: KeyDistributionMember {
                    claimed_device_id: member.device_id.clone(),
                },
                session: self.application.clone(),
                sent_ts,
            };
            messages
                .entry(member.user_id.clone())
                .or_default()
                .insert(
                    member.device_id.clone(),
                    serde_json::to_value(&content).expect("key payload serializes"),
                );
        }

        self.client
            .send_to_device_event(
                CALL_ENCRYPTION_KEYS_EVENT_TYPE,
                &TransactionId::new(),
                messages,
            )
            .await
            .map_err(|error| match error {
                RequestError::UnsupportedEndpoint => KeyTransportError::NotSupported,
                error => error.into(),
            })
    }

    fn subscribe(&self) -> broadcast::Receiver<ReceivedKey> {
        self.tx.subscribe()
    }
}
