//! Pluggable key transports.
//!
//! A transport delivers an encoded media key with its index to a set of
//! target devices and emits inbound key events. Two interchangeable
//! implementations exist (per-device and room-broadcast), plus a composite
//! that multiplexes them.

mod composite;
mod room;
mod to_device;

pub use composite::RoomAndToDeviceKeyTransport;
pub use room::{DecryptionError, EventDecryptor, RoomKeyTransport, RoomKeysEvent, RoomKeysPayload};
pub use to_device::ToDeviceKeyTransport;

use async_trait::async_trait;
use tokio::sync::broadcast;

use calliope_core::serde::Base64DecodeError;
use calliope_core::{OwnedDeviceId, OwnedUserId, UnixMillis};

use crate::client::RequestError;
use crate::participant::ParticipantDevice;

/// An inbound media key event emitted by a transport.
#[derive(Clone, Debug)]
pub struct ReceivedKey {
    /// The sending user.
    pub user_id: OwnedUserId,

    /// The sending device.
    pub device_id: OwnedDeviceId,

    /// The key material, unpadded base64.
    pub key: String,

    /// The index of the key in the sender's stream.
    pub index: u8,

    /// When the sender created the key message.
    pub timestamp: UnixMillis,
}

/// A key could not be delivered.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum KeyTransportError {
    /// The driver cannot deliver keys this way at all. Callers may fall
    /// back to another transport.
    #[error("the transport is not supported by this client")]
    NotSupported,

    /// The key was not valid base64.
    #[error("invalid key encoding: {0}")]
    InvalidKey(#[from] Base64DecodeError),

    /// The underlying request failed.
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Delivers media keys between the participants of a session.
#[async_trait]
pub trait KeyTransport: Send + Sync {
    /// Start emitting inbound key events.
    async fn start(&self);

    /// Stop emitting inbound key events.
    async fn stop(&self);

    /// Delivers the key record to exactly the listed devices. An empty
    /// member list is a no-op. The caller excludes itself.
    async fn send_key(
        &self,
        key: &str,
        index: u8,
        members: &[ParticipantDevice],
    ) -> Result<(), KeyTransportError>;

    /// Subscribe to inbound key events.
    fn subscribe(&self) -> broadcast::Receiver<ReceivedKey>;
}
