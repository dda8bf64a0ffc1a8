//! Types for the media key distribution payloads of MatrixRTC sessions.
//!
//! The same logical content is sent over two channels: per-device (to-device
//! messaging, object-shaped `keys`) and room-broadcast (a room event with
//! array-shaped `keys`).

use serde::{Deserialize, Serialize};

use super::member::Application;
use crate::serde::Base64;
use crate::{OwnedDeviceId, OwnedRoomId, UnixMillis};

/// The event type used for media key payloads on both channels.
pub const CALL_ENCRYPTION_KEYS_EVENT_TYPE: &str = "io.element.call.encryption_keys";

/// One media key of a sender's key stream.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionKeyEntry {
    /// The index of the key in its sender's stream, wrapping modulo 256.
    pub index: u8,

    /// The key material, unpadded base64.
    pub key: Base64,
}

impl EncryptionKeyEntry {
    /// Creates a new `EncryptionKeyEntry` for the given index.
    pub fn new(index: u8, key: Base64) -> Self {
        Self { index, key }
    }
}

/// A media key sent directly to a single device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallEncryptionKeysToDeviceContent {
    /// The key this message distributes.
    pub keys: EncryptionKeyEntry,

    /// The room of the RTC session this key belongs to.
    pub room_id: OwnedRoomId,

    /// Claims about the receiving member.
    pub member: KeyDistributionMember,

    /// The session slot this key belongs to.
    ///
    /// Serializes to the `application`, `call_id` and `scope` fields.
    pub session: Application,

    /// When the sender created this message.
    pub sent_ts: UnixMillis,
}

/// The addressee claims of a per-device key message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyDistributionMember {
    /// The device the sender believes it is addressing.
    ///
    /// Receivers drop payloads whose claim does not name a device.
    pub claimed_device_id: OwnedDeviceId,
}

/// A media key payload broadcast as a room event, visible to all room
/// members.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallEncryptionKeysEventContent {
    /// The keys this event distributes.
    pub keys: Vec<EncryptionKeyEntry>,

    /// The sending device.
    pub device_id: OwnedDeviceId,

    /// The call this key belongs to. `""` for the room scoped call.
    pub call_id: String,

    /// When the sender created this event.
    pub sent_ts: UnixMillis,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        CallEncryptionKeysEventContent, CallEncryptionKeysToDeviceContent, EncryptionKeyEntry,
        KeyDistributionMember,
    };
    use crate::events::call::member::{Application, CallApplicationContent, CallScope};
    use crate::serde::Base64;
    use crate::UnixMillis;

    #[test]
    fn serialize_to_device_content() {
        let content = CallEncryptionKeysToDeviceContent {
            keys: EncryptionKeyEntry::new(3, Base64::new(vec![0x42; 16])),
            room_id: "!room:example.org".into(),
            member: KeyDistributionMember {
                claimed_device_id: "RECEIVER".into(),
            },
            session: Application::Call(CallApplicationContent::new(
                "".to_owned(),
                CallScope::Room,
            )),
            sent_ts: UnixMillis(1_700_000_000_000),
        };

        assert_eq!(
            serde_json::to_value(&content).unwrap(),
            json!({
                "keys": { "index": 3, "key": "QkJCQkJCQkJCQkJCQkJCQg" },
                "room_id": "!room:example.org",
                "member": { "claimed_device_id": "RECEIVER" },
                "session": { "application": "m.call", "call_id": "", "scope": "m.room" },
                "sent_ts": 1_700_000_000_000u64,
            })
        );
    }

    #[test]
    fn room_content_round_trip() {
        let json = json!({
            "keys": [{ "index": 0, "key": "dGVzdCBtZXNzYWdl" }],
            "device_id": "SENDER",
            "call_id": "",
            "sent_ts": 1_700_000_000_000u64,
        });

        let content: CallEncryptionKeysEventContent =
            serde_json::from_value(json.clone()).unwrap();
        assert_eq!(content.keys.len(), 1);
        assert_eq!(content.keys[0].index, 0);
        assert_eq!(content.keys[0].key.as_bytes(), b"test message");

        assert_eq!(serde_json::to_value(&content).unwrap(), json);
    }
}
