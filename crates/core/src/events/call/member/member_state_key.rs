use std::fmt;

use serde::{Serialize, Serializer};

use super::Application;
use crate::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};

/// The `state_key` of a call member state event.
///
/// It is derived deterministically from the participating device and the
/// session slot: `{user_id}_{device_id}_{application}{call_id}`. In rooms
/// whose version does not allow user-owned state keys ([MSC3757]) the key
/// is additionally prefixed with an underscore.
///
/// [MSC3757]: https://github.com/matrix-org/matrix-spec-proposals/pull/3757
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CallMemberStateKey {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    raw: Box<str>,
}

impl CallMemberStateKey {
    /// Constructs the state key for the given device and session slot.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user this membership belongs to.
    /// * `device_id` - The device this membership belongs to.
    /// * `application` - The session slot within the room.
    /// * `underscore` - Whether the room version requires the leading
    ///   underscore (it does not support user-owned state keys).
    pub fn new(
        user_id: &UserId,
        device_id: &DeviceId,
        application: &Application,
        underscore: bool,
    ) -> Self {
        let prefix = if underscore { "_" } else { "" };
        let raw = format!(
            "{prefix}{user_id}_{device_id}_{}{}",
            application.as_str(),
            application.id()
        )
        .into();

        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            raw,
        }
    }

    /// Returns the user id in this state key.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Returns the device id in this state key.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The state key as it is sent over the wire.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl AsRef<str> for CallMemberStateKey {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for CallMemberStateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for CallMemberStateKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_ref())
    }
}

/// Whether a room version allows state keys that start with the sender's
/// user id ([MSC3757], [MSC3779]).
///
/// [MSC3757]: https://github.com/matrix-org/matrix-spec-proposals/pull/3757
/// [MSC3779]: https://github.com/matrix-org/matrix-spec-proposals/pull/3779
pub fn room_version_supports_owned_state_keys(room_version: &str) -> bool {
    room_version.starts_with("org.matrix.msc3757") || room_version.starts_with("org.matrix.msc3779")
}
