//! Participants of an RTC session as the managers see them.

use std::fmt;

use calliope_core::events::call::member::SessionMembershipData;
use calliope_core::{DeviceId, OwnedDeviceId, OwnedUserId, UnixMillis, UserId};

/// Identifies one participating device, `{user_id}:{device_id}`.
///
/// Both parts are opaque; equality is exact string equality.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Build the id for the given user and device.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        Self(format!("{user_id}:{device_id}"))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <str as fmt::Debug>::fmt(&self.0, f)
    }
}

/// One device participating in the session, projected down to what key
/// distribution needs.
///
/// The `membership_ts` disambiguates re-joins: the same device coming back
/// carries a new membership timestamp and must be treated as a new key
/// recipient.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParticipantDevice {
    /// The participating user.
    pub user_id: OwnedUserId,

    /// The participating device.
    pub device_id: OwnedDeviceId,

    /// When this participation session was created.
    pub membership_ts: UnixMillis,
}

impl ParticipantDevice {
    /// The participant id of this device.
    pub fn participant_id(&self) -> ParticipantId {
        ParticipantId::new(&self.user_id, &self.device_id)
    }

    /// Whether this entry describes the same device, ignoring the
    /// membership timestamp.
    pub fn is_same_device(&self, other: &ParticipantDevice) -> bool {
        self.user_id == other.user_id && self.device_id == other.device_id
    }
}

/// One membership fact observed in room state, as fed into the managers by
/// the host application.
#[derive(Clone, Debug)]
pub struct SessionMember {
    /// The user that published the fact.
    pub user_id: OwnedUserId,

    /// The membership content.
    pub membership: SessionMembershipData,

    /// The `origin_server_ts` of the state event, when known. Used as a
    /// fallback when the content does not carry `created_ts` yet.
    pub origin_server_ts: Option<UnixMillis>,
}

impl SessionMember {
    /// The device this membership belongs to.
    pub fn device_id(&self) -> &DeviceId {
        &self.membership.device_id
    }

    /// When this participation session was created.
    ///
    /// Prefers the `created_ts` carried in the content and falls back to
    /// the event's `origin_server_ts`.
    pub fn created_ts(&self) -> Option<UnixMillis> {
        self.membership.created_ts.or(self.origin_server_ts)
    }

    /// Whether this fact was published by the given device.
    pub fn is_device(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        *self.user_id == *user_id && *self.device_id() == *device_id
    }

    /// Project this membership down to a [`ParticipantDevice`].
    pub fn to_device(&self) -> ParticipantDevice {
        ParticipantDevice {
            user_id: self.user_id.clone(),
            device_id: self.membership.device_id.clone(),
            membership_ts: self.created_ts().unwrap_or_default(),
        }
    }
}
