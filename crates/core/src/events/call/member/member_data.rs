//! Types for the `m.call.member` state event content data ([MSC3401])
//!
//! [MSC3401]: https://github.com/matrix-org/matrix-spec-proposals/pull/3401

use std::time::Duration;

use as_variant::as_variant;
use serde::{Deserialize, Serialize};

use super::focus::{ActiveFocus, Focus};
use crate::serde::string_enum;
use crate::{OwnedDeviceId, UnixMillis};

/// Stores all the information for a MatrixRTC membership. (one for each
/// device)
///
/// A membership does not have the concept of timestamp based expiration on
/// the happy path: the state event will reliably be set to empty when the
/// user disconnects. The `expires` field only guards against a dropped
/// delayed leave event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionMembershipData {
    /// The type of the MatrixRTC session the membership belongs to.
    ///
    /// e.g. call, spacial, document...
    #[serde(flatten)]
    pub application: Application,

    /// The device id of this membership.
    ///
    /// The same user can join with their phone/computer.
    pub device_id: OwnedDeviceId,

    /// A list of the foci that this membership proposes to use.
    pub foci_preferred: Vec<Focus>,

    /// Data required to determine the currently used focus by this member.
    pub focus_active: ActiveFocus,

    /// Stores a copy of the `origin_server_ts` of the initial session event.
    ///
    /// If the membership is updated this field will be used to track the
    /// original `origin_server_ts`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_ts: Option<UnixMillis>,

    /// The duration in milliseconds relative to the time this membership
    /// joined during which the membership is valid.
    ///
    /// The time a member has joined is defined as:
    /// `MIN(content.created_ts, event.origin_server_ts)`
    #[serde(with = "crate::serde::duration::ms")]
    pub expires: Duration,

    /// What the user intends to do with this session, e.g. a voice-only or
    /// a video call.
    #[serde(rename = "m.call.intent", skip_serializing_if = "Option::is_none")]
    pub intent: Option<CallIntent>,
}

impl SessionMembershipData {
    /// The application of the membership is "m.call" and the scope is
    /// "m.room".
    pub fn is_room_call(&self) -> bool {
        as_variant!(&self.application, Application::Call)
            .is_some_and(|call| call.scope == CallScope::Room)
    }

    /// The application of the membership is "m.call".
    pub fn is_call(&self) -> bool {
        as_variant!(&self.application, Application::Call).is_some()
    }

    /// Checks if the membership is expired.
    ///
    /// Defaults to using the `created_ts` of the membership data.
    /// If no `origin_server_ts` is provided and the data does not contain
    /// `created_ts` the membership will be considered as not expired.
    /// In this case, a warning will be logged.
    ///
    /// # Arguments
    ///
    /// * `origin_server_ts` - a fallback if `created_ts` is not present
    pub fn is_expired(&self, origin_server_ts: Option<UnixMillis>) -> bool {
        if let Some(expire_ts) = self.expires_ts(origin_server_ts) {
            UnixMillis::now() > expire_ts
        } else {
            // This should not be reached since we only allow events that
            // have copied over the origin server ts. `set_created_ts_if_none`
            warn!(
                "Encountered a call member state event where the expire_ts could not be \
                 constructed. It is treated as a non expired event but this might be wrong."
            );
            false
        }
    }

    /// The unix timestamp at which the membership will expire.
    ///
    /// This allows to determine at what time the return value of
    /// [`SessionMembershipData::is_expired`] will change.
    ///
    /// # Arguments
    ///
    /// * `origin_server_ts` - a fallback if `created_ts` is not present
    pub fn expires_ts(&self, origin_server_ts: Option<UnixMillis>) -> Option<UnixMillis> {
        let ev_created_ts = self.created_ts.or(origin_server_ts)?;
        let expires: u64 = self.expires.as_millis().try_into().ok()?;
        Some(UnixMillis(ev_created_ts.get().checked_add(expires)?))
    }
}

/// The type of the MatrixRTC session.
///
/// This is not the application/client used by the user but the type of
/// MatrixRTC session e.g. calling (`m.call`), third-room, whiteboard could
/// be possible applications.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
#[serde(tag = "application")]
pub enum Application {
    /// The rtc application (session type) for VoIP call.
    #[serde(rename = "m.call")]
    Call(CallApplicationContent),
}

impl Application {
    /// The application identifier, e.g. `m.call`.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Call(_) => "m.call",
        }
    }

    /// The id of the session within its application namespace.
    pub fn id(&self) -> &str {
        match self {
            Self::Call(call) => &call.call_id,
        }
    }
}

/// Call specific parameters of a `m.call.member` event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CallApplicationContent {
    /// An identifier for calls.
    ///
    /// All members using the same `call_id` will end up in the same call.
    ///
    /// Does not need to be a uuid.
    ///
    /// `""` is used for room scoped calls.
    pub call_id: String,

    /// Who owns/joins/controls (can modify) the call.
    pub scope: CallScope,
}

impl CallApplicationContent {
    /// Initialize a [`CallApplicationContent`].
    ///
    /// # Arguments
    ///
    /// * `call_id` - An identifier for calls. All members using the same
    ///   `call_id` will end up in the same call. Does not need to be a
    ///   uuid. `""` is used for room scoped calls.
    /// * `scope` - Who owns/joins/controls (can modify) the call.
    pub fn new(call_id: String, scope: CallScope) -> Self {
        Self { call_id, scope }
    }
}

string_enum! {
    /// The call scope defines different call ownership models.
    pub enum CallScope {
        /// A call which every user of a room can join and create.
        ///
        /// There is no particular name associated with it.
        ///
        /// There can only be one per room.
        Room => "m.room",

        /// A user call is owned by a user.
        ///
        /// Each user can create one, there can be multiple per room. They
        /// are started and ended by the owning user.
        User => "m.user",
    }
}

string_enum! {
    /// What the user intends to do with a call session.
    pub enum CallIntent {
        /// A voice-only call.
        Audio => "audio",

        /// A call with video.
        Video => "video",
    }
}
