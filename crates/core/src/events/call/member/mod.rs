//! Types for MatrixRTC state events ([MSC3401]).
//!
//! One event per device: multiple state keys are used to describe multiple
//! devices for one user.
//!
//! [MSC3401]: https://github.com/matrix-org/matrix-spec-proposals/pull/3401

mod focus;
mod member_data;
mod member_state_key;
pub use focus::*;
pub use member_data::*;
pub use member_state_key::*;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serde::string_enum;
use crate::{OwnedDeviceId, UnixMillis};

/// The member state event for a MatrixRTC session.
///
/// This is the object containing all the data related to a Matrix user's
/// participation in a MatrixRTC session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallMemberEventContent {
    /// A membership event. `SessionMembershipData` contains all the
    /// information required to represent the current membership state of
    /// one device.
    Session(SessionMembershipData),

    /// An empty content means this user has been in a rtc session but is
    /// not anymore.
    Empty(EmptyMembershipData),
}

impl CallMemberEventContent {
    /// The event type of this content.
    pub const TYPE: &'static str = "org.matrix.msc3401.call.member";

    /// Creates a new [`CallMemberEventContent`] with [`SessionMembershipData`].
    ///
    /// # Arguments
    /// * `application` - The application that is creating the membership.
    /// * `device_id` - The device ID of the member.
    /// * `focus_active` - The active focus state of the member.
    /// * `foci_preferred` - The preferred focus states of the member.
    /// * `created_ts` - The timestamp when this state event chain for
    ///   memberships was created. When updating the event the `created_ts`
    ///   should be copied from the previous state. Set to `None` if this is
    ///   the initial join event for the session.
    /// * `expires` - The time after which the event is considered as
    ///   expired.
    pub fn new(
        application: Application,
        device_id: OwnedDeviceId,
        focus_active: ActiveFocus,
        foci_preferred: Vec<Focus>,
        created_ts: Option<UnixMillis>,
        expires: Duration,
    ) -> Self {
        Self::Session(SessionMembershipData {
            application,
            device_id,
            focus_active,
            foci_preferred,
            created_ts,
            expires,
            intent: None,
        })
    }

    /// Creates a new Empty [`CallMemberEventContent`] representing a left
    /// membership.
    pub fn new_empty(leave_reason: Option<LeaveReason>) -> Self {
        Self::Empty(EmptyMembershipData { leave_reason })
    }

    /// The membership in this member event, if the user is part of the
    /// session.
    pub fn session(&self) -> Option<&SessionMembershipData> {
        match self {
            Self::Session(data) => Some(data),
            Self::Empty(_) => None,
        }
    }

    /// The membership in this member event, if it has not expired yet.
    ///
    /// This method needs to be called periodically to check if the event is
    /// still valid.
    ///
    /// # Arguments
    ///
    /// * `origin_server_ts` - a fallback in case the membership does not
    ///   contain `created_ts`
    pub fn active_membership(
        &self,
        origin_server_ts: Option<UnixMillis>,
    ) -> Option<&SessionMembershipData> {
        self.session().filter(|m| !m.is_expired(origin_server_ts))
    }

    /// Set the `created_ts` in this event.
    ///
    /// `content.created_ts` is undefined for the initial event of a session
    /// (because the `origin_server_ts` is not known on the client). Copying
    /// over the `origin_server_ts` of the event into the content allows to
    /// determine if a membership is expired from the content alone.
    pub fn set_created_ts_if_none(&mut self, origin_server_ts: UnixMillis) {
        if let Self::Session(m) = self {
            m.created_ts.get_or_insert(origin_server_ts);
        }
    }
}

/// This describes the CallMember event if the user is not part of the
/// current session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyMembershipData {
    /// An empty call member state event can optionally contain a leave
    /// reason. If it is `None` the user has left the call ordinarily.
    /// (Intentional hangup)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leave_reason: Option<LeaveReason>,
}

string_enum! {
    /// The reason why a user left a call.
    ///
    /// It is used when the user disconnected and a delayed event
    /// ([MSC4140](https://github.com/matrix-org/matrix-spec-proposals/pull/4140))
    /// was used to update the membership after the client was not reachable
    /// anymore.
    pub enum LeaveReason {
        /// The user left the call by losing network connection or closing
        /// the client before it was able to send the leave event.
        LostConnection => "m.lost_connection",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches2::assert_matches;
    use serde_json::json;

    use super::{
        ActiveFocus, ActiveLivekitFocus, Application, CallApplicationContent,
        CallMemberEventContent, CallScope, EmptyMembershipData, Focus, FocusSelection,
        LivekitFocus,
    };
    use crate::UnixMillis;

    fn create_call_member_event_content() -> CallMemberEventContent {
        CallMemberEventContent::new(
            Application::Call(CallApplicationContent {
                call_id: "123456".to_owned(),
                scope: CallScope::Room,
            }),
            "THIS_DEVICE".into(),
            ActiveFocus::Livekit(ActiveLivekitFocus {
                focus_selection: FocusSelection::OldestMembership,
            }),
            vec![Focus::Livekit(LivekitFocus {
                alias: "room1".to_owned(),
                service_url: "https://livekit1.com".to_owned(),
            })],
            None,
            Duration::from_secs(14_400),
        )
    }

    #[test]
    fn serialize_call_member_event_content() {
        let expected = json!({
            "application": "m.call",
            "call_id": "123456",
            "scope": "m.room",
            "device_id": "THIS_DEVICE",
            "expires": 14_400_000,
            "focus_active": {
                "type": "livekit",
                "focus_selection": "oldest_membership"
            },
            "foci_preferred": [
                {
                    "livekit_alias": "room1",
                    "livekit_service_url": "https://livekit1.com",
                    "type": "livekit"
                }
            ],
        });

        assert_eq!(
            expected,
            serde_json::to_value(create_call_member_event_content()).unwrap()
        );
    }

    #[test]
    fn deserialize_call_member_event_content() {
        let json = json!({
            "application": "m.call",
            "call_id": "",
            "scope": "m.room",
            "device_id": "ABCDE",
            "expires": 3_600_000,
            "m.call.intent": "audio",
            "focus_active": {
                "type": "livekit",
                "focus_selection": "multi_sfu"
            },
            "foci_preferred": [],
        });

        let content: CallMemberEventContent = serde_json::from_value(json).unwrap();
        assert_matches!(&content, CallMemberEventContent::Session(session));
        assert_eq!(session.device_id.as_str(), "ABCDE");
        assert_eq!(
            session.intent.as_ref().map(|intent| intent.as_str()),
            Some("audio")
        );
        assert_matches!(&session.focus_active, ActiveFocus::Livekit(focus));
        assert_eq!(focus.focus_selection, FocusSelection::MultiSfu);
    }

    #[test]
    fn empty_content_serializes_to_empty_object() {
        let empty = CallMemberEventContent::Empty(EmptyMembershipData { leave_reason: None });
        assert_eq!(serde_json::to_value(&empty).unwrap(), json!({}));
    }

    #[test]
    fn deserialize_empty_content() {
        let content: CallMemberEventContent = serde_json::from_value(json!({})).unwrap();
        assert_matches!(content, CallMemberEventContent::Empty(_));
    }

    #[test]
    fn session_membership_does_expire() {
        let content = create_call_member_event_content();
        let now = UnixMillis::now();
        let one_second_ago = UnixMillis(now.get() - 1000);
        let two_hours_ago = UnixMillis(now.get() - 2 * 60 * 60 * 1000);
        let five_hours_ago = UnixMillis(now.get() - 5 * 60 * 60 * 1000);

        assert!(content.active_membership(Some(now)).is_some());
        assert!(content.active_membership(Some(one_second_ago)).is_some());
        assert!(content.active_membership(Some(two_hours_ago)).is_some());
        assert!(content.active_membership(Some(five_hours_ago)).is_none());
    }

    #[test]
    fn set_created_ts_is_not_overwritten() {
        let mut content = create_call_member_event_content();
        let first = UnixMillis(1_700_000_000_000);
        let later = UnixMillis(1_700_000_100_000);

        content.set_created_ts_if_none(first);
        content.set_created_ts_if_none(later);

        assert_eq!(content.session().unwrap().created_ts, Some(first));
    }
}
