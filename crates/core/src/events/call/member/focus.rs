//! Types for MatrixRTC Focus/SFU configurations.

use serde::{Deserialize, Serialize};

use crate::serde::string_enum;

/// Description of the SFU/Focus a membership can be connected to.
///
/// A focus can be any server powering the MatrixRTC session (SFU,
/// MCU). It serves as a node to redistribute RTC streams.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[non_exhaustive]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Focus {
    /// LiveKit is one possible type of SFU/Focus that can be used for a
    /// MatrixRTC session.
    Livekit(LivekitFocus),
}

/// The struct to describe LiveKit as a `foci_preferred` entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LivekitFocus {
    /// The alias where the LiveKit sessions can be reached.
    #[serde(rename = "livekit_alias")]
    pub alias: String,

    /// The URL of the JWT service for the LiveKit instance.
    #[serde(rename = "livekit_service_url")]
    pub service_url: String,
}

impl LivekitFocus {
    /// Initialize a [`LivekitFocus`].
    ///
    /// # Arguments
    ///
    /// * `alias` - The alias with which the LiveKit sessions can be reached.
    /// * `service_url` - The url of the JWT server for the LiveKit instance.
    pub fn new(alias: String, service_url: String) -> Self {
        Self { alias, service_url }
    }
}

/// Data to define the actively used Focus.
///
/// A focus can be any server powering the MatrixRTC session (SFU,
/// MCU). It serves as a node to redistribute RTC streams.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActiveFocus {
    /// LiveKit is one possible type of SFU/Focus that can be used for a
    /// MatrixRTC session.
    Livekit(ActiveLivekitFocus),
}

/// The fields to describe the active LiveKit focus.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ActiveLivekitFocus {
    /// The selection method used to select the LiveKit focus for the rtc
    /// session.
    pub focus_selection: FocusSelection,
}

impl ActiveLivekitFocus {
    /// Initialize a [`ActiveLivekitFocus`].
    pub fn new() -> Self {
        Default::default()
    }
}

string_enum! {
    /// How to select the active focus for LiveKit.
    pub enum FocusSelection {
        /// Select the active focus by using the oldest membership and the
        /// oldest focus.
        OldestMembership => "oldest_membership",

        /// Let each member stay on its own preferred focus and cascade the
        /// streams between the SFUs.
        MultiSfu => "multi_sfu",
    }
}

impl Default for FocusSelection {
    fn default() -> Self {
        Self::OldestMembership
    }
}
