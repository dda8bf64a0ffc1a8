//! Tunables for the membership and encryption managers.

use std::time::Duration;

/// Configuration for the [`MembershipManager`](crate::MembershipManager).
///
/// The defaults are intended for production use; tests shrink them to keep
/// wall-clock time down.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct MembershipConfig {
    /// How long a published membership claims to be valid.
    ///
    /// The membership is re-published with a growing `expires` before the
    /// claim runs out. Default: 4 hours.
    pub membership_event_expiry: Duration,

    /// How far ahead of the expiry deadline the membership is re-published.
    ///
    /// Default: 5 seconds.
    pub membership_event_expiry_headroom: Duration,

    /// Upper bound on the interval between two expiry re-publications, even
    /// when `membership_event_expiry` claims longer validity.
    ///
    /// Default: 60 minutes.
    pub membership_sticky_duration: Duration,

    /// The timeout after which the server sends the scheduled leave event
    /// if we stop restarting it.
    ///
    /// Default: 8 seconds.
    pub delayed_leave_event_delay: Duration,

    /// The interval at which the delayed leave event countdown is
    /// restarted.
    ///
    /// Must be shorter than `delayed_leave_event_delay`. Default: 5
    /// seconds.
    pub delayed_leave_event_restart: Duration,

    /// The local deadline for a restart request. When it elapses the
    /// request is abandoned and retried, since a slow restart is as good as
    /// a lost one.
    ///
    /// Default: 2 seconds.
    pub delayed_leave_event_restart_local_timeout: Duration,

    /// The pause before retrying an action that failed with a transient
    /// network error.
    ///
    /// Default: 3 seconds.
    pub network_error_retry: Duration,

    /// The backoff applied to a rate limited action when the server did not
    /// send a `retry_after_ms`.
    ///
    /// Default: 5 seconds.
    pub rate_limit_default_retry: Duration,

    /// How many times a single action may be rate limited before the
    /// manager gives up.
    ///
    /// Default: 10.
    pub maximum_rate_limit_retry_count: u32,

    /// How many times a single action may fail with a transient network
    /// error before the manager gives up.
    ///
    /// Default: 10.
    pub maximum_network_error_retry_count: u32,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            membership_event_expiry: Duration::from_secs(4 * 60 * 60),
            membership_event_expiry_headroom: Duration::from_secs(5),
            membership_sticky_duration: Duration::from_secs(60 * 60),
            delayed_leave_event_delay: Duration::from_secs(8),
            delayed_leave_event_restart: Duration::from_secs(5),
            delayed_leave_event_restart_local_timeout: Duration::from_secs(2),
            network_error_retry: Duration::from_secs(3),
            rate_limit_default_retry: Duration::from_secs(5),
            maximum_rate_limit_retry_count: 10,
            maximum_network_error_retry_count: 10,
        }
    }
}

/// Configuration for the [`EncryptionManager`](crate::EncryptionManager).
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct EncryptionConfig {
    /// How long a rotated key is withheld from the local media layer so
    /// that recipients receive it before the first frame encrypted with
    /// it.
    ///
    /// The very first key after joining is used immediately. Default: 1
    /// second.
    pub use_key_delay: Duration,

    /// Joiners arriving within this window after a key was created receive
    /// the existing key instead of triggering another rotation. This
    /// suppresses key-rotation storms during rapid joins.
    ///
    /// Default: 10 seconds.
    pub key_rotation_grace_period: Duration,

    /// How long inbound keys of departed participants are retained after
    /// their last insert.
    ///
    /// Default: 1 second.
    pub key_buffer_ttl: Duration,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            use_key_delay: Duration::from_secs(1),
            key_rotation_grace_period: Duration::from_secs(10),
            key_buffer_ttl: Duration::from_secs(1),
        }
    }
}
