//! The adapter contract onto the Matrix client API.
//!
//! The managers in this crate never talk HTTP themselves. The host
//! application implements [`MatrixRtcClient`] on top of its client stack and
//! maps transport failures into [`RequestError`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use calliope_core::{
    ErrorKind, MatrixError, OwnedDeviceId, OwnedEventId, OwnedUserId, RoomId, TransactionId,
};

/// The nested errcode a server uses to reject a too large delay
/// ([MSC4140]).
///
/// [MSC4140]: https://github.com/matrix-org/matrix-spec-proposals/pull/4140
pub const MSC4140_ERRCODE: &str = "org.matrix.msc4140.errcode";

/// The maximum delay a server is willing to schedule, attached to an
/// `M_MAX_DELAY_EXCEEDED` rejection.
pub const MSC4140_MAX_DELAY: &str = "org.matrix.msc4140.max_delay";

const MAX_DELAY_EXCEEDED: &str = "M_MAX_DELAY_EXCEEDED";

/// To-device payloads grouped by user and device.
pub type ToDeviceMessages = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, JsonValue>>;

/// The update actions for a scheduled delayed event ([MSC4140]).
///
/// [MSC4140]: https://github.com/matrix-org/matrix-spec-proposals/pull/4140
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum UpdateDelayedEventAction {
    /// Restart the delayed event timeout. (heartbeat ping)
    Restart,
    /// Send the delayed event immediately independent of the timeout state.
    /// (deletes all timers)
    Send,
    /// Delete the delayed event and never send it. (deletes all timers)
    Cancel,
}

impl UpdateDelayedEventAction {
    /// The wire representation of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Send => "send",
            Self::Cancel => "cancel",
        }
    }
}

/// The Matrix client API surface the managers consume.
///
/// Every method is a thin mapping onto one client-server endpoint. The
/// implementation is expected to classify failures: homeserver errors parse
/// into [`MatrixError`] and convert via `RequestError::from`, everything
/// below HTTP becomes [`RequestError::Connection`].
#[async_trait]
pub trait MatrixRtcClient: Send + Sync {
    /// `PUT /_matrix/client/v3/rooms/{roomId}/state/{eventType}/{stateKey}`
    async fn send_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
        content: JsonValue,
    ) -> Result<OwnedEventId, RequestError>;

    /// The same endpoint with the [MSC4140] `org.matrix.msc4140.delay`
    /// query parameter; returns the server generated `delay_id`.
    ///
    /// [MSC4140]: https://github.com/matrix-org/matrix-spec-proposals/pull/4140
    async fn send_delayed_state_event(
        &self,
        room_id: &RoomId,
        delay: Duration,
        event_type: &str,
        state_key: &str,
        content: JsonValue,
    ) -> Result<String, RequestError>;

    /// `POST /_matrix/client/unstable/org.matrix.msc4140/delayed_events/{delayId}`
    async fn update_delayed_event(
        &self,
        delay_id: &str,
        action: UpdateDelayedEventAction,
    ) -> Result<(), RequestError>;

    /// `PUT /_matrix/client/v3/sendToDevice/{eventType}/{txnId}`
    async fn send_to_device_event(
        &self,
        event_type: &str,
        txn_id: &TransactionId,
        messages: ToDeviceMessages,
    ) -> Result<(), RequestError>;

    /// `PUT /_matrix/client/v3/rooms/{roomId}/send/{eventType}/{txnId}`
    async fn send_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        txn_id: &TransactionId,
        content: JsonValue,
    ) -> Result<OwnedEventId, RequestError>;
}

/// A request against the client API failed.
///
/// This is the typed taxonomy the state machines branch on; the adapter (or
/// [`From<MatrixError>`]) produces it.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RequestError {
    /// `M_LIMIT_EXCEEDED`: the homeserver is rate limiting us.
    #[error("rate limited by the homeserver")]
    RateLimited {
        /// How long the server asks us to wait before retrying.
        retry_after: Option<Duration>,
    },

    /// `M_NOT_FOUND`: the resource (e.g. a delayed event handle) is gone.
    #[error("resource not found")]
    NotFound,

    /// The requested delay exceeds the maximum the server accepts.
    #[error("requested delay exceeds the server maximum")]
    MaxDelayExceeded {
        /// The largest delay the server is willing to schedule.
        max_delay: Option<Duration>,
    },

    /// `M_UNRECOGNIZED`: the endpoint is not implemented by this server.
    #[error("endpoint not supported by the homeserver")]
    UnsupportedEndpoint,

    /// The request did not produce a usable response: connection reset,
    /// timeout below HTTP, or a 5xx from the server.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A locally applied deadline elapsed before the response arrived.
    #[error("local timeout elapsed")]
    LocalTimeout,

    /// Any other homeserver error. These are not retried.
    #[error(transparent)]
    Matrix(MatrixError),
}

impl RequestError {
    /// The backoff the server prescribed, if this is a rate limit error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Whether this is worth a retry after a short pause (connection
    /// failures, 5xx, local aborts).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::LocalTimeout)
    }
}

impl From<MatrixError> for RequestError {
    fn from(error: MatrixError) -> Self {
        match &error.kind {
            ErrorKind::LimitExceeded { retry_after } => Self::RateLimited {
                retry_after: *retry_after,
            },
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::Unrecognized => Self::UnsupportedEndpoint,
            ErrorKind::Unknown
                if error
                    .extension(MSC4140_ERRCODE)
                    .and_then(JsonValue::as_str)
                    == Some(MAX_DELAY_EXCEEDED) =>
            {
                Self::MaxDelayExceeded {
                    max_delay: error
                        .extension(MSC4140_MAX_DELAY)
                        .and_then(JsonValue::as_u64)
                        .map(Duration::from_millis),
                }
            }
            _ if error.is_server_failure() => Self::Connection(error.to_string()),
            _ => Self::Matrix(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches2::assert_matches;
    use calliope_core::MatrixError;
    use serde_json::json;

    use super::RequestError;

    #[test]
    fn classify_rate_limit() {
        let error = MatrixError::limit_exceeded(Some(Duration::from_secs(2)), "slow down");
        assert_matches!(RequestError::from(error), RequestError::RateLimited { retry_after });
        assert_eq!(retry_after, Some(Duration::from_secs(2)));
    }

    #[test]
    fn classify_not_found_and_unrecognized() {
        assert_matches!(
            RequestError::from(MatrixError::not_found("gone")),
            RequestError::NotFound
        );
        assert_matches!(
            RequestError::from(MatrixError::unrecognized("no such endpoint")),
            RequestError::UnsupportedEndpoint
        );
    }

    #[test]
    fn classify_max_delay_exceeded() {
        let error = MatrixError::unknown("the delay is too large")
            .with_extension("org.matrix.msc4140.errcode", json!("M_MAX_DELAY_EXCEEDED"))
            .with_extension("org.matrix.msc4140.max_delay", json!(10_000));

        assert_matches!(RequestError::from(error), RequestError::MaxDelayExceeded { max_delay });
        assert_eq!(max_delay, Some(Duration::from_millis(10_000)));
    }

    #[test]
    fn classify_server_failure_as_connection_error() {
        let error = MatrixError::unknown("upstream exploded")
            .with_status_code(http::StatusCode::BAD_GATEWAY);
        assert_matches!(RequestError::from(error), RequestError::Connection(_));
    }

    #[test]
    fn classify_everything_else_as_fatal() {
        let error = MatrixError::forbidden("not allowed to send state");
        assert_matches!(RequestError::from(error), RequestError::Matrix(_));
    }
}
