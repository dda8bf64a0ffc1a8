//! Errors that can be sent from the homeserver.

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

mod kind;
pub use kind::*;

/// A Matrix error parsed out of a homeserver response.
#[derive(Debug, Clone)]
pub struct MatrixError {
    /// The http status code, when the error came off the wire.
    pub status_code: Option<http::StatusCode>,

    /// The parsed `errcode`.
    pub kind: ErrorKind,

    /// The human readable `error` message.
    pub message: String,

    /// The full response body, kept around for extension fields.
    body: JsonMap<String, JsonValue>,
}

macro_rules! simple_kind_fns {
    ($($fname:ident, $kind:ident;)+) => {
        $(
            /// Create a new `MatrixError` of this kind.
            pub fn $fname(message: impl Into<String>) -> Self {
                Self::new(ErrorKind::$kind, message)
            }
        )+
    }
}

impl MatrixError {
    /// Create a new `MatrixError` with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status_code: None,
            kind,
            message: message.into(),
            body: JsonMap::new(),
        }
    }

    simple_kind_fns! {
        forbidden, Forbidden;
        bad_json, BadJson;
        not_found, NotFound;
        unknown, Unknown;
        unrecognized, Unrecognized;
    }

    pub fn limit_exceeded(
        retry_after: Option<std::time::Duration>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::LimitExceeded { retry_after }, message)
    }

    /// Attach the given HTTP status code.
    pub fn with_status_code(mut self, status_code: http::StatusCode) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Attach an extension field to the error body.
    pub fn with_extension(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.body.insert(key.into(), value);
        self
    }

    /// Parses a `MatrixError` out of a response body, attaching the HTTP
    /// status code if known.
    ///
    /// A body that is not a JSON object (or carries no `errcode`) yields
    /// [`ErrorKind::Unknown`] with the raw body preserved in the message.
    pub fn from_json(status_code: Option<http::StatusCode>, body: JsonValue) -> Self {
        let JsonValue::Object(body) = body else {
            return Self {
                status_code,
                kind: ErrorKind::Unknown,
                message: body.to_string(),
                body: JsonMap::new(),
            };
        };

        let kind = match body.get("errcode").and_then(JsonValue::as_str) {
            Some(errcode) => ErrorKind::from_parts(errcode, &body),
            None => ErrorKind::Unknown,
        };
        let message = body
            .get("error")
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_owned();

        Self { status_code, kind, message, body }
    }

    /// Access an extension field of the error body, e.g. the
    /// `org.matrix.msc4140.errcode` carried inside an `M_UNKNOWN` error.
    pub fn extension(&self, key: &str) -> Option<&JsonValue> {
        self.body.get(key)
    }

    /// Whether the HTTP status code indicates a server side failure (5xx).
    pub fn is_server_failure(&self) -> bool {
        self.status_code.is_some_and(|code| code.is_server_error())
    }
}

impl Serialize for MatrixError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut body = self.body.clone();
        body.insert("errcode".to_owned(), self.kind.errcode().into());
        if !self.message.is_empty() {
            body.insert("error".to_owned(), self.message.clone().into());
        }
        for (key, value) in self.kind.extra_fields() {
            body.insert(key, value);
        }
        body.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MatrixError {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let body = JsonValue::deserialize(deserializer)?;
        Ok(Self::from_json(None, body))
    }
}

impl fmt::Display for MatrixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self
            .status_code
            .unwrap_or(http::StatusCode::BAD_REQUEST)
            .as_u16();
        write!(f, "[{code} / {}] {}", self.kind, self.message)
    }
}

impl StdError for MatrixError {}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches2::assert_matches;
    use serde_json::json;

    use super::{ErrorKind, MatrixError};

    #[test]
    fn deserialize_forbidden() {
        let deserialized = MatrixError::from_json(
            None,
            json!({
                "errcode": "M_FORBIDDEN",
                "error": "You are not authorized to send state in this room.",
            }),
        );

        assert_eq!(deserialized.kind, ErrorKind::Forbidden);
        assert_eq!(
            deserialized.message,
            "You are not authorized to send state in this room."
        );
    }

    #[test]
    fn deserialize_limit_exceeded() {
        let deserialized = MatrixError::from_json(
            Some(http::StatusCode::TOO_MANY_REQUESTS),
            json!({
                "errcode": "M_LIMIT_EXCEEDED",
                "error": "Too many requests",
                "retry_after_ms": 2600,
            }),
        );

        assert_matches!(deserialized.kind, ErrorKind::LimitExceeded { retry_after });
        assert_eq!(retry_after, Some(Duration::from_millis(2600)));
    }

    #[test]
    fn deserialize_unknown_with_extensions() {
        let deserialized = MatrixError::from_json(
            Some(http::StatusCode::BAD_REQUEST),
            json!({
                "errcode": "M_UNKNOWN",
                "error": "The requested delay exceeds the allowed maximum.",
                "org.matrix.msc4140.errcode": "M_MAX_DELAY_EXCEEDED",
                "org.matrix.msc4140.max_delay": 10_000,
            }),
        );

        assert_eq!(deserialized.kind, ErrorKind::Unknown);
        assert_eq!(
            deserialized
                .extension("org.matrix.msc4140.errcode")
                .and_then(|v| v.as_str()),
            Some("M_MAX_DELAY_EXCEEDED")
        );
        assert_eq!(
            deserialized
                .extension("org.matrix.msc4140.max_delay")
                .and_then(|v| v.as_u64()),
            Some(10_000)
        );
    }

    #[test]
    fn custom_errcode_round_trips() {
        let deserialized = MatrixError::from_json(
            None,
            json!({ "errcode": "ORG_EXAMPLE_WEIRD", "error": "?" }),
        );
        assert_eq!(deserialized.kind.errcode(), "ORG_EXAMPLE_WEIRD");

        let serialized = serde_json::to_value(&deserialized).unwrap();
        assert_eq!(serialized["errcode"], "ORG_EXAMPLE_WEIRD");
    }

    #[test]
    fn serialize_includes_variant_fields() {
        let error =
            MatrixError::limit_exceeded(Some(Duration::from_millis(1200)), "slow down");
        let serialized = serde_json::to_value(&error).unwrap();
        assert_eq!(
            serialized,
            json!({
                "errcode": "M_LIMIT_EXCEEDED",
                "error": "slow down",
                "retry_after_ms": 1200,
            })
        );
    }
}
