//! The standard `errcode` taxonomy sent by homeservers.

use std::time::Duration;

use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::PrivOwnedStr;

/// An enum for the error kind.
///
/// Items may contain additional information. Only the kinds a client reacts
/// to carry their own variant; everything else is preserved through
/// `_Custom`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
// Please keep the variants sorted alphabetically.
pub enum ErrorKind {
    /// `M_BAD_JSON`
    ///
    /// The request contained valid JSON, but it was malformed in some way,
    /// e.g. missing required keys, invalid values for keys.
    BadJson,

    /// `M_FORBIDDEN`
    ///
    /// Forbidden access, e.g. sending state without permission.
    Forbidden,

    /// `M_LIMIT_EXCEEDED`
    ///
    /// The request has been refused due to [rate limiting]: too many
    /// requests have been sent in a short period of time.
    ///
    /// [rate limiting]: https://spec.matrix.org/latest/client-server-api/#rate-limiting
    LimitExceeded {
        /// How long a client should wait before they can try again.
        retry_after: Option<Duration>,
    },

    /// `M_MISSING_TOKEN`
    ///
    /// No access token was specified for the request, but one is required.
    MissingToken,

    /// `M_NOT_FOUND`
    ///
    /// No resource was found for this request.
    NotFound,

    /// `M_NOT_JSON`
    ///
    /// The request did not contain valid JSON.
    NotJson,

    /// `M_TOO_LARGE`
    ///
    /// The request or entity was too large.
    TooLarge,

    /// `M_UNAUTHORIZED`
    ///
    /// The request was not correctly authorized.
    Unauthorized,

    /// `M_UNKNOWN`
    ///
    /// An unknown error has occurred. Extension fields (for example the
    /// nested MSC4140 error code) stay available through
    /// [`MatrixError::extension`](super::MatrixError::extension).
    Unknown,

    /// `M_UNKNOWN_TOKEN`
    ///
    /// The access token specified was not recognized.
    UnknownToken {
        /// If this is `true`, the client is in a "[soft logout]" state, i.e.
        /// the server requires re-authentication but the session is not
        /// invalidated.
        ///
        /// [soft logout]: https://spec.matrix.org/latest/client-server-api/#soft-logout
        soft_logout: bool,
    },

    /// `M_UNRECOGNIZED`
    ///
    /// The server did not understand the request.
    ///
    /// This is expected to be returned with a 404 HTTP status code if the
    /// endpoint is not implemented (e.g. the delayed event endpoints on an
    /// older server).
    Unrecognized,

    /// `M_USER_DEACTIVATED`
    ///
    /// The user ID associated with the request has been deactivated.
    UserDeactivated,

    #[doc(hidden)]
    _Custom(PrivOwnedStr),
}

impl ErrorKind {
    /// The `errcode` string for this kind.
    pub fn errcode(&self) -> &str {
        match self {
            Self::BadJson => "M_BAD_JSON",
            Self::Forbidden => "M_FORBIDDEN",
            Self::LimitExceeded { .. } => "M_LIMIT_EXCEEDED",
            Self::MissingToken => "M_MISSING_TOKEN",
            Self::NotFound => "M_NOT_FOUND",
            Self::NotJson => "M_NOT_JSON",
            Self::TooLarge => "M_TOO_LARGE",
            Self::Unauthorized => "M_UNAUTHORIZED",
            Self::Unknown => "M_UNKNOWN",
            Self::UnknownToken { .. } => "M_UNKNOWN_TOKEN",
            Self::Unrecognized => "M_UNRECOGNIZED",
            Self::UserDeactivated => "M_USER_DEACTIVATED",
            Self::_Custom(code) => &code.0,
        }
    }

    /// Reconstructs an `ErrorKind` from an `errcode` and the accompanying
    /// response body, which may carry variant data (`retry_after_ms`,
    /// `soft_logout`).
    pub(super) fn from_parts(errcode: &str, body: &JsonMap<String, JsonValue>) -> Self {
        match errcode {
            "M_BAD_JSON" => Self::BadJson,
            "M_FORBIDDEN" => Self::Forbidden,
            "M_LIMIT_EXCEEDED" => Self::LimitExceeded {
                retry_after: body
                    .get("retry_after_ms")
                    .and_then(JsonValue::as_u64)
                    .map(Duration::from_millis),
            },
            "M_MISSING_TOKEN" => Self::MissingToken,
            "M_NOT_FOUND" => Self::NotFound,
            "M_NOT_JSON" => Self::NotJson,
            "M_TOO_LARGE" => Self::TooLarge,
            "M_UNAUTHORIZED" => Self::Unauthorized,
            "M_UNKNOWN" => Self::Unknown,
            "M_UNKNOWN_TOKEN" => Self::UnknownToken {
                soft_logout: body
                    .get("soft_logout")
                    .and_then(JsonValue::as_bool)
                    .unwrap_or_default(),
            },
            "M_UNRECOGNIZED" => Self::Unrecognized,
            "M_USER_DEACTIVATED" => Self::UserDeactivated,
            _ => Self::_Custom(PrivOwnedStr(errcode.into())),
        }
    }

    /// The variant data this kind contributes to a serialized error body.
    pub(super) fn extra_fields(&self) -> JsonMap<String, JsonValue> {
        let mut extra = JsonMap::new();
        match self {
            Self::LimitExceeded { retry_after: Some(duration) } => {
                extra.insert(
                    "retry_after_ms".to_owned(),
                    JsonValue::from(duration.as_millis() as u64),
                );
            }
            Self::UnknownToken { soft_logout: true } => {
                extra.insert("soft_logout".to_owned(), JsonValue::from(true));
            }
            _ => {}
        }
        extra
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.errcode())
    }
}
