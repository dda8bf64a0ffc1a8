//! Matrix wire types shared by the calliope crates.
//!
//! This crate holds everything that crosses the client-server API boundary:
//! identifiers, timestamps, the standard error taxonomy and the MatrixRTC
//! event content types. The runtime lives in `calliope-rtc`.

#[macro_use]
extern crate tracing;

pub mod error;
pub mod events;
pub mod identifiers;
pub mod serde;
mod time;

pub use error::{ErrorKind, MatrixError};
pub use identifiers::*;
pub use time::UnixMillis;

use std::fmt;

pub type MatrixResult<T> = Result<T, MatrixError>;

/// Wrapper around `Box<str>` that cannot be used in a meaningful way outside
/// of this crate. Used for string enums because their `_Custom` variant
/// can't be truly private (only `#[doc(hidden)]`).
#[doc(hidden)]
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrivOwnedStr(pub(crate) Box<str>);

impl fmt::Debug for PrivOwnedStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
