//! MatrixRTC session membership and media key distribution.
//!
//! Two cooperating managers form this crate:
//!
//! * [`membership::MembershipManager`] publishes the local device's
//!   participation in a room-scoped RTC session as a state event, keeps it
//!   alive (periodic expiry extension, delayed-leave heartbeat) and tears it
//!   down on leave.
//! * [`encryption::EncryptionManager`] owns the outbound media key for the
//!   local sender, rotates and distributes it to the current set of
//!   co-participants over a pluggable [`transport::KeyTransport`], and
//!   ingests inbound keys from the other participants.
//!
//! The Matrix client API itself stays behind the [`client::MatrixRtcClient`]
//! adapter trait; the host application wires it to its HTTP stack and feeds
//! observed room state and to-device traffic back in.

#[macro_use]
extern crate tracing;

pub mod client;
pub mod config;
pub mod encryption;
pub mod membership;
pub mod participant;
mod scheduler;
pub mod transport;

pub use client::{MatrixRtcClient, RequestError, UpdateDelayedEventAction};
pub use config::{EncryptionConfig, MembershipConfig};
pub use encryption::{EncryptionManager, MediaKeySink};
pub use membership::{MembershipError, MembershipEvent, MembershipManager};
pub use participant::{ParticipantDevice, ParticipantId, SessionMember};
pub use scheduler::Status;
