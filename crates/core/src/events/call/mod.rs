//! Types for events in the `m.call` namespace.

pub mod encryption_keys;
pub mod member;
