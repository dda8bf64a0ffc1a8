//! Event content types.
//!
//! Only the events that cross this library's wire surface are modeled here:
//! the MatrixRTC member state event and the media key payloads.

pub mod call;
