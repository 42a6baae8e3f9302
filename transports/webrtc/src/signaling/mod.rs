//! Signaling message types
//!
//! The relay that carries these messages between participants lives
//! outside this crate; decoded messages are handed to
//! [`CallHandle::handle_signal`](crate::session::CallHandle::handle_signal).

pub mod protocol;

pub use protocol::SignalingMessage;
