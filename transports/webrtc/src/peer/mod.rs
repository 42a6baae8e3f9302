//! Per-peer state
//!
//! Connection records and lifecycle phases, the registry that owns them,
//! candidate buffers and disconnect grace timers.

pub mod candidates;
pub mod connection;
pub mod lifecycle;
pub mod manager;

pub use candidates::{CandidateBuffer, FlushStart};
pub use connection::{NegotiationKind, NegotiationSide, PeerPhase};
pub use lifecycle::{DisconnectTimers, TimerState};
pub use manager::PeerInfo;

pub(crate) use connection::PeerEntry;
pub(crate) use manager::PeerRegistry;
