//! callrelay server library.
//!
//! Exposes the signaling relay for use in tests and embedding. The relay
//! accepts WebSocket connections, registers peers by id, tracks two-party
//! call negotiations, and forwards opaque offer/answer/candidate payloads
//! between registered peers.

pub mod api;
pub mod calls;
pub mod config;
pub mod reaper;
pub mod registry;
pub mod relay;
pub mod router;
pub mod switchboard;
