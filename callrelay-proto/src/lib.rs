//! Shared protocol definitions for the callrelay signaling wire format.

pub mod signal;
pub mod status;

pub use signal::{ClientMessage, EndReason, Envelope, ErrorCode, ProtocolError, RelayKind, ServerMessage};
pub use status::{CallStatus, PeerStatus};
