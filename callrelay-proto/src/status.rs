//! Status types for registered peers and tracked calls.

use serde::{Deserialize, Serialize};

/// Call-availability status of a registered peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerStatus {
    /// Idle and able to receive a call request.
    Available,
    /// Placed a call request that has not been answered yet.
    Calling,
    /// Received a call request that has not been answered yet.
    Ringing,
    /// Party to an accepted call.
    InCall,
}

impl PeerStatus {
    /// Whether a new call request may be placed to or from this peer.
    #[must_use]
    pub const fn is_available(self) -> bool {
        matches!(self, Self::Available)
    }
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Calling => write!(f, "calling"),
            Self::Ringing => write!(f, "ringing"),
            Self::InCall => write!(f, "in-call"),
        }
    }
}

/// Negotiation status of a call tracked by the relay.
///
/// Rejected and ended calls are removed from the call table rather than
/// kept in a terminal state, so only the two live states exist here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    /// Requested by the caller, waiting for the callee to answer.
    Ringing,
    /// Accepted by the callee.
    Accepted,
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ringing => write!(f, "ringing"),
            Self::Accepted => write!(f, "accepted"),
        }
    }
}
