//! Signaling wire protocol between peers and the relay server.
//!
//! Every frame is a JSON text message with a `type` discriminant. Inbound
//! frames are decoded into [`ClientMessage`] via [`decode`]; outbound frames
//! are built as [`ServerMessage`] values and serialized with
//! [`ServerMessage::to_json`].
//!
//! Relay payloads (offers, answers, candidates) are carried as
//! [`RawValue`] so the relay forwards the exact JSON text it received without
//! parsing its structure.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

/// Errors produced while decoding an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is not a decodable envelope or lacks a required field.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// The `type` discriminant is not one the relay understands.
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl ProtocolError {
    /// The wire error code reported back to the sender.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Malformed(_) => ErrorCode::MalformedMessage,
            Self::UnknownType(_) => ErrorCode::UnknownType,
        }
    }
}

/// Error codes carried by [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Undecodable envelope or missing required field.
    MalformedMessage,
    /// Unrecognized `type` discriminant.
    UnknownType,
    /// Registration refused because the id is in use.
    AlreadyTaken,
    /// Call target is not registered.
    PeerUnavailable,
    /// Call target (or caller) is not available for a new call.
    PeerBusy,
    /// Recipient absent or its connection is not writable.
    DeliveryFailed,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MalformedMessage => "malformed-message",
            Self::UnknownType => "unknown-type",
            Self::AlreadyTaken => "already-taken",
            Self::PeerUnavailable => "peer-unavailable",
            Self::PeerBusy => "peer-busy",
            Self::DeliveryFailed => "delivery-failed",
        };
        f.write_str(s)
    }
}

/// The three kinds of opaque negotiation payload the relay forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayKind {
    /// Session description offer.
    Offer,
    /// Session description answer.
    Answer,
    /// Connectivity candidate.
    Candidate,
}

impl RelayKind {
    /// The `type` discriminant used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
        }
    }
}

impl std::fmt::Display for RelayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded inbound frame.
///
/// `from` is whatever the client claimed. The relay ignores it for routing
/// and stamps outbound frames with the connection's registered id.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Client-supplied sender id, if any.
    pub from: Option<String>,
    /// The classified message.
    pub message: ClientMessage,
}

/// Messages a peer sends to the relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Claim a peer id for this connection.
    Register {
        /// Requested peer id.
        id: String,
    },
    /// Ask `to` to start a call.
    CallRequest {
        /// Callee id.
        to: String,
    },
    /// Accept the ringing call placed by `to`.
    CallAccept {
        /// Caller id.
        to: String,
    },
    /// Reject the ringing call placed by `to`.
    CallReject {
        /// Caller id.
        to: String,
    },
    /// Forward an opaque negotiation payload to `to`.
    Relay {
        /// Which negotiation step this payload belongs to.
        kind: RelayKind,
        /// Recipient id.
        to: String,
        /// Payload JSON text, forwarded verbatim.
        payload: Box<RawValue>,
    },
    /// Hang up any call with `to`.
    End {
        /// Counterpart id.
        to: String,
    },
    /// Keepalive probe.
    Heartbeat,
}

impl ClientMessage {
    /// The canonical `type` discriminant for this message.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::CallRequest { .. } => "call-request",
            Self::CallAccept { .. } => "call-accept",
            Self::CallReject { .. } => "call-reject",
            Self::Relay { kind, .. } => kind.as_str(),
            Self::End { .. } => "end",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Flat view of an inbound frame before it is classified.
#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    to: Option<String>,
    from: Option<String>,
    id: Option<String>,
    #[serde(
        default,
        alias = "offer",
        alias = "answer",
        alias = "candidate",
        deserialize_with = "present_raw"
    )]
    payload: Option<Box<RawValue>>,
}

/// Keeps an explicit `null` payload as `Some("null")` so only a missing
/// field counts as absent.
fn present_raw<'de, D>(deserializer: D) -> Result<Option<Box<RawValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

/// Decodes an inbound text frame.
///
/// Accepts the discriminants `register`, `call-request`, `call-accept`,
/// `call-reject`, `offer`, `answer`, `candidate`, `end` and `heartbeat`,
/// plus the older spellings `call-accepted`, `call-rejected`,
/// `ice-candidate`, `call-ended` and `ping`.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] if the text is not a JSON object,
/// has no `type`, or lacks a field the message type requires, and
/// [`ProtocolError::UnknownType`] for an unrecognized discriminant.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    let wire: WireEnvelope = serde_json::from_str(text)
        .map_err(|e| ProtocolError::Malformed(format!("invalid envelope: {e}")))?;

    let Some(kind) = wire.kind else {
        return Err(ProtocolError::Malformed("missing `type` field".to_string()));
    };

    let message = match kind.as_str() {
        "register" => ClientMessage::Register {
            id: required(wire.id, "id")?,
        },
        "call-request" => ClientMessage::CallRequest {
            to: required(wire.to, "to")?,
        },
        "call-accept" | "call-accepted" => ClientMessage::CallAccept {
            to: required(wire.to, "to")?,
        },
        "call-reject" | "call-rejected" => ClientMessage::CallReject {
            to: required(wire.to, "to")?,
        },
        "offer" => relay(RelayKind::Offer, wire.to, wire.payload)?,
        "answer" => relay(RelayKind::Answer, wire.to, wire.payload)?,
        "candidate" | "ice-candidate" => relay(RelayKind::Candidate, wire.to, wire.payload)?,
        "end" | "call-ended" => ClientMessage::End {
            to: required(wire.to, "to")?,
        },
        "heartbeat" | "ping" => ClientMessage::Heartbeat,
        _ => return Err(ProtocolError::UnknownType(kind)),
    };

    Ok(Envelope {
        from: wire.from,
        message,
    })
}

fn required(value: Option<String>, field: &str) -> Result<String, ProtocolError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        Some(_) => Err(ProtocolError::Malformed(format!("`{field}` must not be empty"))),
        None => Err(ProtocolError::Malformed(format!("missing `{field}` field"))),
    }
}

fn relay(
    kind: RelayKind,
    to: Option<String>,
    payload: Option<Box<RawValue>>,
) -> Result<ClientMessage, ProtocolError> {
    let to = required(to, "to")?;
    let payload = payload.ok_or_else(|| {
        ProtocolError::Malformed(format!("missing `payload` field on {kind} message"))
    })?;
    Ok(ClientMessage::Relay { kind, to, payload })
}

/// Why a call ended, when the relay (rather than the peer) ended it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// The counterpart's connection closed.
    UserDisconnected,
}

/// Messages the relay sends to a peer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Welcome frame sent as soon as the socket is upgraded.
    Connected {
        /// Human-readable greeting.
        message: String,
    },
    /// Registration succeeded.
    Registered {
        /// The registered id.
        id: String,
        /// Human-readable confirmation.
        message: String,
    },
    /// Roster of every registered peer id.
    UserList {
        /// Registered ids.
        users: Vec<String>,
    },
    /// Incoming call request.
    CallRequest {
        /// Caller id.
        from: String,
        /// Relay-generated call id.
        #[serde(rename = "callId")]
        call_id: String,
    },
    /// The callee accepted.
    CallAccept {
        /// Callee id.
        from: String,
        /// Accepted call id.
        #[serde(rename = "callId")]
        call_id: String,
    },
    /// The callee rejected.
    CallReject {
        /// Callee id.
        from: String,
        /// Rejected call id.
        #[serde(rename = "callId")]
        call_id: String,
    },
    /// Forwarded offer.
    Offer {
        /// Sender id.
        from: String,
        /// Recipient id.
        to: String,
        /// Verbatim payload.
        payload: Box<RawValue>,
    },
    /// Forwarded answer.
    Answer {
        /// Sender id.
        from: String,
        /// Recipient id.
        to: String,
        /// Verbatim payload.
        payload: Box<RawValue>,
    },
    /// Forwarded candidate.
    Candidate {
        /// Sender id.
        from: String,
        /// Recipient id.
        to: String,
        /// Verbatim payload.
        payload: Box<RawValue>,
    },
    /// The counterpart hung up (or went away).
    End {
        /// Counterpart id.
        from: String,
        /// Set when the relay ended the call on the counterpart's behalf.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<EndReason>,
    },
    /// A request from this peer failed.
    Error {
        /// Machine-readable error code.
        code: ErrorCode,
        /// Human-readable description.
        message: String,
        /// Intended recipient, for delivery failures.
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    /// Reply to a heartbeat.
    HeartbeatAck,
}

impl ServerMessage {
    /// Builds an error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            to: None,
        }
    }

    /// Builds a [`ErrorCode::DeliveryFailed`] reply naming the recipient.
    #[must_use]
    pub fn delivery_failed(kind: RelayKind, to: &str) -> Self {
        Self::Error {
            code: ErrorCode::DeliveryFailed,
            message: format!("failed to deliver {kind} to {to}: peer not available"),
            to: Some(to.to_string()),
        }
    }

    /// Builds the forwarded form of a relay payload.
    #[must_use]
    pub fn relay(kind: RelayKind, from: String, to: String, payload: Box<RawValue>) -> Self {
        match kind {
            RelayKind::Offer => Self::Offer { from, to, payload },
            RelayKind::Answer => Self::Answer { from, to, payload },
            RelayKind::Candidate => Self::Candidate { from, to, payload },
        }
    }

    /// Serializes to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; with the types used here this only
    /// happens on allocation failure.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
