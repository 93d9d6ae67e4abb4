//! Per-connection message routing.
//!
//! Decodes each inbound text frame, enforces the registration rules, and
//! dispatches to the [`Switchboard`] or straight to the recipient's queue
//! for relayed payloads. Everything here is synchronous. Notifications from
//! a switchboard operation are queued while its lock is still held; queueing
//! never waits, so the critical section stays short. Relayed payloads are
//! encoded and queued after the lock is released.

use callrelay_proto::signal::{self, ClientMessage};
use callrelay_proto::{ErrorCode, RelayKind, ServerMessage};
use serde_json::value::RawValue;
use tokio::time::Instant;

use crate::registry::PeerHandle;
use crate::relay::RelayState;
use crate::switchboard::{Delivery, Switchboard, deliver_all};

/// Routing state of one WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    conn_id: u64,
    handle: PeerHandle,
    peer_id: Option<String>,
}

impl Connection {
    /// A fresh, unregistered connection writing to `handle`.
    #[must_use]
    pub const fn new(handle: PeerHandle) -> Self {
        Self {
            conn_id: handle.conn_id(),
            handle,
            peer_id: None,
        }
    }

    /// The id this connection registered, if any.
    #[must_use]
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    /// Queues a reply to this connection, logging if it cannot be queued.
    pub fn reply(&self, msg: &ServerMessage) {
        if let Err(e) = self.handle.try_deliver(msg) {
            tracing::warn!(
                conn_id = self.conn_id,
                peer_id = ?self.peer_id,
                error = %e,
                "failed to queue reply"
            );
        }
    }

    fn reply_error(&self, code: ErrorCode, message: impl Into<String>) {
        self.reply(&ServerMessage::error(code, message));
    }
}

/// Handles one inbound text frame.
pub fn handle_text(conn: &mut Connection, text: &str, state: &RelayState) {
    if text.len() > state.max_message_size {
        tracing::warn!(
            conn_id = conn.conn_id,
            size = text.len(),
            max = state.max_message_size,
            "oversized message rejected"
        );
        conn.reply_error(
            ErrorCode::MalformedMessage,
            format!("message exceeds {} bytes", state.max_message_size),
        );
        return;
    }

    let envelope = match signal::decode(text) {
        Ok(env) => env,
        Err(e) => {
            tracing::warn!(conn_id = conn.conn_id, peer_id = ?conn.peer_id, error = %e, "rejected frame");
            conn.reply_error(e.code(), e.to_string());
            return;
        }
    };

    match envelope.message {
        ClientMessage::Heartbeat => conn.reply(&ServerMessage::HeartbeatAck),
        ClientMessage::Register { id } => register(conn, &id, state),
        message => {
            let Some(me) = conn.peer_id.clone() else {
                tracing::debug!(conn_id = conn.conn_id, kind = message.kind(), "message before register");
                conn.reply_error(
                    ErrorCode::MalformedMessage,
                    format!("register before sending {}", message.kind()),
                );
                return;
            };
            if let Some(claimed) = envelope.from.as_deref()
                && claimed != me
            {
                tracing::warn!(peer_id = %me, claimed = %claimed, "ignoring spoofed sender id");
            }
            dispatch(conn, &me, message, state);
        }
    }
}

/// Handles a binary frame, which the protocol does not use.
pub fn handle_binary(conn: &Connection) {
    tracing::debug!(conn_id = conn.conn_id, "binary frame rejected");
    conn.reply_error(
        ErrorCode::MalformedMessage,
        "binary frames are not supported",
    );
}

/// Runs the disconnect path for a closed connection.
pub fn close(conn: &Connection, state: &RelayState) {
    let Some(id) = conn.peer_id.as_deref() else {
        tracing::debug!(conn_id = conn.conn_id, "unregistered connection closed");
        return;
    };
    apply(state, |board| board.disconnect(id, Some(conn.conn_id)));
}

/// Runs one switchboard operation and queues its notifications before the
/// lock is released, so every peer receives notifications in the order the
/// operations happened.
fn apply(state: &RelayState, op: impl FnOnce(&mut Switchboard) -> Vec<Delivery>) {
    let mut board = state.switchboard.lock();
    let out = op(&mut board);
    deliver_all(out);
}

fn register(conn: &mut Connection, id: &str, state: &RelayState) {
    if let Some(current) = conn.peer_id.as_deref() {
        tracing::warn!(peer_id = %current, requested = %id, "connection tried to register twice");
        conn.reply_error(
            ErrorCode::AlreadyTaken,
            format!("connection already registered as {current}"),
        );
        return;
    }

    let mut board = state.switchboard.lock();
    let result = board.register(id, conn.handle.clone(), chrono::Utc::now());
    match result {
        Ok(out) => {
            deliver_all(out);
            drop(board);
            conn.peer_id = Some(id.to_string());
        }
        Err(e) => {
            drop(board);
            tracing::warn!(conn_id = conn.conn_id, peer_id = %id, error = %e, "registration refused");
            conn.reply_error(e.code(), e.to_string());
        }
    }
}

fn dispatch(conn: &Connection, me: &str, message: ClientMessage, state: &RelayState) {
    match message {
        ClientMessage::CallRequest { to } => {
            let mut board = state.switchboard.lock();
            let result = board.request_call(me, &to, Instant::now());
            match result {
                Ok((_, out)) => deliver_all(out),
                Err(e) => {
                    drop(board);
                    tracing::debug!(caller = %me, callee = %to, error = %e, "call request refused");
                    conn.reply_error(e.code(), e.to_string());
                }
            }
        }
        ClientMessage::CallAccept { to } => apply(state, |board| board.accept_call(me, &to)),
        ClientMessage::CallReject { to } => apply(state, |board| board.reject_call(me, &to)),
        ClientMessage::End { to } => apply(state, |board| board.end_call(me, &to)),
        ClientMessage::Relay { kind, to, payload } => relay(conn, me, kind, to, payload, state),
        ClientMessage::Register { .. } | ClientMessage::Heartbeat => {}
    }
}

fn relay(
    conn: &Connection,
    me: &str,
    kind: RelayKind,
    to: String,
    payload: Box<RawValue>,
    state: &RelayState,
) {
    let target = state.switchboard.lock().relay_target(&to);
    let Some(target) = target else {
        tracing::debug!(from = %me, to = %to, kind = %kind, "relay target not registered");
        conn.reply(&ServerMessage::delivery_failed(kind, &to));
        return;
    };

    let forwarded = ServerMessage::relay(kind, me.to_string(), to.clone(), payload);
    match target.try_deliver(&forwarded) {
        Ok(()) => tracing::trace!(from = %me, to = %to, kind = %kind, "relayed"),
        Err(e) => {
            tracing::warn!(from = %me, to = %to, kind = %kind, error = %e, "relay delivery failed");
            conn.reply(&ServerMessage::delivery_failed(kind, &to));
        }
    }
}
