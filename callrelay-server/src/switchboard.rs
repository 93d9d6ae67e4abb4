//! Switchboard: the peer registry and call table as one serialized unit.
//!
//! Every public method is one logical operation and runs entirely under
//! the caller's lock on the switchboard. Methods never perform I/O. They
//! return the [`Delivery`] list the operation produced, which the caller
//! hands to [`deliver_all`] before releasing the lock. That keeps each
//! peer's queue in operation order, so a later roster can never be
//! overtaken by an earlier one.

use std::time::Duration;

use callrelay_proto::{CallStatus, EndReason, PeerStatus, ServerMessage};
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::calls::{CallError, CallTable};
use crate::registry::{PeerHandle, PeerRegistry, RegistryError};

/// A message queued for one peer by a switchboard operation.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Recipient id, for logging.
    pub peer_id: String,
    /// Recipient's outbound queue.
    pub handle: PeerHandle,
    /// The message to send.
    pub message: ServerMessage,
}

/// Sends each delivery without waiting; failures are logged and dropped.
pub fn deliver_all(deliveries: Vec<Delivery>) {
    for d in deliveries {
        if let Err(e) = d.handle.try_deliver(&d.message) {
            tracing::warn!(
                peer_id = %d.peer_id,
                error = %e,
                "dropping notification"
            );
        }
    }
}

/// Outcome of one reaper pass.
#[derive(Debug, Default)]
pub struct ReapReport {
    /// Peers removed because their connection closed.
    pub evicted_peers: Vec<String>,
    /// Calls removed because they outlived the TTL.
    pub expired_calls: Vec<String>,
    /// Notifications produced by the evictions.
    pub deliveries: Vec<Delivery>,
}

impl ReapReport {
    /// Whether the pass reclaimed anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.evicted_peers.is_empty() && self.expired_calls.is_empty()
    }
}

/// Owner of all mutable relay state.
#[derive(Debug, Default)]
pub struct Switchboard {
    peers: PeerRegistry,
    calls: CallTable,
}

impl Switchboard {
    /// Creates an empty switchboard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access to the peer registry.
    #[must_use]
    pub const fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    /// Read access to the call table.
    #[must_use]
    pub const fn calls(&self) -> &CallTable {
        &self.calls
    }

    /// Registers `id` for the connection behind `handle`.
    ///
    /// On success the new peer gets a `registered` ack followed by the
    /// roster, and every other peer gets the updated roster.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyTaken`] if `id` is in use.
    pub fn register(
        &mut self,
        id: &str,
        handle: PeerHandle,
        joined_at: DateTime<Utc>,
    ) -> Result<Vec<Delivery>, RegistryError> {
        self.peers.register(id, handle.clone(), joined_at)?;
        tracing::info!(peer_id = %id, "peer registered");

        let mut out = vec![Delivery {
            peer_id: id.to_string(),
            handle,
            message: ServerMessage::Registered {
                id: id.to_string(),
                message: format!("Successfully registered as {id}"),
            },
        }];
        out.extend(self.roster_broadcast());
        Ok(out)
    }

    /// Places a call from `caller` to `callee`.
    ///
    /// Returns the new call id and the `call-request` notification for the
    /// callee.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::PeerUnavailable`] if either party is unknown or
    /// the caller targets itself, and [`CallError::PeerBusy`] if either
    /// party is not `available`. Nothing is mutated on error.
    pub fn request_call(
        &mut self,
        caller: &str,
        callee: &str,
        now: Instant,
    ) -> Result<(String, Vec<Delivery>), CallError> {
        if caller == callee {
            return Err(CallError::PeerUnavailable("cannot call yourself".to_string()));
        }
        let callee_entry = self
            .peers
            .lookup(callee)
            .map_err(|_| CallError::PeerUnavailable(format!("peer {callee} not found or offline")))?;
        let caller_entry = self
            .peers
            .lookup(caller)
            .map_err(|_| CallError::PeerUnavailable(format!("peer {caller} is not registered")))?;

        if !callee_entry.status.is_available() {
            return Err(CallError::PeerBusy {
                peer: callee.to_string(),
                status: callee_entry.status,
            });
        }
        if !caller_entry.status.is_available() {
            return Err(CallError::PeerBusy {
                peer: caller.to_string(),
                status: caller_entry.status,
            });
        }
        let callee_handle = callee_entry.handle.clone();

        let call_id = self.calls.create(caller, callee, now).id.clone();
        self.peers.set_status(caller, PeerStatus::Calling);
        self.peers.set_status(callee, PeerStatus::Ringing);
        tracing::info!(call_id = %call_id, caller = %caller, callee = %callee, "call requested");

        let notify = Delivery {
            peer_id: callee.to_string(),
            handle: callee_handle,
            message: ServerMessage::CallRequest {
                from: caller.to_string(),
                call_id: call_id.clone(),
            },
        };
        Ok((call_id, vec![notify]))
    }

    /// `callee` accepts the ringing call placed by `caller`.
    ///
    /// A missing ringing call (stale or duplicate accept) is ignored.
    pub fn accept_call(&mut self, callee: &str, caller: &str) -> Vec<Delivery> {
        let Some(call) = self.calls.ringing_mut(caller, callee) else {
            tracing::debug!(caller = %caller, callee = %callee, "ignoring accept without ringing call");
            return Vec::new();
        };
        call.status = CallStatus::Accepted;
        let call_id = call.id.clone();

        self.peers.set_status(caller, PeerStatus::InCall);
        self.peers.set_status(callee, PeerStatus::InCall);
        tracing::info!(call_id = %call_id, caller = %caller, callee = %callee, "call accepted");

        self.notify(
            caller,
            ServerMessage::CallAccept {
                from: callee.to_string(),
                call_id,
            },
        )
        .into_iter()
        .collect()
    }

    /// `callee` rejects the ringing call placed by `caller`.
    ///
    /// A missing ringing call is a no-op.
    pub fn reject_call(&mut self, callee: &str, caller: &str) -> Vec<Delivery> {
        let Some(call) = self.calls.remove_ringing(caller, callee) else {
            tracing::debug!(caller = %caller, callee = %callee, "ignoring reject without ringing call");
            return Vec::new();
        };
        self.settle(caller);
        self.settle(callee);
        tracing::info!(call_id = %call.id, caller = %caller, callee = %callee, "call rejected");

        self.notify(
            caller,
            ServerMessage::CallReject {
                from: callee.to_string(),
                call_id: call.id,
            },
        )
        .into_iter()
        .collect()
    }

    /// `from` hangs up on `to`.
    ///
    /// Removes any call between the two, resets both to `available`, and
    /// forwards `end` to `to` whether or not a call existed. A repeated
    /// `end` for the same pair is forwarded again on purpose: state is left
    /// unchanged, and the counterpart may have missed the first one.
    pub fn end_call(&mut self, from: &str, to: &str) -> Vec<Delivery> {
        let removed = self.calls.remove_between(from, to);
        for call in &removed {
            tracing::info!(call_id = %call.id, from = %from, to = %to, "call ended");
        }
        if removed.is_empty() {
            tracing::debug!(from = %from, to = %to, "end without tracked call");
        }
        self.settle(from);
        self.settle(to);

        self.notify(
            to,
            ServerMessage::End {
                from: from.to_string(),
                reason: None,
            },
        )
        .into_iter()
        .collect()
    }

    /// Removes `id` after its connection closed, ending its calls and
    /// broadcasting the new roster.
    ///
    /// With `conn_id` set, nothing happens unless the registered entry
    /// belongs to that connection, so a stale close cannot evict a peer
    /// that re-registered on a new connection.
    pub fn disconnect(&mut self, id: &str, conn_id: Option<u64>) -> Vec<Delivery> {
        let Some(mut out) = self.evict(id, conn_id) else {
            return Vec::new();
        };
        out.extend(self.roster_broadcast());
        out
    }

    /// Runs one reaper pass at `now`.
    ///
    /// Dead peers go through the disconnect path; calls older than `ttl`
    /// are dropped and their parties reset. The roster is broadcast once if
    /// any peer was evicted.
    pub fn reap(&mut self, now: Instant, ttl: Duration) -> ReapReport {
        let mut report = ReapReport::default();

        for id in self.peers.dead_peers() {
            if let Some(ends) = self.evict(&id, None) {
                report.deliveries.extend(ends);
                report.evicted_peers.push(id);
            }
        }

        for call in self.calls.remove_expired(now, ttl) {
            self.settle(&call.caller_id);
            self.settle(&call.callee_id);
            tracing::debug!(
                call_id = %call.id,
                caller = %call.caller_id,
                callee = %call.callee_id,
                "expired call removed"
            );
            report.expired_calls.push(call.id);
        }

        if !report.evicted_peers.is_empty() {
            report.deliveries.extend(self.roster_broadcast());
        }
        report
    }

    /// Recipient handle for a relayed payload, if `to` is registered.
    #[must_use]
    pub fn relay_target(&self, to: &str) -> Option<PeerHandle> {
        self.peers.lookup(to).ok().map(|p| p.handle.clone())
    }

    /// Handles of every registered peer, for shutdown.
    #[must_use]
    pub fn handles(&self) -> Vec<(String, PeerHandle)> {
        self.peers
            .entries()
            .map(|p| (p.id.clone(), p.handle.clone()))
            .collect()
    }

    /// Core of the disconnect path, without the roster broadcast.
    ///
    /// Returns the `end` notifications for the counterparts, or `None` if
    /// the peer is absent or registered on a different connection.
    fn evict(&mut self, id: &str, conn_id: Option<u64>) -> Option<Vec<Delivery>> {
        let entry = self.peers.lookup(id).ok()?;
        if conn_id.is_some_and(|c| c != entry.handle.conn_id()) {
            tracing::debug!(peer_id = %id, "stale connection closed, keeping newer registration");
            return None;
        }

        let mut out = Vec::new();
        for call in self.calls.remove_involving(id) {
            let Some(other) = call.counterpart(id) else {
                continue;
            };
            tracing::info!(call_id = %call.id, peer_id = %id, counterpart = %other, "call ended by disconnect");
            self.settle(other);
            out.extend(self.notify(
                other,
                ServerMessage::End {
                    from: id.to_string(),
                    reason: Some(EndReason::UserDisconnected),
                },
            ));
        }

        self.peers.remove(id);
        tracing::info!(peer_id = %id, "peer unregistered");
        Some(out)
    }

    /// Resets `id` to `available` unless it is still part of a call.
    fn settle(&mut self, id: &str) {
        if !self.calls.has_active(id) {
            self.peers.set_status(id, PeerStatus::Available);
        }
    }

    fn notify(&self, to: &str, message: ServerMessage) -> Option<Delivery> {
        let peer = self.peers.lookup(to).ok()?;
        Some(Delivery {
            peer_id: peer.id.clone(),
            handle: peer.handle.clone(),
            message,
        })
    }

    fn roster_broadcast(&self) -> Vec<Delivery> {
        let users = self.peers.snapshot();
        self.peers
            .entries()
            .map(|p| Delivery {
                peer_id: p.id.clone(),
                handle: p.handle.clone(),
                message: ServerMessage::UserList {
                    users: users.clone(),
                },
            })
            .collect()
    }
}
