//! Call table: in-progress call negotiations between pairs of peers.
//!
//! Calls reference peers by id only; removing a peer does not remove its
//! calls by itself, so the switchboard cascades that cleanup. Lookups by
//! peer pair scan the table. A relay only tracks a handful of live calls
//! per peer set, so no secondary index is kept.

use std::collections::HashMap;
use std::time::Duration;

use callrelay_proto::{CallStatus, ErrorCode, PeerStatus};
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// A tracked call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Relay-generated call id.
    pub id: String,
    /// Peer that placed the call.
    pub caller_id: String,
    /// Peer that was called.
    pub callee_id: String,
    /// Negotiation status.
    pub status: CallStatus,
    /// Monotonic start time, used for TTL eviction.
    pub started_at: Instant,
    /// Wall-clock start time, for display.
    pub started_at_utc: DateTime<Utc>,
}

impl CallRecord {
    /// Whether `peer` is the caller or the callee.
    #[must_use]
    pub fn involves(&self, peer: &str) -> bool {
        self.caller_id == peer || self.callee_id == peer
    }

    /// Whether this call is between `a` and `b`, in either direction.
    #[must_use]
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.caller_id == a && self.callee_id == b) || (self.caller_id == b && self.callee_id == a)
    }

    /// The other party of the call, if `peer` is one of its parties.
    #[must_use]
    pub fn counterpart(&self, peer: &str) -> Option<&str> {
        if self.caller_id == peer {
            Some(&self.callee_id)
        } else if self.callee_id == peer {
            Some(&self.caller_id)
        } else {
            None
        }
    }

    /// Whether the call is older than `ttl` at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.started_at) > ttl
    }
}

/// Reasons a call request is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The target is not registered (or is the caller itself).
    #[error("{0}")]
    PeerUnavailable(String),
    /// A party is already part of another call.
    #[error("peer {peer} is busy ({status})")]
    PeerBusy {
        /// The busy peer.
        peer: String,
        /// Its current status.
        status: PeerStatus,
    },
}

impl CallError {
    /// The wire error code reported back to the caller.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::PeerUnavailable(_) => ErrorCode::PeerUnavailable,
            Self::PeerBusy { .. } => ErrorCode::PeerBusy,
        }
    }
}

/// Active calls keyed by call id.
#[derive(Debug, Default)]
pub struct CallTable {
    calls: HashMap<String, CallRecord>,
}

impl CallTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new ringing call and returns it.
    pub fn create(&mut self, caller: &str, callee: &str, now: Instant) -> &CallRecord {
        let id = loop {
            let candidate = uuid::Uuid::now_v7().to_string();
            if !self.calls.contains_key(&candidate) {
                break candidate;
            }
        };
        self.calls.entry(id.clone()).or_insert(CallRecord {
            id,
            caller_id: caller.to_string(),
            callee_id: callee.to_string(),
            status: CallStatus::Ringing,
            started_at: now,
            started_at_utc: Utc::now(),
        })
    }

    /// The ringing call placed by `caller` to `callee`, if any.
    pub fn ringing_mut(&mut self, caller: &str, callee: &str) -> Option<&mut CallRecord> {
        self.calls.values_mut().find(|c| {
            c.status == CallStatus::Ringing && c.caller_id == caller && c.callee_id == callee
        })
    }

    /// Removes the ringing call placed by `caller` to `callee`, if any.
    pub fn remove_ringing(&mut self, caller: &str, callee: &str) -> Option<CallRecord> {
        let id = self.ringing_mut(caller, callee)?.id.clone();
        self.calls.remove(&id)
    }

    /// Removes every call between `a` and `b`, regardless of status.
    pub fn remove_between(&mut self, a: &str, b: &str) -> Vec<CallRecord> {
        self.remove_where(|c| c.is_between(a, b))
    }

    /// Removes every call involving `peer`.
    pub fn remove_involving(&mut self, peer: &str) -> Vec<CallRecord> {
        self.remove_where(|c| c.involves(peer))
    }

    /// Removes every call older than `ttl` at `now`.
    pub fn remove_expired(&mut self, now: Instant, ttl: Duration) -> Vec<CallRecord> {
        self.remove_where(|c| c.is_expired(now, ttl))
    }

    /// Whether `peer` is part of any tracked call.
    #[must_use]
    pub fn has_active(&self, peer: &str) -> bool {
        self.calls.values().any(|c| c.involves(peer))
    }

    /// Looks up a call by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&CallRecord> {
        self.calls.get(id)
    }

    /// Iterates over every tracked call.
    pub fn iter(&self) -> impl Iterator<Item = &CallRecord> {
        self.calls.values()
    }

    /// Number of tracked calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no call is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn remove_where(&mut self, pred: impl Fn(&CallRecord) -> bool) -> Vec<CallRecord> {
        let ids: Vec<String> = self
            .calls
            .values()
            .filter(|c| pred(c))
            .map(|c| c.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.calls.remove(id)).collect()
    }
}
