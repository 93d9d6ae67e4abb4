//! Read-only JSON views of relay state.
//!
//! Each handler takes the switchboard lock once, copies what it needs into
//! a serializable view, and releases the lock before responding.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use callrelay_proto::{CallStatus, PeerStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::relay::RelayState;

/// Body of `GET /`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexView {
    /// Service banner.
    pub message: String,
    /// Always `"running"`.
    pub status: &'static str,
    /// Response time, RFC 3339.
    pub timestamp: String,
    /// Registered peer count.
    pub connected_peers: usize,
    /// Tracked call count.
    pub active_calls: usize,
}

/// One entry of `GET /peers`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerView {
    /// Peer id.
    pub id: String,
    /// Current call status.
    pub status: PeerStatus,
    /// Registration time, RFC 3339.
    pub joined_at: String,
}

/// Body of `GET /peers`.
#[derive(Debug, Serialize)]
pub struct PeersView {
    /// Registered peers, sorted by id.
    pub peers: Vec<PeerView>,
    /// Number of peers.
    pub count: usize,
}

/// One entry of `GET /calls`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallView {
    /// Call id.
    pub id: String,
    /// Caller id.
    pub caller_id: String,
    /// Callee id.
    pub callee_id: String,
    /// Negotiation status.
    pub status: CallStatus,
    /// Start time, RFC 3339.
    pub started_at: String,
}

/// Body of `GET /calls`.
#[derive(Debug, Serialize)]
pub struct CallsView {
    /// Tracked calls, oldest first.
    pub calls: Vec<CallView>,
    /// Number of calls.
    pub count: usize,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthView {
    /// Always `"ok"`.
    pub status: &'static str,
    /// Seconds since the relay started.
    pub uptime_secs: u64,
    /// Resident memory of this process in bytes, if it could be read.
    pub memory_bytes: Option<u64>,
    /// Response time, RFC 3339.
    pub timestamp: String,
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `GET /`
pub async fn index(State(state): State<Arc<RelayState>>) -> Json<IndexView> {
    let (connected_peers, active_calls) = {
        let board = state.switchboard.lock();
        (board.peers().len(), board.calls().len())
    };
    Json(IndexView {
        message: "WebRTC signaling relay".to_string(),
        status: "running",
        timestamp: rfc3339(Utc::now()),
        connected_peers,
        active_calls,
    })
}

/// `GET /peers`
pub async fn peers(State(state): State<Arc<RelayState>>) -> Json<PeersView> {
    let mut peers: Vec<PeerView> = {
        let board = state.switchboard.lock();
        board
            .peers()
            .entries()
            .map(|p| PeerView {
                id: p.id.clone(),
                status: p.status,
                joined_at: rfc3339(p.joined_at),
            })
            .collect()
    };
    peers.sort_by(|a, b| a.id.cmp(&b.id));
    let count = peers.len();
    Json(PeersView { peers, count })
}

/// `GET /calls`
pub async fn calls(State(state): State<Arc<RelayState>>) -> Json<CallsView> {
    let mut records: Vec<(DateTime<Utc>, CallView)> = {
        let board = state.switchboard.lock();
        board
            .calls()
            .iter()
            .map(|c| {
                (
                    c.started_at_utc,
                    CallView {
                        id: c.id.clone(),
                        caller_id: c.caller_id.clone(),
                        callee_id: c.callee_id.clone(),
                        status: c.status,
                        started_at: rfc3339(c.started_at_utc),
                    },
                )
            })
            .collect()
    };
    records.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
    let calls: Vec<CallView> = records.into_iter().map(|(_, view)| view).collect();
    let count = calls.len();
    Json(CallsView { calls, count })
}

/// `GET /health`
pub async fn health(State(state): State<Arc<RelayState>>) -> Json<HealthView> {
    let memory_bytes = tokio::task::spawn_blocking(process_memory)
        .await
        .ok()
        .flatten();
    Json(HealthView {
        status: "ok",
        uptime_secs: state.uptime().as_secs(),
        memory_bytes,
        timestamp: rfc3339(Utc::now()),
    })
}

/// Resident memory of the current process, via sysinfo.
fn process_memory() -> Option<u64> {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    let pid = Pid::from_u32(std::process::id());
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );
    sys.process(pid).map(sysinfo::Process::memory)
}
