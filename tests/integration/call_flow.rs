// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Integration tests for the call signaling flow over real WebSockets.
//!
//! Each test starts an in-process relay on an OS-assigned port and drives it
//! with `tokio-tungstenite` clients, checking both the frames peers receive
//! and the relay's switchboard state afterwards.

use std::sync::Arc;
use std::time::Duration;

use callrelay_proto::{CallStatus, PeerStatus};
use callrelay_server::relay::{self, RelayState};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start() -> (Arc<RelayState>, std::net::SocketAddr) {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = relay::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    (state, addr)
}

async fn send_raw(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

async fn send(ws: &mut Ws, msg: &Value) {
    send_raw(ws, &msg.to_string()).await;
}

/// Next text frame, as raw text.
async fn recv_text(ws: &mut Ws) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return text.as_str().to_string();
        }
    }
}

async fn recv(ws: &mut Ws) -> Value {
    serde_json::from_str(&recv_text(ws).await).unwrap()
}

/// Skips frames until one of type `kind` arrives.
async fn recv_type(ws: &mut Ws, kind: &str) -> Value {
    loop {
        let msg = recv(ws).await;
        if msg["type"] == kind {
            return msg;
        }
    }
}

async fn connect(addr: std::net::SocketAddr) -> Ws {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    assert_eq!(recv(&mut ws).await["type"], "connected");
    ws
}

async fn register(addr: std::net::SocketAddr, id: &str) -> Ws {
    let mut ws = connect(addr).await;
    send(&mut ws, &json!({"type": "register", "id": id})).await;
    let ack = recv(&mut ws).await;
    assert_eq!(ack["type"], "registered", "unexpected reply: {ack}");
    assert_eq!(ack["id"], id);
    assert_eq!(recv(&mut ws).await["type"], "user-list");
    ws
}

fn status(state: &RelayState, id: &str) -> Option<PeerStatus> {
    state.switchboard.lock().peers().status(id)
}

#[tokio::test]
async fn full_call_scenario() {
    let (state, addr) = start().await;
    let mut a = register(addr, "A").await;
    let mut b = register(addr, "B").await;
    assert_eq!(recv(&mut a).await["users"], json!(["A", "B"]));

    // A calls B.
    send(&mut a, &json!({"type": "call-request", "to": "B"})).await;
    let ring = recv(&mut b).await;
    assert_eq!(ring["type"], "call-request");
    assert_eq!(ring["from"], "A");
    let call_id = ring["callId"].as_str().unwrap().to_string();

    // B accepts.
    send(&mut b, &json!({"type": "call-accept", "to": "A"})).await;
    let accepted = recv(&mut a).await;
    assert_eq!(accepted["type"], "call-accept");
    assert_eq!(accepted["from"], "B");
    assert_eq!(accepted["callId"], call_id.as_str());
    assert_eq!(status(&state, "A"), Some(PeerStatus::InCall));
    assert_eq!(status(&state, "B"), Some(PeerStatus::InCall));
    assert_eq!(
        state.switchboard.lock().calls().get(&call_id).unwrap().status,
        CallStatus::Accepted
    );

    // A sends an offer; B gets the payload text unmodified.
    let payload = r#"{"sdp": "v=0\r\no=- 46117 2 IN IP4 127.0.0.1",  "type":"offer", "n": 1.50}"#;
    send_raw(
        &mut a,
        &format!(r#"{{"type":"offer","to":"B","payload":{payload}}}"#),
    )
    .await;
    let offer_text = recv_text(&mut b).await;
    assert!(
        offer_text.contains(payload),
        "payload was altered: {offer_text}"
    );
    let offer: Value = serde_json::from_str(&offer_text).unwrap();
    assert_eq!(offer["type"], "offer");
    assert_eq!(offer["from"], "A");
    assert_eq!(offer["to"], "B");

    // B disconnects mid-call.
    b.close(None).await.unwrap();
    let end = recv(&mut a).await;
    assert_eq!(end["type"], "end");
    assert_eq!(end["from"], "B");
    assert_eq!(end["reason"], "user-disconnected");
    let roster = recv(&mut a).await;
    assert_eq!(roster["type"], "user-list");
    assert_eq!(roster["users"], json!(["A"]));

    assert_eq!(status(&state, "A"), Some(PeerStatus::Available));
    assert!(state.switchboard.lock().calls().get(&call_id).is_none());
}

#[tokio::test]
async fn busy_peer_is_refused() {
    let (state, addr) = start().await;
    let mut a = register(addr, "alice").await;
    let mut b = register(addr, "bob").await;
    let mut c = register(addr, "carol").await;

    send(&mut a, &json!({"type": "call-request", "to": "bob"})).await;
    recv_type(&mut b, "call-request").await;

    send(&mut c, &json!({"type": "call-request", "to": "bob"})).await;
    let err = recv_type(&mut c, "error").await;
    assert_eq!(err["code"], "peer-busy");
    assert_eq!(state.switchboard.lock().calls().len(), 1);
    assert_eq!(status(&state, "carol"), Some(PeerStatus::Available));
}

#[tokio::test]
async fn unknown_callee_is_unavailable() {
    let (state, addr) = start().await;
    let mut a = register(addr, "alice").await;

    send(&mut a, &json!({"type": "call-request", "to": "nobody"})).await;
    let err = recv_type(&mut a, "error").await;
    assert_eq!(err["code"], "peer-unavailable");
    assert!(state.switchboard.lock().calls().is_empty());
}

#[tokio::test]
async fn reject_frees_both_peers() {
    let (state, addr) = start().await;
    let mut a = register(addr, "alice").await;
    let mut b = register(addr, "bob").await;

    send(&mut a, &json!({"type": "call-request", "to": "bob"})).await;
    let ring = recv_type(&mut b, "call-request").await;
    send(&mut b, &json!({"type": "call-reject", "to": "alice"})).await;

    let rejected = recv_type(&mut a, "call-reject").await;
    assert_eq!(rejected["callId"], ring["callId"]);
    assert!(state.switchboard.lock().calls().is_empty());
    assert_eq!(status(&state, "alice"), Some(PeerStatus::Available));
    assert_eq!(status(&state, "bob"), Some(PeerStatus::Available));
}

#[tokio::test]
async fn ending_twice_is_not_an_error() {
    let (state, addr) = start().await;
    let mut a = register(addr, "alice").await;
    let mut b = register(addr, "bob").await;

    send(&mut a, &json!({"type": "call-request", "to": "bob"})).await;
    recv_type(&mut b, "call-request").await;
    send(&mut b, &json!({"type": "call-accept", "to": "alice"})).await;
    recv_type(&mut a, "call-accept").await;

    send(&mut a, &json!({"type": "end", "to": "bob"})).await;
    send(&mut a, &json!({"type": "call-ended", "to": "bob"})).await;
    send(&mut a, &json!({"type": "heartbeat"})).await;

    // Both ends are forwarded; no error reaches alice before the ack.
    assert_eq!(recv_type(&mut b, "end").await["from"], "alice");
    assert_eq!(recv_type(&mut b, "end").await["from"], "alice");
    assert_eq!(recv(&mut a).await["type"], "heartbeat-ack");

    assert!(state.switchboard.lock().calls().is_empty());
    assert_eq!(status(&state, "alice"), Some(PeerStatus::Available));
    assert_eq!(status(&state, "bob"), Some(PeerStatus::Available));
}

#[tokio::test]
async fn duplicate_id_is_already_taken() {
    let (state, addr) = start().await;
    let _first = register(addr, "alice").await;

    let mut second = connect(addr).await;
    send(&mut second, &json!({"type": "register", "id": "alice"})).await;
    let err = recv(&mut second).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "already-taken");
    assert_eq!(state.switchboard.lock().peers().len(), 1);

    // The refused connection can still register under another id.
    send(&mut second, &json!({"type": "register", "id": "alice2"})).await;
    assert_eq!(recv(&mut second).await["type"], "registered");
}

#[tokio::test]
async fn bad_frames_keep_connection_open() {
    let (_state, addr) = start().await;
    let mut a = register(addr, "alice").await;

    send_raw(&mut a, "this is not json").await;
    assert_eq!(recv(&mut a).await["code"], "malformed-message");

    send(&mut a, &json!({"type": "teleport", "to": "bob"})).await;
    assert_eq!(recv(&mut a).await["code"], "unknown-type");

    send(&mut a, &json!({"type": "offer", "payload": {}})).await;
    assert_eq!(recv(&mut a).await["code"], "malformed-message");

    send(&mut a, &json!({"type": "heartbeat"})).await;
    assert_eq!(recv(&mut a).await["type"], "heartbeat-ack");
}

#[tokio::test]
async fn relay_to_absent_peer_fails_delivery() {
    let (_state, addr) = start().await;
    let mut a = register(addr, "alice").await;

    send(
        &mut a,
        &json!({"type": "ice-candidate", "to": "ghost", "candidate": {"candidate": "x"}}),
    )
    .await;
    let err = recv(&mut a).await;
    assert_eq!(err["code"], "delivery-failed");
    assert_eq!(err["to"], "ghost");
}

#[tokio::test]
async fn spoofed_sender_is_replaced() {
    let (_state, addr) = start().await;
    let mut a = register(addr, "alice").await;
    let mut b = register(addr, "bob").await;

    send(
        &mut a,
        &json!({"type": "answer", "from": "mallory", "to": "bob", "payload": {"sdp": "x"}}),
    )
    .await;
    let answer = recv_type(&mut b, "answer").await;
    assert_eq!(answer["from"], "alice");
}

/// Reads frames until none arrives for `quiet`, returning the last roster.
async fn last_roster(ws: &mut Ws, quiet: Duration) -> Option<Value> {
    let mut last = None;
    while let Ok(Some(frame)) = tokio::time::timeout(quiet, ws.next()).await {
        if let Message::Text(text) = frame.unwrap() {
            let msg: Value = serde_json::from_str(text.as_str()).unwrap();
            if msg["type"] == "user-list" {
                last = Some(msg["users"].clone());
            }
        }
    }
    last
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_leave_every_roster_current() {
    const PEERS: usize = 40;
    let (state, addr) = start().await;
    let mut observer = register(addr, "observer").await;

    // `register` asserts the ack arrives before any roster.
    let tasks: Vec<_> = (0..PEERS)
        .map(|i| tokio::spawn(async move { register(addr, &format!("peer-{i:02}")).await }))
        .collect();
    let mut peers = Vec::with_capacity(PEERS);
    for task in tasks {
        peers.push(task.await.unwrap());
    }
    assert_eq!(state.switchboard.lock().peers().len(), PEERS + 1);

    let roster = last_roster(&mut observer, Duration::from_millis(300))
        .await
        .expect("observer received no roster");
    assert_eq!(roster.as_array().unwrap().len(), PEERS + 1);

    // Each peer ends on the full roster, except the one that registered last,
    // whose own (already consumed) roster was final.
    let mut without_update = 0;
    for ws in &mut peers {
        match last_roster(ws, Duration::from_millis(100)).await {
            Some(roster) => assert_eq!(roster.as_array().unwrap().len(), PEERS + 1),
            None => without_update += 1,
        }
    }
    assert!(without_update <= 1);
}
