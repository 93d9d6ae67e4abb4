//! Relay server core: shared state, WebSocket handler, and server startup.
//!
//! The relay accepts WebSocket connections on `/ws`, hands every text frame
//! to the [`router`], and serves read-only JSON views of its state next to
//! the socket endpoint. All peer and call state lives in one
//! [`Switchboard`] behind a mutex; per-connection writer tasks drain bounded
//! outbound queues so a slow peer never blocks anyone else.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use callrelay_proto::ServerMessage;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::{OriginPolicy, RelayConfig};
use crate::registry::PeerHandle;
use crate::router::{self, Connection};
use crate::switchboard::Switchboard;
use crate::{api, reaper};

/// Shared relay server state: the switchboard plus resolved limits.
#[derive(Debug)]
pub struct RelayState {
    /// Peer registry and call table.
    pub switchboard: Mutex<Switchboard>,
    /// Origins allowed to upgrade or read the HTTP views.
    pub origins: OriginPolicy,
    /// Maximum accepted inbound text frame, in bytes.
    pub max_message_size: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue_size: usize,
    /// Period of the background reaper.
    pub reaper_interval: Duration,
    /// Age after which a call record is dropped.
    pub call_ttl: Duration,
    started_at: std::time::Instant,
    next_conn_id: AtomicU64,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a relay state with the default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&RelayConfig::default())
    }

    /// Creates a relay state with limits taken from a resolved config.
    #[must_use]
    pub fn with_config(config: &RelayConfig) -> Self {
        Self {
            switchboard: Mutex::new(Switchboard::new()),
            origins: config.origins.clone(),
            max_message_size: config.max_message_size,
            outbound_queue_size: config.outbound_queue_size,
            reaper_interval: config.reaper_interval,
            call_ttl: config.call_ttl,
            started_at: std::time::Instant::now(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocates the serial number for a new connection.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Time since the state was created.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Sends a WebSocket close frame to every registered peer.
    ///
    /// Each peer's writer task shuts down after forwarding the frame, which
    /// ends the connection. Connections that never registered hold no
    /// switchboard entry and get no close frame; they are dropped when the
    /// process exits. Used for graceful shutdown and testing.
    pub fn close_all_connections(&self) {
        let handles = self.switchboard.lock().handles();
        for (peer_id, handle) in handles {
            tracing::info!(peer_id = %peer_id, "sending close frame to peer");
            if let Err(e) = handle.close() {
                tracing::debug!(peer_id = %peer_id, error = %e, "close frame not queued");
            }
        }
    }
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Queue the `connected` welcome.
/// 2. Spawn the writer task draining the outbound queue into the socket.
/// 3. Route inbound frames in arrival order until the socket closes or the
///    writer stops.
/// 4. Run the disconnect path for whatever id the connection registered.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(state.outbound_queue_size);
    let conn_id = state.next_conn_id();
    let mut conn = Connection::new(PeerHandle::new(conn_id, tx));

    tracing::debug!(conn_id, "connection opened");
    conn.reply(&ServerMessage::Connected {
        message: "Connected to signaling relay".to_string(),
    });

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = ws_sender.send(msg).await {
                tracing::debug!(conn_id, error = %e, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => router::handle_text(&mut conn, text.as_str(), &state),
                Some(Ok(Message::Binary(_))) => router::handle_binary(&conn),
                Some(Ok(Message::Close(_))) => {
                    tracing::debug!(conn_id, peer_id = ?conn.peer_id(), "received close frame");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(conn_id, error = %e, "WebSocket read failed");
                    break;
                }
                None => break,
            },
            _ = &mut write_task => break,
        }
    }

    router::close(&conn, &state);
    drop(conn);
    write_task.abort();
    tracing::debug!(conn_id, "connection closed");
}

/// Starts the relay server on the given address with default settings.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`].
///
/// Serves the WebSocket endpoint and the HTTP views, and runs the reaper
/// for as long as the server task lives.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/", axum::routing::get(api::index))
        .route("/peers", axum::routing::get(api::peers))
        .route("/calls", axum::routing::get(api::calls))
        .route("/health", axum::routing::get(api::health))
        .route("/ws", axum::routing::get(ws_handler))
        .layer(cors_layer(&state.origins))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        let reaper = reaper::spawn(state);
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
        reaper.abort();
    });

    Ok((bound_addr, handle))
}

/// Starts the relay server in-process for testing.
///
/// Binds to `127.0.0.1:0` (OS-assigned port) and returns the bound address
/// and a [`tokio::task::JoinHandle`] for cleanup.
#[cfg(test)]
pub async fn start_test_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    start_server("127.0.0.1:0")
        .await
        .expect("failed to start test server")
}

fn cors_layer(origins: &OriginPolicy) -> CorsLayer {
    match origins {
        OriginPolicy::Any => CorsLayer::permissive(),
        OriginPolicy::List(allowed) => {
            let values: Vec<HeaderValue> = allowed
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok())
                .collect();
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(values))
                .allow_methods([Method::GET])
        }
    }
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
///
/// Requests carrying an `Origin` the policy does not allow are refused with
/// 403. Requests without one (native clients) are let through.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<RelayState>>,
) -> Response {
    if let Some(origin) = headers.get(header::ORIGIN) {
        let allowed = origin.to_str().is_ok_and(|o| state.origins.allows(o));
        if !allowed {
            tracing::warn!(origin = ?origin, "WebSocket upgrade from disallowed origin");
            return StatusCode::FORBIDDEN.into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
