//! callrelay server: WebRTC signaling relay.
//!
//! An axum WebSocket server that lets browser peers find each other by id,
//! negotiate calls, and exchange session descriptions and candidates. The
//! relay never inspects negotiation payloads; it forwards them verbatim.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:3001
//! cargo run --bin callrelay-server
//!
//! # Run on a custom port, allowing one browser origin
//! cargo run --bin callrelay-server -- --port 8080 --allowed-origin https://app.example
//!
//! # Or via environment variables
//! PORT=8080 CALLRELAY_LOG=debug cargo run --bin callrelay-server
//! ```

use std::sync::Arc;
use std::time::Duration;

use callrelay_server::config::{RelayCliArgs, RelayConfig};
use callrelay_server::relay::{self, RelayState};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let bind_addr = config.bind_addr();
    tracing::info!(
        addr = %bind_addr,
        origins = ?config.origins,
        reaper_interval = ?config.reaper_interval,
        call_ttl = ?config.call_ttl,
        "starting callrelay server"
    );

    let state = Arc::new(RelayState::with_config(&config));

    let (bound_addr, mut handle) = match relay::start_server_with_state(&bind_addr, Arc::clone(&state)).await {
        Ok(started) => started,
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %bound_addr, "relay server listening");

    tokio::select! {
        result = &mut handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "relay server task failed");
            }
            std::process::exit(1);
        }
        () = shutdown_signal() => {}
    }

    state.close_all_connections();
    // Let writer tasks flush the close frames.
    tokio::time::sleep(Duration::from_millis(250)).await;
    handle.abort();
    tracing::info!("relay server stopped");
}

/// Resolves on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
