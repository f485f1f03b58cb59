//! Chat server binary
//!
//! Wires the in-process store, presence and persistence pipeline together
//! and serves the WebSocket + REST surface. Production deployments swap the
//! in-memory store/presence/bus implementations for their real backends
//! through the same capability traits.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley::presence::MemoryPresenceStore;
use parley::server::{AppState, RoomManager, WsConnLimiter, build_router};
use parley::store::{MemoryMessageStore, MessageStore, PersistQueue};
use parley::{Metrics, ServerConfig, TokenVerifier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(ServerConfig::from_env());
    let metrics = Arc::new(Metrics::new());

    let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
    let presence = Arc::new(MemoryPresenceStore::new(
        config.presence_ttl,
        config.typing_ttl,
    ));
    let queue = Arc::new(PersistQueue::start(
        Arc::clone(&store),
        Arc::clone(&metrics),
        config.persist_queue_size,
        config.persist_workers,
        config.persist_batch_size,
        config.persist_flush_interval,
    ));

    // The cross-node bus is a deployment concern; without one, hubs fan out
    // locally and the server runs single-instance.
    let manager = Arc::new(RoomManager::new(
        None,
        presence.clone(),
        Arc::clone(&metrics),
        Arc::clone(&config),
    ));

    let state = AppState {
        manager: Arc::clone(&manager),
        store,
        queue: Arc::clone(&queue),
        presence,
        verifier: Arc::new(TokenVerifier::new(&config.jwt_secret, &config.jwt_issuer)),
        conn_limiter: WsConnLimiter::new(config.max_ws_conns_per_ip),
        metrics,
        config: Arc::clone(&config),
    };

    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "chat server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown_all().await;
    queue.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
