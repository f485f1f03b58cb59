//! Parley - Horizontally Scalable Group Chat Server
//!
//! This library provides a real-time group chat server. Clients hold one
//! WebSocket per room; the server fans every message out to the room's
//! participants, persists it through an asynchronous batching pipeline, and
//! relays it across instances over a pub/sub bus.
//!
//! ## Architecture
//!
//! All concurrent room state is serialised through a per-room actor:
//!
//! - **Room hub**: owns the participant set; joins, leaves, messages,
//!   cross-node deliveries, kicks and idle shutdown all pass through its
//!   run loop. Fan-out snapshots the participant set and never blocks on a
//!   slow recipient.
//! - **Room manager**: guarded registry of live hubs with atomic
//!   create-or-get and graceful shutdown.
//! - **Sessions**: one bounded outbound buffer per connection, drained by a
//!   single writer task; a read task validates inbound frames and feeds the
//!   hub.
//! - **Persistence queue**: process-wide bounded channel drained by workers
//!   that bulk-write in size-or-time batches.
//! - **Bus broker**: room-keyed pub/sub with automatic fallback to local
//!   fan-out and re-subscription on recovery.
//! - **Presence store**: best-effort TTL-backed online/typing state.
//!
//! ## Example
//!
//! ```rust,ignore
//! use parley::{AppState, ServerConfig, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::from_env();
//!     let state = AppState { /* wire store, bus, presence, ... */ };
//!     let app = build_router(state);
//!     let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;

// Subsystems
pub mod bus;
pub mod presence;
pub mod server;
pub mod store;

// Re-export error types
pub use error::{ChatError, Result};

// Re-export protocol types
pub use protocol::{ChatEvent, EventKind};

// Re-export server types
pub use server::{
    AppState, Hub, HubSendError, PushError, RoomManager, Session, WsConnLimiter, build_router,
};

// Re-export subsystem entry points
pub use auth::{AuthUser, TokenVerifier, issue_token};
pub use bus::{Broker, BusTransport, InMemoryBusTransport};
pub use config::ServerConfig;
pub use metrics::Metrics;
pub use presence::{MemoryPresenceStore, PresenceStore};
pub use store::{MemoryMessageStore, MessageStore, PersistQueue, StoredMessage};
