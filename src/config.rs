//! Server configuration
//!
//! Tunables are collected in [`ServerConfig`] and can be overridden from the
//! environment. Defaults follow the production values of the deployed system.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

/// Chat server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub bind_addr: SocketAddr,
    /// Origins accepted on WebSocket upgrade (scheme + hostname compared,
    /// port ignored). Empty list falls back to a same-host check.
    pub allowed_origins: Vec<String>,
    /// HS256 secret for bearer tokens
    pub jwt_secret: String,
    /// Pinned token issuer
    pub jwt_issuer: String,
    /// Maximum concurrent WebSocket connections per client IP
    pub max_ws_conns_per_ip: u32,
    /// Hub auto-shutdown after this long with no clients
    pub hub_idle_timeout: Duration,
    /// Per-session outbound buffer capacity
    pub outbound_buffer: usize,
    /// Hub inbound event channel capacity
    pub hub_channel_buffer: usize,
    /// Maximum time an endpoint waits on a hub channel send
    pub hub_send_timeout: Duration,
    /// Interval between server pings
    pub ping_period: Duration,
    /// Connection torn down when no pong arrives within this window
    pub pong_wait: Duration,
    /// Per-frame write deadline
    pub write_wait: Duration,
    /// Maximum inbound frame size in bytes
    pub max_frame_bytes: usize,
    /// Maximum message body length in code points
    pub max_body_chars: usize,
    /// Sustained message rate per connection (messages per minute)
    pub rate_limit_per_min: f64,
    /// Rate limit burst allowance
    pub rate_limit_burst: f64,
    /// Persistence queue capacity
    pub persist_queue_size: usize,
    /// Number of persistence workers
    pub persist_workers: usize,
    /// Bulk-write when a worker batch reaches this size
    pub persist_batch_size: usize,
    /// Bulk-write at least this often while messages are pending
    pub persist_flush_interval: Duration,
    /// Maximum time an endpoint waits to enqueue a message for persistence
    pub persist_enqueue_timeout: Duration,
    /// Bus health-check interval
    pub bus_monitor_interval: Duration,
    /// Presence liveness TTL
    pub presence_ttl: Duration,
    /// Typing indicator TTL
    pub typing_ttl: Duration,
    /// Maximum stored messages replayed to a reconnecting client
    pub replay_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], 8080).into(),
            allowed_origins: Vec::new(),
            jwt_secret: "dev-only-secret-change-me-in-production".to_string(),
            jwt_issuer: "parley".to_string(),
            max_ws_conns_per_ip: 10,
            hub_idle_timeout: Duration::from_secs(5 * 60),
            outbound_buffer: 256,
            hub_channel_buffer: 256,
            hub_send_timeout: Duration::from_secs(5),
            ping_period: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_frame_bytes: 64 * 1024,
            max_body_chars: 2000,
            rate_limit_per_min: 30.0,
            rate_limit_burst: 5.0,
            persist_queue_size: 1024,
            persist_workers: 4,
            persist_batch_size: 50,
            persist_flush_interval: Duration::from_millis(100),
            persist_enqueue_timeout: Duration::from_secs(5),
            bus_monitor_interval: Duration::from_secs(5),
            presence_ttl: Duration::from_secs(5 * 60),
            typing_ttl: Duration::from_secs(5),
            replay_limit: 256,
        }
    }
}

impl ServerConfig {
    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.bind_addr = parsed,
                Err(_) => warn!(value = %addr, "Invalid BIND_ADDR, using default"),
            }
        }

        if let Ok(origins) = std::env::var("ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }

        if let Ok(secret) = std::env::var("JWT_SECRET") {
            if secret.len() >= 32 {
                config.jwt_secret = secret;
            } else {
                warn!("JWT_SECRET shorter than 32 bytes, using default (dev-only)");
            }
        }

        if let Ok(issuer) = std::env::var("JWT_ISSUER") {
            if !issuer.is_empty() {
                config.jwt_issuer = issuer;
            }
        }

        if let Ok(val) = std::env::var("MAX_WS_CONNS_PER_IP") {
            match val.parse::<u32>() {
                Ok(n) if n > 0 => config.max_ws_conns_per_ip = n,
                _ => warn!(value = %val, "Invalid MAX_WS_CONNS_PER_IP, using default"),
            }
        }

        if let Ok(val) = std::env::var("HUB_IDLE_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.hub_idle_timeout = Duration::from_secs(n),
                _ => warn!(value = %val, "Invalid HUB_IDLE_TIMEOUT_SECS, using default"),
            }
        }

        if let Ok(val) = std::env::var("PERSIST_WORKERS") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.persist_workers = n,
                _ => warn!(value = %val, "Invalid PERSIST_WORKERS, using default"),
            }
        }

        config
    }
}
