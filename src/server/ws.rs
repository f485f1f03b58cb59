//! WebSocket upgrade endpoint and its admission guards
//!
//! Upgrades are gated on an origin whitelist and a per-IP concurrent
//! connection cap. A connected socket gets two tasks: the write pump owns
//! the wire, the read loop feeds the hub. Stored history is queued into the
//! outbound buffer before registration so replayed messages always precede
//! live broadcasts.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Extension;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use chrono::SecondsFormat;
use futures_util::StreamExt;
use tracing::{info, warn};
use url::Url;

use crate::auth::AuthUser;
use crate::error::{ChatError, Result};
use crate::protocol::{ChatEvent, EventKind};
use crate::server::api::AppState;
use crate::server::session::{Session, read_pump, teardown, write_pump};

/// Idle IP entries older than this are pruned
const LIMITER_IDLE_CUTOFF: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct IpEntry {
    count: u32,
    last_seen: Instant,
}

/// Caps concurrent WebSocket connections per client IP
pub struct WsConnLimiter {
    counts: std::sync::Mutex<HashMap<IpAddr, IpEntry>>,
    max_conns: u32,
}

impl WsConnLimiter {
    pub fn new(max_conns: u32) -> Arc<Self> {
        Arc::new(Self {
            counts: std::sync::Mutex::new(HashMap::new()),
            max_conns,
        })
    }

    /// Claim a connection slot. The returned guard releases it on drop.
    pub fn try_acquire(self: &Arc<Self>, ip: IpAddr) -> Option<ConnGuard> {
        let now = Instant::now();
        let mut counts = self.counts.lock().expect("conn limiter lock poisoned");

        // Opportunistic cleanup keeps the map bounded without a sweeper task
        counts.retain(|_, e| e.count > 0 || now.duration_since(e.last_seen) < LIMITER_IDLE_CUTOFF);

        let entry = counts.entry(ip).or_insert(IpEntry {
            count: 0,
            last_seen: now,
        });
        entry.last_seen = now;
        if entry.count >= self.max_conns {
            return None;
        }
        entry.count += 1;
        Some(ConnGuard {
            limiter: Arc::clone(self),
            ip,
        })
    }
}

/// Releases a connection slot when dropped
pub struct ConnGuard {
    limiter: Arc<WsConnLimiter>,
    ip: IpAddr,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let mut counts = self
            .limiter
            .counts
            .lock()
            .expect("conn limiter lock poisoned");
        if let Some(entry) = counts.get_mut(&self.ip) {
            entry.count = entry.count.saturating_sub(1);
            entry.last_seen = Instant::now();
        }
    }
}

/// Validate the Origin header against the configured whitelist.
///
/// Scheme must match and hostnames compare exactly (case-insensitive); the
/// port is ignored so dev setups with arbitrary ports work. Hostname-exact
/// comparison closes the prefix-spoofing hole a `starts_with` check would
/// leave (e.g. `localhost.evil.com` vs `localhost`). A missing Origin header
/// is accepted: non-browser clients and same-origin requests don't send one.
/// With no configured origins the request host is the reference.
pub fn origin_allowed(origin: Option<&str>, host: Option<&str>, allowed: &[String]) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    let Ok(origin_url) = Url::parse(origin) else {
        return false;
    };
    let Some(origin_host) = origin_url.host_str() else {
        return false;
    };

    if allowed.is_empty() {
        let Some(host) = host else {
            return false;
        };
        let host = match host.rfind(':') {
            Some(idx) => &host[..idx],
            None => host,
        };
        return origin_host.eq_ignore_ascii_case(host);
    }

    for entry in allowed {
        let Ok(allowed_url) = Url::parse(entry) else {
            continue;
        };
        if !allowed_url
            .scheme()
            .eq_ignore_ascii_case(origin_url.scheme())
        {
            continue;
        }
        if allowed_url
            .host_str()
            .is_some_and(|h| h.eq_ignore_ascii_case(origin_host))
        {
            return true;
        }
    }
    false
}

/// GET /rooms/{id}/ws — upgrade an authenticated client into a room
pub async fn room_ws(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Extension(user): Extension<AuthUser>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    if !origin_allowed(origin, host, &state.config.allowed_origins) {
        warn!(origin = ?origin, "rejected upgrade: origin not allowed");
        return Err(ChatError::forbidden("origin not allowed"));
    }

    let Some(guard) = state.conn_limiter.try_acquire(addr.ip()) else {
        return Err(ChatError::overloaded(
            "too many connections from this address",
        ));
    };

    let username = user.username;
    Ok(ws
        .max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            handle_socket(state, socket, room_id, username).await;
            drop(guard);
        }))
}

async fn handle_socket(
    state: AppState,
    socket: axum::extract::ws::WebSocket,
    room_id: String,
    username: String,
) {
    let (sink, stream) = socket.split();

    // A hub can idle-shut between lookup and registration; in that case the
    // next lookup creates a fresh one.
    let hub = loop {
        let hub = state.manager.get_or_create(&room_id).await;
        if !hub.is_stopped() {
            break hub;
        }
    };

    let (session, outbound) = Session::new(&username, &room_id, &state.config);
    info!(room_id = %room_id, username = %username, "client connected");

    // Queue history before registering so it is ordered ahead of any live
    // broadcast. Sends are non-blocking; a full buffer just loses the tail.
    match state.store.recent(&room_id, state.config.replay_limit).await {
        Ok(history) => {
            for stored in history {
                let mut event = ChatEvent::new(EventKind::Chatlog, &stored.user, &room_id)
                    .with_body(stored.body.clone())
                    .with_message_id(stored.id.clone());
                event.owner = stored.user == username;
                event.reply_to = stored.reply_to.clone();
                event.created_at =
                    Some(stored.created_at.to_rfc3339_opts(SecondsFormat::Secs, true));
                if session.try_push(event).is_err() {
                    break;
                }
            }
        }
        Err(e) => {
            // History is best-effort; the live stream still works
            warn!(room_id = %room_id, error = %e, "history replay failed");
        }
    }

    // Drain the buffer before the hub can push live events into it
    let mut write_task = tokio::spawn(write_pump(
        Arc::clone(&session),
        outbound,
        sink,
        Arc::clone(&state.presence),
        Arc::clone(&state.config),
    ));

    if hub.register(Arc::clone(&session)).await.is_err() {
        // Hub stopped between lookup and registration; close cleanly and let
        // the client reconnect onto a fresh hub.
        session.close_outbound();
        let _ = write_task.await;
        return;
    }

    let mut write_done = false;
    tokio::select! {
        _ = read_pump(
            Arc::clone(&session),
            Arc::clone(&hub),
            stream,
            Arc::clone(&state.queue),
            Arc::clone(&state.metrics),
            Arc::clone(&state.config),
        ) => {}
        // Write side died (deadline or wire error): stop reading too
        _ = &mut write_task => { write_done = true; }
    }

    teardown(Arc::clone(&session), hub, Arc::clone(&state.metrics)).await;
    session.close_outbound();
    if !write_done {
        let _ = write_task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_missing_header_allowed() {
        assert!(origin_allowed(None, Some("chat.example.com"), &[]));
        assert!(origin_allowed(
            None,
            None,
            &["https://chat.example.com".to_string()]
        ));
    }

    #[test]
    fn test_origin_whitelist_exact_hostname() {
        let allowed = vec!["https://chat.example.com".to_string()];

        assert!(origin_allowed(
            Some("https://chat.example.com"),
            None,
            &allowed
        ));
        // Port is ignored
        assert!(origin_allowed(
            Some("https://chat.example.com:8443"),
            None,
            &allowed
        ));
        // Scheme must match
        assert!(!origin_allowed(
            Some("http://chat.example.com"),
            None,
            &allowed
        ));
        // Prefix spoofing is rejected
        assert!(!origin_allowed(
            Some("https://chat.example.com.evil.com"),
            None,
            &allowed
        ));
        assert!(!origin_allowed(Some("https://evil.com"), None, &allowed));
    }

    #[test]
    fn test_origin_same_host_fallback() {
        assert!(origin_allowed(
            Some("http://localhost:3000"),
            Some("localhost:8080"),
            &[]
        ));
        assert!(!origin_allowed(
            Some("http://evil.com"),
            Some("localhost:8080"),
            &[]
        ));
    }

    #[test]
    fn test_origin_garbage_rejected() {
        assert!(!origin_allowed(Some("not a url"), Some("localhost"), &[]));
        assert!(!origin_allowed(
            Some("not a url"),
            None,
            &["https://chat.example.com".to_string()]
        ));
    }

    #[test]
    fn test_conn_limiter_caps_per_ip() {
        let limiter = WsConnLimiter::new(2);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();

        let g1 = limiter.try_acquire(ip).unwrap();
        let _g2 = limiter.try_acquire(ip).unwrap();
        assert!(limiter.try_acquire(ip).is_none());

        // Another IP has its own allowance
        assert!(limiter.try_acquire(other).is_some());

        // Releasing a slot frees capacity
        drop(g1);
        assert!(limiter.try_acquire(ip).is_some());
    }
}
