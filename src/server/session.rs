//! Participant sessions and the per-connection read/write loops
//!
//! A [`Session`] is one participant's live connection to one room. It owns a
//! bounded outbound buffer whose closed transition is guarded by a one-shot
//! flag, and a per-connection rate-limit bucket. The write loop is the only
//! task that touches the wire for a session, which is what makes delivery to
//! a single recipient FIFO.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use chrono::{SecondsFormat, Utc};
use futures_util::SinkExt;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::presence::PresenceStore;
use crate::protocol::{ChatEvent, EventKind, escape_body};
use crate::server::hub::{Hub, HubSendError};
use crate::store::{NewMessage, PersistQueue};

/// Why a push into the outbound buffer did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// Buffer is at capacity; the session is a slow consumer
    Full,
    /// Buffer was closed by the hub
    Closed,
}

/// Token bucket for per-connection message rate limiting
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, rate: f64, capacity: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        self.tokens = (self.tokens + elapsed * rate).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Receiving half of a session's outbound buffer, owned by the write loop
pub struct OutboundReceiver {
    pub(crate) rx: mpsc::Receiver<ChatEvent>,
    pub(crate) closed_rx: watch::Receiver<bool>,
}

/// One participant's live connection to a room
pub struct Session {
    /// Connection handle identity; distinguishes multiple sessions of one user
    pub id: Uuid,
    pub username: String,
    pub room_id: String,
    outbound_tx: mpsc::Sender<ChatEvent>,
    closed_tx: watch::Sender<bool>,
    closed: AtomicBool,
    limiter: std::sync::Mutex<TokenBucket>,
    rate_per_sec: f64,
    burst: f64,
}

impl Session {
    /// Create a session and the receiver its write loop will drain.
    pub fn new(
        username: impl Into<String>,
        room_id: impl Into<String>,
        config: &ServerConfig,
    ) -> (Arc<Self>, OutboundReceiver) {
        let (outbound_tx, rx) = mpsc::channel(config.outbound_buffer);
        let (closed_tx, closed_rx) = watch::channel(false);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            username: username.into(),
            room_id: room_id.into(),
            outbound_tx,
            closed_tx,
            closed: AtomicBool::new(false),
            limiter: std::sync::Mutex::new(TokenBucket::new(config.rate_limit_burst)),
            rate_per_sec: config.rate_limit_per_min / 60.0,
            burst: config.rate_limit_burst,
        });
        (session, OutboundReceiver { rx, closed_rx })
    }

    /// Non-blocking push into the outbound buffer.
    pub fn try_push(&self, event: ChatEvent) -> Result<(), PushError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PushError::Closed);
        }
        match self.outbound_tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(PushError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }

    /// Close the outbound buffer. Idempotent; returns true on the first call.
    /// Events already buffered are still drained by the write loop before it
    /// emits the close frame.
    pub fn close_outbound(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.closed_tx.send(true);
        true
    }

    /// Whether the outbound buffer has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Consume one rate-limit token; false means the message must be dropped
    pub fn allow_message(&self) -> bool {
        self.limiter
            .lock()
            .expect("rate limiter lock poisoned")
            .try_consume(self.rate_per_sec, self.burst)
    }

    /// Sender-only warning, dropped if the offender's buffer is full
    fn warn_sender(&self, body: &str) {
        let _ = self.try_push(ChatEvent::system_warn(&self.room_id, body));
    }
}

/// Pump events from the outbound buffer to the wire.
///
/// Sole writer for this socket. Sends a ping every ping period, refreshing
/// the presence TTL as a side effect, and enforces the per-frame write
/// deadline. When the hub closes the buffer, drains what is left and emits a
/// clean close frame.
pub async fn write_pump(
    session: Arc<Session>,
    mut outbound: OutboundReceiver,
    mut sink: SplitSink<WebSocket, Message>,
    presence: Arc<dyn PresenceStore>,
    config: Arc<ServerConfig>,
) {
    let mut ping = tokio::time::interval(config.ping_period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            maybe = outbound.rx.recv() => {
                let Some(event) = maybe else { return };
                if send_event(&mut sink, &event, &config).await.is_err() {
                    return;
                }
            }
            _ = async { while !*outbound.closed_rx.borrow_and_update() { if outbound.closed_rx.changed().await.is_err() { break; } } } => {
                // Hub closed the buffer: flush what it already queued, then
                // say goodbye properly.
                while let Ok(event) = outbound.rx.try_recv() {
                    if send_event(&mut sink, &event, &config).await.is_err() {
                        return;
                    }
                }
                let close = Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: Utf8Bytes::from_static("connection closed"),
                }));
                let _ = timeout(config.write_wait, sink.send(close)).await;
                return;
            }
            _ = ping.tick() => {
                let ping_frame = Message::Ping(Vec::new().into());
                match timeout(config.write_wait, sink.send(ping_frame)).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
                // Keep the user marked online while the connection lives
                if let Err(e) = presence
                    .refresh_online(&session.room_id, &session.username)
                    .await
                {
                    warn!(
                        room_id = %session.room_id,
                        username = %session.username,
                        error = %e,
                        "presence refresh failed"
                    );
                }
            }
        }
    }
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &ChatEvent,
    config: &ServerConfig,
) -> Result<(), ()> {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "outbound event serialization failed");
            return Ok(());
        }
    };
    match timeout(config.write_wait, sink.send(Message::Text(json.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            warn!(error = %e, "wire write failed");
            Err(())
        }
        Err(_) => {
            warn!("wire write deadline exceeded");
            Err(())
        }
    }
}

/// Pump frames from the wire into the hub.
///
/// The read deadline is refreshed only by pong frames; a peer that stops
/// answering pings is torn down. Returns when the connection is done for
/// any reason; the caller then runs [`teardown`].
pub async fn read_pump(
    session: Arc<Session>,
    hub: Arc<Hub>,
    mut stream: SplitStream<WebSocket>,
    queue: Arc<PersistQueue>,
    metrics: Arc<Metrics>,
    config: Arc<ServerConfig>,
) {
    let mut deadline = tokio::time::Instant::now() + config.pong_wait;

    loop {
        let frame = match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => {
                debug!(username = %session.username, "pong deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(username = %session.username, error = %e, "wire read failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Pong(_) => {
                deadline = tokio::time::Instant::now() + config.pong_wait;
            }
            Message::Ping(_) => {
                // The transport answers pings; nothing to do here
            }
            Message::Close(_) => break,
            Message::Text(text) => {
                match handle_inbound(&session, &hub, &queue, &metrics, &config, text.as_str()).await
                {
                    Inbound::Continue => {}
                    Inbound::Stop => break,
                }
            }
            Message::Binary(_) => {
                debug!(username = %session.username, "binary frame ignored");
            }
        }
    }
}

/// Announce the departure and unregister. Both sends are bounded and give up
/// if the hub has already stopped, so teardown always completes.
pub async fn teardown(
    session: Arc<Session>,
    hub: Arc<Hub>,
    metrics: Arc<Metrics>,
) {
    info!(
        room_id = %session.room_id,
        username = %session.username,
        "client disconnected"
    );
    metrics.connection_closed();

    let close_event = ChatEvent::new(EventKind::Close, &session.username, &session.room_id);
    if let Err(e) = hub.broadcast(close_event).await {
        warn!(
            room_id = %session.room_id,
            username = %session.username,
            error = ?e,
            "close broadcast not delivered, hub may be gone"
        );
    }
    if hub.unregister(Arc::clone(&session)).await.is_err() {
        // Hub is gone and will never close this buffer; do it ourselves so
        // the write loop terminates.
        session.close_outbound();
    }
}

enum Inbound {
    Continue,
    Stop,
}

/// Validate, sanitise and route one inbound frame.
async fn handle_inbound(
    session: &Arc<Session>,
    hub: &Arc<Hub>,
    queue: &Arc<PersistQueue>,
    metrics: &Arc<Metrics>,
    config: &Arc<ServerConfig>,
    text: &str,
) -> Inbound {
    let mut event: ChatEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(_) => {
            // A well-formed object with a kind outside the closed set is
            // dropped; a frame that is not JSON at all is a protocol
            // violation and tears the connection down.
            if serde_json::from_str::<serde_json::Value>(text).is_ok() {
                warn!(username = %session.username, "dropped frame with unknown event kind");
                return Inbound::Continue;
            }
            warn!(username = %session.username, "malformed frame");
            return Inbound::Stop;
        }
    };

    // Never trust client-supplied identity or routing
    event.user = session.username.clone();
    event.room_id = session.room_id.clone();
    event.owner = false;

    if !event.kind.client_sendable() {
        warn!(
            username = %session.username,
            kind = ?event.kind,
            "dropped disallowed event kind"
        );
        return Inbound::Continue;
    }

    // Typing indicators skip validation and persistence entirely
    if event.kind.is_typing() {
        return match hub.broadcast(event).await {
            Ok(()) | Err(HubSendError::Timeout) => Inbound::Continue,
            Err(HubSendError::Stopped) => Inbound::Stop,
        };
    }

    if event.body.trim().is_empty() {
        return Inbound::Continue;
    }

    if !session.allow_message() {
        session.warn_sender("You are sending messages too quickly. Please slow down.");
        return Inbound::Continue;
    }

    if event.body.chars().count() > config.max_body_chars {
        session.warn_sender("Messages may not exceed 2000 characters.");
        return Inbound::Continue;
    }

    event.body = escape_body(&event.body);

    // Stable id and timestamp before fan-out, so every recipient sees the
    // same metadata even though the durable write is asynchronous.
    event.message_id = Some(Uuid::new_v4().to_string());
    let now = Utc::now();
    event.created_at = Some(now.to_rfc3339_opts(SecondsFormat::Secs, true));

    if event.kind.is_persistent() {
        let record = NewMessage {
            id: event.message_id.clone().unwrap_or_default(),
            room_id: session.room_id.clone(),
            user: session.username.clone(),
            body: event.body.clone(),
            reply_to: event.reply_to.clone(),
            encrypted: event.encrypted.unwrap_or(false),
            encrypted_keys: event.encrypted_keys.clone(),
            created_at: now,
        };
        match queue
            .enqueue_timeout(record, config.persist_enqueue_timeout)
            .await
        {
            Ok(()) => metrics.message_accepted(),
            Err(e) => {
                warn!(
                    room_id = %session.room_id,
                    username = %session.username,
                    error = %e,
                    "persistence enqueue failed, dropping message"
                );
                metrics.message_dropped();
                session.warn_sender("Your message could not be saved. Please try again.");
                return Inbound::Continue;
            }
        }
    }

    match hub.broadcast(event).await {
        Ok(()) => Inbound::Continue,
        Err(HubSendError::Timeout) => {
            warn!(
                room_id = %session.room_id,
                username = %session.username,
                "hub send timed out, dropping message"
            );
            Inbound::Continue
        }
        Err(HubSendError::Stopped) => Inbound::Stop,
    }
}
