//! Cross-node message bus
//!
//! [`BusTransport`] is the capability contract for the pub/sub substrate;
//! [`Broker`] layers subscription bookkeeping, automatic fallback and
//! recovery on top of it. While the broker is in fallback, publish and
//! subscribe are disabled and hubs fan out locally; a monitor task pings the
//! transport and restores every handler-bearing subscription once the bus
//! comes back.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ChatError, Result};

pub use memory::InMemoryBusTransport;

const CHANNEL_PREFIX: &str = "chat:room:";

/// Bus channel name for a room
fn channel_name(room_id: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, room_id)
}

/// Callback invoked for each payload received on a subscription.
/// Handlers MUST NOT block; a slow downstream drops the payload instead.
pub type Handler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// A live subscription: a stream of raw payloads from one channel.
/// Dropping it detaches from the transport.
pub struct BusSubscription {
    pub rx: mpsc::Receiver<Bytes>,
}

/// Capability contract for the pub/sub substrate
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Liveness probe used by the broker monitor
    async fn ping(&self) -> Result<()>;
    /// Publish a payload to a channel
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;
    /// Open a subscription to a channel
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription>;
}

/// Broker bookkeeping, guarded by one lock
struct BrokerInner {
    /// Live listener tasks by room
    subscriptions: HashMap<String, JoinHandle<()>>,
    /// Registered handlers by room; survives fallback so recovery can re-bind
    handlers: HashMap<String, Handler>,
    fallback: bool,
}

/// Pub/sub broker with automatic fallback and recovery
pub struct Broker {
    transport: Arc<dyn BusTransport>,
    inner: Arc<RwLock<BrokerInner>>,
    monitor_stop: watch::Sender<bool>,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Create a broker over the given transport and start its monitor task.
    pub fn new(transport: Arc<dyn BusTransport>, monitor_interval: Duration) -> Arc<Self> {
        let (monitor_stop, stop_rx) = watch::channel(false);
        let broker = Arc::new(Self {
            transport,
            inner: Arc::new(RwLock::new(BrokerInner {
                subscriptions: HashMap::new(),
                handlers: HashMap::new(),
                fallback: false,
            })),
            monitor_stop,
            monitor: std::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(run_monitor(Arc::clone(&broker), monitor_interval, stop_rx));
        *broker.monitor.lock().expect("monitor lock poisoned") = Some(handle);
        broker
    }

    /// Whether the broker is operating in fallback mode
    pub async fn is_fallback(&self) -> bool {
        self.inner.read().await.fallback
    }

    /// Publish serialized event bytes to a room's channel.
    /// Returns `Unavailable` in fallback so callers can fan out locally.
    pub async fn publish(&self, room_id: &str, payload: Bytes) -> Result<()> {
        if self.inner.read().await.fallback {
            return Err(ChatError::unavailable("bus in fallback mode"));
        }
        self.transport.publish(&channel_name(room_id), payload).await
    }

    /// Register a handler for a room and open a live subscription.
    /// In fallback the handler is stored for recovery and an error returned
    /// so the caller knows delivery is local-only for now.
    pub async fn subscribe(&self, room_id: &str, handler: Handler) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.handlers.insert(room_id.to_string(), handler);

        if inner.fallback {
            return Err(ChatError::unavailable(
                "bus in fallback mode, subscription stored but not active",
            ));
        }
        if inner.subscriptions.contains_key(room_id) {
            return Ok(());
        }

        let sub = self.transport.subscribe(&channel_name(room_id)).await?;
        let task = spawn_listener(Arc::clone(&self.inner), room_id.to_string(), sub);
        inner.subscriptions.insert(room_id.to_string(), task);
        Ok(())
    }

    /// Drop the handler and subscription for a room
    pub async fn unsubscribe(&self, room_id: &str) {
        let mut inner = self.inner.write().await;
        inner.handlers.remove(room_id);
        if let Some(task) = inner.subscriptions.remove(room_id) {
            task.abort();
        }
    }

    /// Stop the monitor and every listener task
    pub async fn close(&self) {
        let _ = self.monitor_stop.send(true);
        let handle = self.monitor.lock().expect("monitor lock poisoned").take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let mut inner = self.inner.write().await;
        for (_, task) in inner.subscriptions.drain() {
            task.abort();
        }
        inner.handlers.clear();
    }
}

/// Per-subscription receive task: reads payloads and invokes the handler.
fn spawn_listener(
    inner: Arc<RwLock<BrokerInner>>,
    room_id: String,
    mut sub: BusSubscription,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = sub.rx.recv().await {
            let handler = inner.read().await.handlers.get(&room_id).cloned();
            if let Some(handler) = handler {
                handler(payload);
            }
        }
        debug!(room_id, "bus listener finished");
    })
}

/// Ping loop: flips to fallback on failure, re-binds every handler-bearing
/// room on recovery. The lock is released across the subscribe I/O; new
/// handles are installed and the fallback flag cleared only once every room
/// re-subscribed, so a partial recovery retries on the next tick.
async fn run_monitor(
    broker: Arc<Broker>,
    interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop_rx.wait_for(|stopped| *stopped) => return,
            _ = ticker.tick() => {}
        }

        let healthy = broker.transport.ping().await.is_ok();

        if !healthy {
            let mut inner = broker.inner.write().await;
            if !inner.fallback {
                warn!("bus connection lost, switching to fallback");
                inner.fallback = true;
                // Live subscriptions are stale now; handlers stay registered.
                for (_, task) in inner.subscriptions.drain() {
                    task.abort();
                }
            }
            continue;
        }

        let was_down = broker.inner.read().await.fallback;
        if !was_down {
            continue;
        }

        info!("bus connection recovered, restoring subscriptions");
        let rooms: Vec<String> = {
            let inner = broker.inner.read().await;
            inner.handlers.keys().cloned().collect()
        };

        let mut restored = Vec::with_capacity(rooms.len());
        let mut failed = false;
        for room_id in rooms {
            match broker.transport.subscribe(&channel_name(&room_id)).await {
                Ok(sub) => restored.push((room_id, sub)),
                Err(e) => {
                    warn!(room_id, error = %e, "bus re-subscribe failed, staying in fallback");
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            // Retry the whole set next tick
            continue;
        }

        let mut inner = broker.inner.write().await;
        for (room_id, sub) in restored {
            // A hub may have unsubscribed while the lock was released
            if !inner.handlers.contains_key(&room_id) {
                continue;
            }
            let task = spawn_listener(Arc::clone(&broker.inner), room_id.clone(), sub);
            if let Some(old) = inner.subscriptions.insert(room_id.clone(), task) {
                old.abort();
            }
            info!(room_id, "bus re-subscribed room");
        }
        inner.fallback = false;
    }
}
