//! In-process bus transport
//!
//! A channel map standing in for the external pub/sub substrate. Multiple
//! brokers sharing one transport see each other's publishes, which is how
//! the tests exercise multi-instance delivery. The health toggle simulates
//! an outage: while unhealthy every operation fails, so the broker monitor
//! observes exactly what it would against a dead bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

use crate::bus::{BusSubscription, BusTransport};
use crate::error::{ChatError, Result};

/// Channel-map transport with a health toggle
pub struct InMemoryBusTransport {
    channels: Mutex<HashMap<String, Vec<mpsc::Sender<Bytes>>>>,
    healthy: AtomicBool,
    capacity: usize,
}

impl InMemoryBusTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            healthy: AtomicBool::new(true),
            capacity,
        }
    }

    /// Simulate the bus going down (`false`) or coming back (`true`)
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn check_healthy(&self) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChatError::unavailable("bus unreachable"))
        }
    }
}

#[async_trait]
impl BusTransport for InMemoryBusTransport {
    async fn ping(&self) -> Result<()> {
        self.check_healthy()
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        self.check_healthy()?;
        let mut channels = self.channels.lock().await;
        if let Some(senders) = channels.get_mut(channel) {
            senders.retain(|tx| {
                if tx.is_closed() {
                    return false;
                }
                // Non-blocking: a subscriber that cannot keep up loses the
                // payload rather than stalling every other subscriber.
                if tx.try_send(payload.clone()).is_err() {
                    warn!(channel, "bus subscriber backlogged, payload dropped");
                }
                true
            });
            if senders.is_empty() {
                channels.remove(channel);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscription> {
        self.check_healthy()?;
        let (tx, rx) = mpsc::channel(self.capacity);
        self.channels
            .lock()
            .await
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(BusSubscription { rx })
    }
}
