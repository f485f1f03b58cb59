//! Registry of live room hubs
//!
//! One guarded map from room id to hub. Creation is a single critical
//! section, as is removal; stop signals always fire after the lock is
//! released so no caller waits on a draining hub while holding the registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::bus::Broker;
use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::presence::PresenceStore;
use crate::server::hub::{Hub, HubRegistry};

/// Lifecycles hubs and coordinates graceful shutdown
pub struct RoomManager {
    hubs: HubRegistry,
    /// Fixed at construction; hubs never acquire a bus dynamically
    broker: Option<Arc<Broker>>,
    presence: Arc<dyn PresenceStore>,
    metrics: Arc<Metrics>,
    config: Arc<ServerConfig>,
}

impl RoomManager {
    pub fn new(
        broker: Option<Arc<Broker>>,
        presence: Arc<dyn PresenceStore>,
        metrics: Arc<Metrics>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            hubs: Arc::new(RwLock::new(HashMap::new())),
            broker,
            presence,
            metrics,
            config,
        }
    }

    /// Return the room's hub, creating and spawning it if absent.
    pub async fn get_or_create(&self, room_id: &str) -> Arc<Hub> {
        let mut hubs = self.hubs.write().await;
        if let Some(hub) = hubs.get(room_id) {
            if !hub.is_stopped() {
                return Arc::clone(hub);
            }
        }

        let hub = Hub::new(
            room_id,
            Arc::clone(&self.hubs),
            self.broker.clone(),
            Arc::clone(&self.presence),
            Arc::clone(&self.metrics),
            Arc::clone(&self.config),
        );
        hubs.insert(room_id.to_string(), Arc::clone(&hub));
        tokio::spawn(Arc::clone(&hub).run());
        hub
    }

    /// Look up a live hub without creating one
    pub async fn get(&self, room_id: &str) -> Option<Arc<Hub>> {
        self.hubs.read().await.get(room_id).cloned()
    }

    /// Detach a room's hub and signal it to stop. The stop fires outside the
    /// registry lock so removal never blocks on the hub draining.
    pub async fn remove(&self, room_id: &str) {
        let hub = {
            let mut hubs = self.hubs.write().await;
            hubs.remove(room_id)
        };
        if let Some(hub) = hub {
            hub.stop();
        }
    }

    /// Stop every hub and close the bus. Used at process shutdown.
    pub async fn shutdown_all(&self) {
        let hubs: Vec<Arc<Hub>> = {
            let mut map = self.hubs.write().await;
            map.drain().map(|(_, hub)| hub).collect()
        };
        info!(count = hubs.len(), "shutting down all hubs");
        for hub in hubs {
            hub.stop();
        }
        if let Some(broker) = &self.broker {
            broker.close().await;
        }
    }

    /// Deduplicated usernames connected to a room on this instance
    pub async fn online_members(&self, room_id: &str) -> Vec<String> {
        match self.get(room_id).await {
            Some(hub) => hub.members().await,
            None => Vec::new(),
        }
    }
}
