//! Process-wide counters
//!
//! Owned explicitly and passed to collaborators; there is no exposure
//! endpoint in this crate.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters shared across hubs, endpoints and workers
#[derive(Debug, Default)]
pub struct Metrics {
    /// Currently open WebSocket connections
    pub active_connections: AtomicI64,
    /// Hubs currently running
    pub rooms_active: AtomicI64,
    /// Messages accepted for persistence
    pub messages_total: AtomicU64,
    /// Messages dropped because the persistence queue was full
    pub messages_dropped: AtomicU64,
    /// Bus messages dropped by slow hub consumers
    pub bus_messages_dropped: AtomicU64,
    /// Messages lost in failed bulk writes
    pub persist_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn room_started(&self) {
        self.rooms_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn room_stopped(&self) {
        self.rooms_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn message_accepted(&self) {
        self.messages_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bus_message_dropped(&self) {
        self.bus_messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persist_failed(&self, count: u64) {
        self.persist_failures.fetch_add(count, Ordering::Relaxed);
    }
}
