//! Per-room hub: the single serialisation point for room state
//!
//! Every mutation of a room's runtime state flows through the hub's run
//! loop: joins, leaves, inbound messages, cross-node deliveries, kicks and
//! idle shutdown. Endpoints talk to the hub through bounded channels with
//! stop-guarded sends, so a hub that has exited can never wedge a caller.
//!
//! Fan-out is publish-XOR-local: with a healthy bus the hub publishes the
//! event and fans out only when it comes back on the subscription, so each
//! hub fans out exactly once per message regardless of where the sender is
//! connected. Without a bus (or in fallback) it fans out locally right away.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::Broker;
use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::presence::PresenceStore;
use crate::protocol::{ChatEvent, EventKind};
use crate::server::session::{PushError, Session};

/// Shared hub registry, owned by the room manager and borrowed by each hub
/// for the idle-shutdown double-check.
pub(crate) type HubRegistry = Arc<RwLock<HashMap<String, Arc<Hub>>>>;

/// Why a send to the hub did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubSendError {
    /// The hub channel stayed full past the send timeout
    Timeout,
    /// The hub has stopped
    Stopped,
}

/// One-shot stop signal; closed at most once.
pub(crate) struct StopSignal {
    tx: watch::Sender<bool>,
    fired: AtomicBool,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            fired: AtomicBool::new(false),
        }
    }

    /// Fire the signal. Returns true only on the first call.
    pub(crate) fn trigger(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(true);
        true
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Receiving halves of the hub channels, consumed by the run loop
struct HubReceivers {
    broadcast_rx: mpsc::Receiver<ChatEvent>,
    register_rx: mpsc::Receiver<Arc<Session>>,
    unregister_rx: mpsc::Receiver<Arc<Session>>,
    kick_rx: mpsc::Receiver<String>,
}

/// Per-room actor owning the live participant set
pub struct Hub {
    pub room_id: String,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    broadcast_tx: mpsc::Sender<ChatEvent>,
    register_tx: mpsc::Sender<Arc<Session>>,
    unregister_tx: mpsc::Sender<Arc<Session>>,
    kick_tx: mpsc::Sender<String>,
    stop: StopSignal,
    receivers: Mutex<Option<HubReceivers>>,
    registry: HubRegistry,
    broker: Option<Arc<Broker>>,
    presence: Arc<dyn PresenceStore>,
    metrics: Arc<Metrics>,
    config: Arc<ServerConfig>,
}

impl Hub {
    /// Create a hub. The caller (normally the room manager) spawns
    /// [`Hub::run`] exactly once.
    pub fn new(
        room_id: impl Into<String>,
        registry: HubRegistry,
        broker: Option<Arc<Broker>>,
        presence: Arc<dyn PresenceStore>,
        metrics: Arc<Metrics>,
        config: Arc<ServerConfig>,
    ) -> Arc<Self> {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.hub_channel_buffer);
        let (register_tx, register_rx) = mpsc::channel(config.hub_channel_buffer);
        let (unregister_tx, unregister_rx) = mpsc::channel(config.hub_channel_buffer);
        let (kick_tx, kick_rx) = mpsc::channel(16);

        Arc::new(Self {
            room_id: room_id.into(),
            sessions: RwLock::new(HashMap::new()),
            broadcast_tx,
            register_tx,
            unregister_tx,
            kick_tx,
            stop: StopSignal::new(),
            receivers: Mutex::new(Some(HubReceivers {
                broadcast_rx,
                register_rx,
                unregister_rx,
                kick_rx,
            })),
            registry,
            broker,
            presence,
            metrics,
            config,
        })
    }

    /// Hand a session to the hub for registration
    pub async fn register(&self, session: Arc<Session>) -> Result<(), HubSendError> {
        self.send_guarded(&self.register_tx, session).await
    }

    /// Ask the hub to remove a session
    pub async fn unregister(&self, session: Arc<Session>) -> Result<(), HubSendError> {
        self.send_guarded(&self.unregister_tx, session).await
    }

    /// Feed an event into the hub's fan-out path
    pub async fn broadcast(&self, event: ChatEvent) -> Result<(), HubSendError> {
        self.send_guarded(&self.broadcast_tx, event).await
    }

    /// Evict every session of one participant
    pub async fn kick(&self, username: &str) -> Result<(), HubSendError> {
        self.send_guarded(&self.kick_tx, username.to_string()).await
    }

    /// Deduplicated usernames of connected participants
    pub async fn members(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut names: Vec<String> = sessions.values().map(|s| s.username.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Signal the hub to drain and exit. Idempotent.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    /// Whether the stop signal has fired
    pub fn is_stopped(&self) -> bool {
        self.stop.is_triggered()
    }

    /// Bounded, stop-guarded channel send. Endpoints must never block
    /// forever on a hub that is draining or gone.
    async fn send_guarded<T>(
        &self,
        tx: &mpsc::Sender<T>,
        value: T,
    ) -> Result<(), HubSendError> {
        if self.stop.is_triggered() {
            return Err(HubSendError::Stopped);
        }
        let mut stop_rx = self.stop.subscribe();
        tokio::select! {
            res = tokio::time::timeout(self.config.hub_send_timeout, tx.send(value)) => {
                match res {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(HubSendError::Stopped),
                    Err(_) => Err(HubSendError::Timeout),
                }
            }
            _ = stop_rx.wait_for(|stopped| *stopped) => Err(HubSendError::Stopped),
        }
    }

    /// The hub's serialisation loop. Spawn exactly once per hub.
    pub async fn run(self: Arc<Self>) {
        let Some(mut rx) = self.receivers.lock().await.take() else {
            warn!(room_id = %self.room_id, "hub run loop started twice");
            return;
        };
        self.metrics.room_started();

        // Wire the bus subscription. The handler must not block: payloads
        // are pushed non-blocking into a channel the run loop drains, and a
        // backlogged hub loses bus messages rather than wedging the broker.
        let (bus_tx, mut bus_rx) = mpsc::channel::<Bytes>(self.config.hub_channel_buffer);
        if let Some(broker) = &self.broker {
            let room_id = self.room_id.clone();
            let metrics = Arc::clone(&self.metrics);
            let handler: crate::bus::Handler = Arc::new(move |payload| {
                if bus_tx.try_send(payload).is_err() {
                    warn!(room_id = %room_id, "bus message dropped: slow consumer");
                    metrics.bus_message_dropped();
                }
            });
            // In fallback the handler is still stored so recovery re-binds us
            if let Err(e) = broker.subscribe(&self.room_id, handler).await {
                warn!(room_id = %self.room_id, error = %e, "bus subscribe failed, local fan-out only");
            }
        }

        let idle = tokio::time::sleep(self.config.hub_idle_timeout);
        tokio::pin!(idle);
        let mut stop_rx = self.stop.subscribe();

        loop {
            tokio::select! {
                _ = async { while !*stop_rx.borrow_and_update() { if stop_rx.changed().await.is_err() { break; } } } => {
                    self.close_all_sessions().await;
                    break;
                }

                _ = &mut idle => {
                    if self.try_idle_shutdown().await {
                        break;
                    }
                    idle.as_mut().reset(tokio::time::Instant::now() + self.config.hub_idle_timeout);
                }

                Some(session) = rx.register_rx.recv() => {
                    idle.as_mut().reset(tokio::time::Instant::now() + self.config.hub_idle_timeout);
                    self.handle_register(session).await;
                }

                Some(session) = rx.unregister_rx.recv() => {
                    idle.as_mut().reset(tokio::time::Instant::now() + self.config.hub_idle_timeout);
                    self.handle_unregister(session).await;
                }

                Some(username) = rx.kick_rx.recv() => {
                    self.handle_kick(&username).await;
                }

                Some(event) = rx.broadcast_rx.recv() => {
                    idle.as_mut().reset(tokio::time::Instant::now() + self.config.hub_idle_timeout);
                    self.handle_broadcast(event).await;
                }

                Some(payload) = bus_rx.recv() => {
                    self.handle_bus_payload(payload).await;
                }
            }
        }

        // A registration may have been queued while we were deciding to
        // exit. Close those buffers so their endpoints notice and reconnect
        // against a fresh hub.
        while let Ok(session) = rx.register_rx.try_recv() {
            session.close_outbound();
        }

        if let Some(broker) = &self.broker {
            broker.unsubscribe(&self.room_id).await;
        }
        self.metrics.room_stopped();
        debug!(room_id = %self.room_id, "hub exited");
    }

    /// Idle shutdown with the double-check discipline: the emptiness check
    /// and registry removal must be atomic with respect to get-or-create,
    /// which also takes the registry lock.
    async fn try_idle_shutdown(&self) -> bool {
        let empty = self.sessions.read().await.is_empty();
        if !empty {
            return false;
        }

        let mut hubs = self.registry.write().await;
        let still_empty = self.sessions.read().await.is_empty();
        if !still_empty {
            return false;
        }
        hubs.remove(&self.room_id);
        drop(hubs);

        info!(room_id = %self.room_id, "hub idle timeout, shutting down");
        self.stop.trigger();
        true
    }

    async fn handle_register(&self, session: Arc<Session>) {
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session.id, Arc::clone(&session));
        }
        self.metrics.connection_opened();
        info!(
            room_id = %self.room_id,
            username = %session.username,
            "client registered"
        );

        if let Err(e) = self
            .presence
            .set_online(&self.room_id, &session.username)
            .await
        {
            warn!(room_id = %self.room_id, error = %e, "presence set_online failed");
        }
        self.broadcast_local(ChatEvent::presence(&self.room_id, &session.username, true))
            .await;
    }

    async fn handle_unregister(&self, session: Arc<Session>) {
        let last_for_user;
        {
            let mut sessions = self.sessions.write().await;
            if sessions.remove(&session.id).is_some() {
                session.close_outbound();
                info!(
                    room_id = %self.room_id,
                    username = %session.username,
                    "client unregistered"
                );
            }
            // The same user may still be connected from another tab; only
            // the last session going away means offline.
            last_for_user = !sessions
                .values()
                .any(|s| s.username == session.username);
        }

        if last_for_user {
            self.clear_presence(&session.username).await;
            self.broadcast_local(ChatEvent::presence(&self.room_id, &session.username, false))
                .await;
        }
    }

    async fn handle_kick(&self, username: &str) {
        let evicted: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let targets: Vec<Uuid> = sessions
                .values()
                .filter(|s| s.username == username)
                .map(|s| s.id)
                .collect();
            targets
                .into_iter()
                .filter_map(|id| sessions.remove(&id))
                .collect()
        };

        if evicted.is_empty() {
            return;
        }
        for session in &evicted {
            session.close_outbound();
        }
        info!(
            room_id = %self.room_id,
            username,
            sessions = evicted.len(),
            "participant kicked"
        );
        self.clear_presence(username).await;
    }

    /// Route an event entering the hub: publish to the bus when it is
    /// healthy (fan-out happens on the receive path), otherwise fan out
    /// locally. A failed publish falls back to local fan-out for that one
    /// event only.
    async fn handle_broadcast(&self, event: ChatEvent) {
        if let Some(broker) = &self.broker {
            if !broker.is_fallback().await {
                let payload = match serde_json::to_vec(&event) {
                    Ok(payload) => Bytes::from(payload),
                    Err(e) => {
                        warn!(room_id = %self.room_id, error = %e, "event serialization failed");
                        self.broadcast_local(event).await;
                        return;
                    }
                };
                if let Err(e) = broker.publish(&self.room_id, payload).await {
                    warn!(
                        room_id = %self.room_id,
                        error = %e,
                        "bus publish failed, using local fan-out"
                    );
                    self.broadcast_local(event).await;
                }
                // On success our own copy returns via the subscription
                return;
            }
        }
        self.broadcast_local(event).await;
    }

    /// Validate and fan out an event received from the bus (sent by this or
    /// any other instance).
    async fn handle_bus_payload(&self, payload: Bytes) {
        let event: ChatEvent = match serde_json::from_slice(&payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(room_id = %self.room_id, error = %e, "bus message rejected: undecodable");
                return;
            }
        };
        if !event.kind.allowed_from_bus() {
            warn!(
                room_id = %self.room_id,
                kind = ?event.kind,
                "bus message rejected: disallowed event kind"
            );
            return;
        }
        self.broadcast_local(event).await;
    }

    /// Fan an event out to every local session.
    ///
    /// The participant set is snapshotted under the read lock and the lock
    /// released before any send, so a slow endpoint cannot stall the hub.
    /// Sessions whose buffer is full are marked and evicted afterwards under
    /// the write lock.
    async fn broadcast_local(&self, event: ChatEvent) {
        let is_typing = event.kind.is_typing();

        if is_typing {
            let result = match event.kind {
                EventKind::TypingStart => {
                    self.presence.set_typing(&self.room_id, &event.user).await
                }
                _ => self.presence.clear_typing(&self.room_id, &event.user).await,
            };
            if let Err(e) = result {
                warn!(room_id = %self.room_id, error = %e, "typing presence update failed");
            }
        }

        let snapshot: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().await;
            sessions.values().cloned().collect()
        };

        let mut evict: Vec<Arc<Session>> = Vec::new();
        for session in snapshot {
            // Typing indicators are not echoed back to the typer
            if is_typing && session.username == event.user {
                continue;
            }

            let mut copy = event.clone();
            copy.owner = session.username == event.user;
            match copy.kind {
                EventKind::Open => {
                    copy.body = format!("---- {} joined the room ----", copy.user);
                }
                EventKind::Close => {
                    copy.body = format!("---- {} left the room ----", copy.user);
                }
                _ => {}
            }

            match session.try_push(copy) {
                Ok(()) => {}
                Err(PushError::Full) => evict.push(session),
                Err(PushError::Closed) => {}
            }
        }

        if evict.is_empty() {
            return;
        }
        let evicted: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            evict
                .into_iter()
                .filter_map(|session| sessions.remove(&session.id))
                .collect()
        };
        for session in evicted {
            warn!(
                room_id = %self.room_id,
                username = %session.username,
                "evicting slow consumer"
            );
            session.close_outbound();
            self.clear_presence(&session.username).await;
        }
    }

    /// Best-effort presence cleanup for a departed participant
    async fn clear_presence(&self, username: &str) {
        if let Err(e) = self.presence.set_offline(&self.room_id, username).await {
            warn!(room_id = %self.room_id, error = %e, "presence set_offline failed");
        }
        if let Err(e) = self.presence.clear_typing(&self.room_id, username).await {
            warn!(room_id = %self.room_id, error = %e, "presence clear_typing failed");
        }
    }

    /// Close every session's buffer; their write loops emit the close frame.
    async fn close_all_sessions(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, session) in sessions.drain() {
            session.close_outbound();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBusTransport;
    use crate::presence::MemoryPresenceStore;
    use crate::server::session::OutboundReceiver;
    use std::time::Duration;
    use tokio::time::sleep;

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            outbound_buffer: 8,
            hub_idle_timeout: Duration::from_secs(60),
            hub_send_timeout: Duration::from_millis(500),
            ..ServerConfig::default()
        })
    }

    struct Fixture {
        registry: HubRegistry,
        presence: Arc<MemoryPresenceStore>,
        metrics: Arc<Metrics>,
        config: Arc<ServerConfig>,
    }

    impl Fixture {
        fn new(config: Arc<ServerConfig>) -> Self {
            Self {
                registry: Arc::new(RwLock::new(HashMap::new())),
                presence: Arc::new(MemoryPresenceStore::new(
                    Duration::from_secs(300),
                    Duration::from_secs(5),
                )),
                metrics: Arc::new(Metrics::new()),
                config,
            }
        }

        async fn spawn_hub(&self, room_id: &str, broker: Option<Arc<Broker>>) -> Arc<Hub> {
            let hub = Hub::new(
                room_id,
                Arc::clone(&self.registry),
                broker,
                Arc::clone(&self.presence) as Arc<dyn PresenceStore>,
                Arc::clone(&self.metrics),
                Arc::clone(&self.config),
            );
            self.registry
                .write()
                .await
                .insert(room_id.to_string(), Arc::clone(&hub));
            tokio::spawn(Arc::clone(&hub).run());
            hub
        }

        async fn join(&self, hub: &Arc<Hub>, username: &str) -> (Arc<Session>, OutboundReceiver) {
            let (session, outbound) = Session::new(username, hub.room_id.clone(), &self.config);
            hub.register(Arc::clone(&session)).await.unwrap();
            (session, outbound)
        }
    }

    async fn recv_event(outbound: &mut OutboundReceiver) -> ChatEvent {
        tokio::time::timeout(Duration::from_secs(1), outbound.rx.recv())
            .await
            .expect("no event within 1s")
            .expect("outbound closed")
    }

    async fn drain(outbound: &mut OutboundReceiver) {
        sleep(Duration::from_millis(50)).await;
        while outbound.rx.try_recv().is_ok() {}
    }

    fn msg_from(user: &str, room: &str, body: &str) -> ChatEvent {
        ChatEvent::new(EventKind::Msg, user, room)
            .with_body(body)
            .with_message_id(Uuid::new_v4().to_string())
    }

    #[tokio::test]
    async fn test_fanout_stamps_owner_per_recipient() {
        let fx = Fixture::new(test_config());
        let hub = fx.spawn_hub("general", None).await;

        let (_alice, mut alice_out) = fx.join(&hub, "alice").await;
        let (_bob, mut bob_out) = fx.join(&hub, "bob").await;
        drain(&mut alice_out).await;
        drain(&mut bob_out).await;

        let sent = msg_from("alice", "general", "hi");
        hub.broadcast(sent.clone()).await.unwrap();

        let to_alice = recv_event(&mut alice_out).await;
        let to_bob = recv_event(&mut bob_out).await;

        assert!(to_alice.owner);
        assert!(!to_bob.owner);
        assert_eq!(to_alice.body, "hi");
        assert_eq!(to_bob.body, "hi");
        assert_eq!(to_alice.message_id, sent.message_id);
        assert_eq!(to_bob.message_id, sent.message_id);
    }

    #[tokio::test]
    async fn test_register_broadcasts_presence_online() {
        let fx = Fixture::new(test_config());
        let hub = fx.spawn_hub("general", None).await;

        let (_alice, mut alice_out) = fx.join(&hub, "alice").await;
        drain(&mut alice_out).await;

        let (_bob, _bob_out) = fx.join(&hub, "bob").await;
        let event = recv_event(&mut alice_out).await;
        assert_eq!(event.kind, EventKind::Presence);
        assert_eq!(event.user, "bob");
        assert_eq!(event.body, "online");

        assert_eq!(
            fx.presence.list_online("general").await.unwrap(),
            ["alice", "bob"]
        );
    }

    #[tokio::test]
    async fn test_multi_tab_offline_suppression() {
        let fx = Fixture::new(test_config());
        let hub = fx.spawn_hub("general", None).await;

        let (_bob, mut bob_out) = fx.join(&hub, "bob").await;
        let (alice_tab1, _out1) = fx.join(&hub, "alice").await;
        let (alice_tab2, _out2) = fx.join(&hub, "alice").await;
        drain(&mut bob_out).await;

        // First tab closing must not produce an offline broadcast
        hub.unregister(alice_tab1).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(bob_out.rx.try_recv().is_err());

        // Last tab closing produces exactly one
        hub.unregister(alice_tab2).await.unwrap();
        let event = recv_event(&mut bob_out).await;
        assert_eq!(event.kind, EventKind::Presence);
        assert_eq!(event.user, "alice");
        assert_eq!(event.body, "offline");
        assert!(bob_out.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_register_unregister_returns_to_baseline() {
        let fx = Fixture::new(test_config());
        let hub = fx.spawn_hub("general", None).await;

        let (alice, _out) = fx.join(&hub, "alice").await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.members().await, ["alice"]);

        hub.unregister(alice).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(hub.members().await.is_empty());
        assert!(fx.presence.list_online("general").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_typing_not_echoed_to_typer() {
        let fx = Fixture::new(test_config());
        let hub = fx.spawn_hub("general", None).await;

        let (_alice, mut alice_out) = fx.join(&hub, "alice").await;
        let (_bob, mut bob_out) = fx.join(&hub, "bob").await;
        drain(&mut alice_out).await;
        drain(&mut bob_out).await;

        hub.broadcast(ChatEvent::new(EventKind::TypingStart, "alice", "general"))
            .await
            .unwrap();

        let to_bob = recv_event(&mut bob_out).await;
        assert_eq!(to_bob.kind, EventKind::TypingStart);

        sleep(Duration::from_millis(50)).await;
        assert!(alice_out.rx.try_recv().is_err());
        assert_eq!(fx.presence.list_typing("general").await.unwrap(), ["alice"]);
    }

    #[tokio::test]
    async fn test_open_close_bodies_rewritten() {
        let fx = Fixture::new(test_config());
        let hub = fx.spawn_hub("general", None).await;

        let (_bob, mut bob_out) = fx.join(&hub, "bob").await;
        drain(&mut bob_out).await;

        hub.broadcast(ChatEvent::new(EventKind::Open, "alice", "general"))
            .await
            .unwrap();
        assert_eq!(
            recv_event(&mut bob_out).await.body,
            "---- alice joined the room ----"
        );

        hub.broadcast(ChatEvent::new(EventKind::Close, "alice", "general"))
            .await
            .unwrap();
        assert_eq!(
            recv_event(&mut bob_out).await.body,
            "---- alice left the room ----"
        );
    }

    #[tokio::test]
    async fn test_slow_consumer_evicted_others_unaffected() {
        let fx = Fixture::new(test_config());
        let hub = fx.spawn_hub("general", None).await;

        let (_alice, mut alice_out) = fx.join(&hub, "alice").await;
        let (bob, mut bob_out) = fx.join(&hub, "bob").await;
        drain(&mut alice_out).await;
        drain(&mut bob_out).await;

        // Fill bob's buffer to the brim without draining it
        for i in 0..fx.config.outbound_buffer {
            hub.broadcast(msg_from("alice", "general", &format!("m{}", i)))
                .await
                .unwrap();
        }
        sleep(Duration::from_millis(50)).await;
        let mut alice_received = 0;
        while alice_out.rx.try_recv().is_ok() {
            alice_received += 1;
        }
        assert_eq!(alice_received, fx.config.outbound_buffer);

        // One more: bob has no room and gets evicted, alice is unaffected
        hub.broadcast(msg_from("alice", "general", "overflow"))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        assert!(bob.is_closed());
        assert_eq!(hub.members().await, ["alice"]);
        assert_eq!(fx.presence.list_online("general").await.unwrap(), ["alice"]);
        assert_eq!(recv_event(&mut alice_out).await.body, "overflow");
    }

    #[tokio::test]
    async fn test_kick_evicts_all_sessions_of_user() {
        let fx = Fixture::new(test_config());
        let hub = fx.spawn_hub("general", None).await;

        let (alice_tab1, _o1) = fx.join(&hub, "alice").await;
        let (alice_tab2, _o2) = fx.join(&hub, "alice").await;
        let (_bob, _o3) = fx.join(&hub, "bob").await;
        sleep(Duration::from_millis(50)).await;

        hub.kick("alice").await.unwrap();
        sleep(Duration::from_millis(50)).await;

        assert!(alice_tab1.is_closed());
        assert!(alice_tab2.is_closed());
        assert_eq!(hub.members().await, ["bob"]);
    }

    #[tokio::test]
    async fn test_stop_closes_every_session_once() {
        let fx = Fixture::new(test_config());
        let hub = fx.spawn_hub("general", None).await;

        let (alice, mut alice_out) = fx.join(&hub, "alice").await;
        drain(&mut alice_out).await;

        hub.stop();
        hub.stop(); // second call is a no-op
        sleep(Duration::from_millis(50)).await;

        assert!(alice.is_closed());
        assert!(hub.is_stopped());
        assert!(matches!(
            hub.broadcast(msg_from("alice", "general", "late")).await,
            Err(HubSendError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_idle_shutdown_removes_hub_from_registry() {
        let config = Arc::new(ServerConfig {
            hub_idle_timeout: Duration::from_millis(50),
            ..ServerConfig::default()
        });
        let fx = Fixture::new(config);
        let hub = fx.spawn_hub("general", None).await;

        sleep(Duration::from_millis(200)).await;

        assert!(hub.is_stopped());
        assert!(fx.registry.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_activity_resets_idle_timer() {
        let config = Arc::new(ServerConfig {
            hub_idle_timeout: Duration::from_millis(150),
            ..ServerConfig::default()
        });
        let fx = Fixture::new(config);
        let hub = fx.spawn_hub("general", None).await;

        let (_alice, _out) = fx.join(&hub, "alice").await;
        sleep(Duration::from_millis(400)).await;

        // A registered session keeps the hub alive past the idle window
        assert!(!hub.is_stopped());
        assert!(fx.registry.read().await.contains_key("general"));
    }

    #[tokio::test]
    async fn test_bus_delivery_exactly_once_per_publish() {
        let transport = Arc::new(InMemoryBusTransport::new(256));
        let broker = Broker::new(
            Arc::clone(&transport) as Arc<dyn crate::bus::BusTransport>,
            Duration::from_secs(60),
        );

        let fx = Fixture::new(test_config());
        let hub = fx.spawn_hub("general", Some(Arc::clone(&broker))).await;

        let (_alice, mut alice_out) = fx.join(&hub, "alice").await;
        let (_bob, mut bob_out) = fx.join(&hub, "bob").await;
        drain(&mut alice_out).await;
        drain(&mut bob_out).await;

        // Publish goes out on the bus and comes back exactly once
        hub.broadcast(msg_from("alice", "general", "via bus"))
            .await
            .unwrap();

        let to_alice = recv_event(&mut alice_out).await;
        let to_bob = recv_event(&mut bob_out).await;
        assert!(to_alice.owner);
        assert!(!to_bob.owner);

        sleep(Duration::from_millis(50)).await;
        assert!(alice_out.rx.try_recv().is_err());
        assert!(bob_out.rx.try_recv().is_err());

        broker.close().await;
    }

    #[tokio::test]
    async fn test_cross_instance_delivery_and_outage() {
        // Two "instances": separate registries and brokers over one shared
        // transport.
        let transport = Arc::new(InMemoryBusTransport::new(256));
        let broker_a = Broker::new(
            Arc::clone(&transport) as Arc<dyn crate::bus::BusTransport>,
            Duration::from_millis(10),
        );
        let broker_b = Broker::new(
            Arc::clone(&transport) as Arc<dyn crate::bus::BusTransport>,
            Duration::from_millis(10),
        );

        let fx_a = Fixture::new(test_config());
        let fx_b = Fixture::new(test_config());
        let hub_a = fx_a.spawn_hub("general", Some(Arc::clone(&broker_a))).await;
        let hub_b = fx_b.spawn_hub("general", Some(Arc::clone(&broker_b))).await;

        let (_alice, mut alice_out) = fx_a.join(&hub_a, "alice").await;
        let (_bob, mut bob_out) = fx_b.join(&hub_b, "bob").await;
        drain(&mut alice_out).await;
        drain(&mut bob_out).await;

        // Cross-instance delivery while the bus is healthy
        hub_a
            .broadcast(msg_from("alice", "general", "hello bob"))
            .await
            .unwrap();
        assert_eq!(recv_event(&mut bob_out).await.body, "hello bob");
        assert_eq!(recv_event(&mut alice_out).await.body, "hello bob");

        // Outage: both brokers fall back, local fan-out keeps working
        transport.set_healthy(false);
        sleep(Duration::from_millis(100)).await;
        assert!(broker_a.is_fallback().await);

        hub_a
            .broadcast(msg_from("alice", "general", "local only"))
            .await
            .unwrap();
        assert_eq!(recv_event(&mut alice_out).await.body, "local only");
        sleep(Duration::from_millis(50)).await;
        assert!(bob_out.rx.try_recv().is_err());

        // Recovery: cross-instance delivery resumes, no hub was recreated
        transport.set_healthy(true);
        sleep(Duration::from_millis(150)).await;
        assert!(!broker_a.is_fallback().await);
        assert!(!hub_a.is_stopped());
        assert!(!hub_b.is_stopped());

        hub_a
            .broadcast(msg_from("alice", "general", "back online"))
            .await
            .unwrap();
        assert_eq!(recv_event(&mut bob_out).await.body, "back online");
        assert_eq!(recv_event(&mut alice_out).await.body, "back online");

        broker_a.close().await;
        broker_b.close().await;
    }

    #[tokio::test]
    async fn test_unknown_bus_payload_dropped() {
        let transport = Arc::new(InMemoryBusTransport::new(256));
        let broker = Broker::new(
            Arc::clone(&transport) as Arc<dyn crate::bus::BusTransport>,
            Duration::from_secs(60),
        );

        let fx = Fixture::new(test_config());
        let hub = fx.spawn_hub("general", Some(Arc::clone(&broker))).await;
        let (_alice, mut alice_out) = fx.join(&hub, "alice").await;
        drain(&mut alice_out).await;

        use crate::bus::BusTransport;
        transport
            .publish(
                "chat:room:general",
                Bytes::from_static(br#"{"Event":"SHUTDOWN","User":"mallory","room_id":"general"}"#),
            )
            .await
            .unwrap();
        transport
            .publish("chat:room:general", Bytes::from_static(b"not json"))
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(alice_out.rx.try_recv().is_err());

        // A valid payload still flows afterwards
        transport
            .publish(
                "chat:room:general",
                Bytes::from(serde_json::to_vec(&msg_from("bob", "general", "legit")).unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(recv_event(&mut alice_out).await.body, "legit");

        broker.close().await;
    }
}
