//! Best-effort presence and typing state
//!
//! Presence is keyed by `(room, user)` with a liveness TTL: a per-room member
//! set gives cheap enumeration while a per-member deadline tracks expiry.
//! Readers reconcile the two and prune members whose deadline has lapsed.
//! Availability is optional — every caller treats failures as non-fatal.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;

/// Capability contract for the presence backend.
///
/// The deployed system backs this with a shared cache so instances see each
/// other's presence; [`MemoryPresenceStore`] is the in-process reference.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_online(&self, room_id: &str, user: &str) -> Result<()>;
    async fn set_offline(&self, room_id: &str, user: &str) -> Result<()>;
    /// Extend the liveness TTL without re-adding the set entry
    async fn refresh_online(&self, room_id: &str, user: &str) -> Result<()>;
    async fn set_typing(&self, room_id: &str, user: &str) -> Result<()>;
    async fn clear_typing(&self, room_id: &str, user: &str) -> Result<()>;
    /// Users currently online in a room, stale entries pruned
    async fn list_online(&self, room_id: &str) -> Result<Vec<String>>;
    /// Users currently typing in a room, stale entries pruned
    async fn list_typing(&self, room_id: &str) -> Result<Vec<String>>;
}

/// One TTL-tracked tier: a member set per room plus per-member deadlines.
#[derive(Debug, Default)]
struct TtlTier {
    members: HashMap<String, HashSet<String>>,
    deadlines: HashMap<(String, String), Instant>,
}

impl TtlTier {
    fn mark(&mut self, room_id: &str, user: &str, ttl: Duration) {
        self.members
            .entry(room_id.to_string())
            .or_default()
            .insert(user.to_string());
        self.deadlines
            .insert((room_id.to_string(), user.to_string()), Instant::now() + ttl);
    }

    fn clear(&mut self, room_id: &str, user: &str) {
        if let Some(set) = self.members.get_mut(room_id) {
            set.remove(user);
            if set.is_empty() {
                self.members.remove(room_id);
            }
        }
        self.deadlines
            .remove(&(room_id.to_string(), user.to_string()));
    }

    fn refresh(&mut self, room_id: &str, user: &str, ttl: Duration) {
        let key = (room_id.to_string(), user.to_string());
        if self.deadlines.contains_key(&key) {
            self.deadlines.insert(key, Instant::now() + ttl);
        }
    }

    /// Enumerate live members, pruning anyone whose deadline expired.
    fn list(&mut self, room_id: &str) -> Vec<String> {
        let now = Instant::now();
        let Some(set) = self.members.get_mut(room_id) else {
            return Vec::new();
        };

        let mut live = Vec::with_capacity(set.len());
        let mut stale = Vec::new();
        for user in set.iter() {
            let key = (room_id.to_string(), user.clone());
            match self.deadlines.get(&key) {
                Some(deadline) if *deadline > now => live.push(user.clone()),
                _ => stale.push(user.clone()),
            }
        }
        for user in stale {
            set.remove(&user);
            self.deadlines.remove(&(room_id.to_string(), user));
        }
        if set.is_empty() {
            self.members.remove(room_id);
        }
        live.sort();
        live
    }
}

/// In-process presence store with TTL semantics
pub struct MemoryPresenceStore {
    presence: Mutex<TtlTier>,
    typing: Mutex<TtlTier>,
    presence_ttl: Duration,
    typing_ttl: Duration,
}

impl MemoryPresenceStore {
    pub fn new(presence_ttl: Duration, typing_ttl: Duration) -> Self {
        Self {
            presence: Mutex::new(TtlTier::default()),
            typing: Mutex::new(TtlTier::default()),
            presence_ttl,
            typing_ttl,
        }
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_online(&self, room_id: &str, user: &str) -> Result<()> {
        self.presence.lock().await.mark(room_id, user, self.presence_ttl);
        Ok(())
    }

    async fn set_offline(&self, room_id: &str, user: &str) -> Result<()> {
        self.presence.lock().await.clear(room_id, user);
        Ok(())
    }

    async fn refresh_online(&self, room_id: &str, user: &str) -> Result<()> {
        self.presence
            .lock()
            .await
            .refresh(room_id, user, self.presence_ttl);
        Ok(())
    }

    async fn set_typing(&self, room_id: &str, user: &str) -> Result<()> {
        self.typing.lock().await.mark(room_id, user, self.typing_ttl);
        Ok(())
    }

    async fn clear_typing(&self, room_id: &str, user: &str) -> Result<()> {
        self.typing.lock().await.clear(room_id, user);
        Ok(())
    }

    async fn list_online(&self, room_id: &str) -> Result<Vec<String>> {
        Ok(self.presence.lock().await.list(room_id))
    }

    async fn list_typing(&self, room_id: &str) -> Result<Vec<String>> {
        Ok(self.typing.lock().await.list(room_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryPresenceStore {
        MemoryPresenceStore::new(Duration::from_secs(300), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_online_offline() {
        let store = store();
        store.set_online("general", "alice").await.unwrap();
        store.set_online("general", "bob").await.unwrap();

        assert_eq!(store.list_online("general").await.unwrap(), ["alice", "bob"]);

        store.set_offline("general", "alice").await.unwrap();
        assert_eq!(store.list_online("general").await.unwrap(), ["bob"]);
    }

    #[tokio::test]
    async fn test_rooms_are_independent() {
        let store = store();
        store.set_online("a", "alice").await.unwrap();
        store.set_online("b", "bob").await.unwrap();

        assert_eq!(store.list_online("a").await.unwrap(), ["alice"]);
        assert_eq!(store.list_online("b").await.unwrap(), ["bob"]);
    }

    #[tokio::test]
    async fn test_typing_expires() {
        let store = store();
        store.set_typing("general", "alice").await.unwrap();
        assert_eq!(store.list_typing("general").await.unwrap(), ["alice"]);

        tokio::time::sleep(Duration::from_millis(40)).await;

        // Expired entry is pruned from the set on read
        assert!(store.list_typing("general").await.unwrap().is_empty());
        assert!(store.list_typing("general").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_presence_pruned_on_list() {
        let store = MemoryPresenceStore::new(Duration::from_millis(20), Duration::from_secs(5));
        store.set_online("general", "alice").await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.list_online("general").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_extends_ttl() {
        let store = MemoryPresenceStore::new(Duration::from_millis(50), Duration::from_secs(5));
        store.set_online("general", "alice").await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        store.refresh_online("general", "alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Would have expired without the refresh
        assert_eq!(store.list_online("general").await.unwrap(), ["alice"]);
    }

    #[tokio::test]
    async fn test_clear_typing() {
        let store = store();
        store.set_typing("general", "alice").await.unwrap();
        store.clear_typing("general", "alice").await.unwrap();
        assert!(store.list_typing("general").await.unwrap().is_empty());
    }
}
