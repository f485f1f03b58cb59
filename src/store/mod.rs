//! Durable message storage
//!
//! The concrete engine is a deployment concern; this module defines the
//! capability contract the rest of the server programs against, the stored
//! document shape, and an in-process implementation used by tests and
//! single-node setups.

pub mod queue;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{ChatError, Result};

pub use queue::PersistQueue;

/// How long after creation a message may still be edited by its author
pub const EDIT_WINDOW_SECS: i64 = 5 * 60;

/// A message as it rests in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub room_id: String,
    pub user: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_keys: Option<HashMap<String, String>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

/// A message on its way into the store
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: String,
    pub room_id: String,
    pub user: String,
    pub body: String,
    pub reply_to: Option<String>,
    pub encrypted: bool,
    pub encrypted_keys: Option<HashMap<String, String>>,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    fn into_stored(self) -> StoredMessage {
        StoredMessage {
            id: self.id,
            room_id: self.room_id,
            user: self.user,
            body: self.body,
            reply_to: self.reply_to,
            deleted: false,
            encrypted: self.encrypted,
            encrypted_keys: self.encrypted_keys,
            created_at: self.created_at,
            edited_at: None,
        }
    }
}

/// Capability contract for the persistence backend.
///
/// `edit` and `delete` MUST perform their precondition checks and the write
/// as one atomic operation (a single conditional update); callers rely on
/// that to rule out check-then-write races.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Bulk-insert a batch; returns the number written
    async fn insert_many(&self, batch: Vec<NewMessage>) -> Result<usize>;

    /// Insert a single message and return the stored document
    async fn insert_one(&self, message: NewMessage) -> Result<StoredMessage>;

    /// The most recent `limit` non-deleted messages of a room, oldest first
    async fn recent(&self, room_id: &str, limit: usize) -> Result<Vec<StoredMessage>>;

    /// Look up one message by id
    async fn get(&self, message_id: &str) -> Result<Option<StoredMessage>>;

    /// Replace a message body. Succeeds only when `user` is the author, the
    /// message is not deleted, and it is younger than the edit window —
    /// checked atomically with the update.
    async fn edit(
        &self,
        room_id: &str,
        message_id: &str,
        user: &str,
        body: &str,
    ) -> Result<StoredMessage>;

    /// Soft-delete a message: the flag is set and the body cleared, gated
    /// atomically on authorship.
    async fn delete(&self, message_id: &str, user: &str) -> Result<()>;
}

/// In-process store. A single mutex guards the map, so every conditional
/// update is one critical section.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<StoredMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert_many(&self, batch: Vec<NewMessage>) -> Result<usize> {
        let mut messages = self.messages.lock().await;
        let count = batch.len();
        messages.extend(batch.into_iter().map(NewMessage::into_stored));
        Ok(count)
    }

    async fn insert_one(&self, message: NewMessage) -> Result<StoredMessage> {
        let stored = message.into_stored();
        self.messages.lock().await.push(stored.clone());
        Ok(stored)
    }

    async fn recent(&self, room_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let messages = self.messages.lock().await;
        let mut recent: Vec<StoredMessage> = messages
            .iter()
            .filter(|m| m.room_id == room_id && !m.deleted)
            .cloned()
            .collect();
        recent.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if recent.len() > limit {
            recent.drain(..recent.len() - limit);
        }
        Ok(recent)
    }

    async fn get(&self, message_id: &str) -> Result<Option<StoredMessage>> {
        let messages = self.messages.lock().await;
        Ok(messages.iter().find(|m| m.id == message_id).cloned())
    }

    async fn edit(
        &self,
        room_id: &str,
        message_id: &str,
        user: &str,
        body: &str,
    ) -> Result<StoredMessage> {
        let mut messages = self.messages.lock().await;
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id && m.room_id == room_id)
            .ok_or_else(|| ChatError::not_found("message not found"))?;

        if message.user != user {
            return Err(ChatError::forbidden("only the author may edit a message"));
        }
        if message.deleted {
            return Err(ChatError::gone("message has been deleted"));
        }
        if Utc::now() - message.created_at > ChronoDuration::seconds(EDIT_WINDOW_SECS) {
            return Err(ChatError::window_expired(
                "messages can only be edited for 5 minutes",
            ));
        }

        message.body = body.to_string();
        message.edited_at = Some(Utc::now());
        Ok(message.clone())
    }

    async fn delete(&self, message_id: &str, user: &str) -> Result<()> {
        let mut messages = self.messages.lock().await;
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| ChatError::not_found("message not found"))?;

        if message.user != user {
            return Err(ChatError::forbidden("only the author may delete a message"));
        }
        if !message.deleted {
            message.deleted = true;
            message.body.clear();
        }
        Ok(())
    }
}
