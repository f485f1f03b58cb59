//! Wire event types for the chat system
//!
//! Events cross three boundaries with the same JSON shape: the WebSocket
//! wire, the cross-node pub/sub bus, and the persistence pipeline. Field
//! names are wire-stable; do not rename them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Closed set of event kinds. Strings outside this set fail to deserialize
/// and are dropped at whichever boundary they arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Normal text message
    Msg,
    /// File-attachment reference (body is the file URL)
    MsgFile,
    /// Broadcast of an edit to an existing message
    MsgEdit,
    /// Broadcast of a deletion
    MsgDelete,
    /// Synthetic join announcement
    Open,
    /// Synthetic leave announcement
    Close,
    /// Historical message delivered on reconnect
    Chatlog,
    /// Online/offline notification; body is "online" or "offline"
    Presence,
    /// Transient typing indicator
    TypingStart,
    /// Typing indicator cleared
    TypingStop,
    /// Administrative broadcast
    Announce,
    /// Sender-only warning (rate/length/drop)
    Warn,
}

impl EventKind {
    /// Kinds a client is allowed to send. Everything else is server-generated
    /// and silently dropped when received from a client.
    pub fn client_sendable(&self) -> bool {
        matches!(
            self,
            EventKind::Msg | EventKind::MsgFile | EventKind::TypingStart | EventKind::TypingStop
        )
    }

    /// Whitelist of kinds accepted from the cross-node bus. Anything outside
    /// the closed set already fails deserialization; this guard keeps the
    /// subscriber-side re-filter explicit should the set ever grow.
    pub fn allowed_from_bus(&self) -> bool {
        matches!(
            self,
            EventKind::Msg
                | EventKind::MsgFile
                | EventKind::MsgEdit
                | EventKind::MsgDelete
                | EventKind::Open
                | EventKind::Close
                | EventKind::Chatlog
                | EventKind::Presence
                | EventKind::TypingStart
                | EventKind::TypingStop
                | EventKind::Announce
                | EventKind::Warn
        )
    }

    /// Transient typing indicator kinds
    pub fn is_typing(&self) -> bool {
        matches!(self, EventKind::TypingStart | EventKind::TypingStop)
    }

    /// Kinds that are written to the message store
    pub fn is_persistent(&self) -> bool {
        matches!(self, EventKind::Msg)
    }
}

/// A chat event as it appears on the wire.
///
/// `owner` is recipient-dependent: it is stamped during fan-out when the
/// recipient equals the sender, never trusted from the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Event kind tag
    #[serde(rename = "Event")]
    pub kind: EventKind,
    /// Sender username (overwritten server-side with the authenticated identity)
    #[serde(rename = "User", default)]
    pub user: String,
    /// Message body
    #[serde(rename = "message", default)]
    pub body: String,
    /// True when the recipient of this copy is the sender
    #[serde(rename = "owner", default)]
    pub owner: bool,
    /// Room the event belongs to (overwritten server-side with the URL-bound room)
    #[serde(rename = "room_id", default)]
    pub room_id: String,
    /// Stable message id, assigned server-side before fan-out
    #[serde(rename = "message_id", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Id of the message this one replies to
    #[serde(rename = "reply_to", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// End-to-end encrypted payload marker; the server carries it opaquely
    #[serde(rename = "encrypted", default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,
    /// Per-recipient key material, carried opaquely
    #[serde(
        rename = "encrypted_keys",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub encrypted_keys: Option<HashMap<String, String>>,
    /// RFC 3339 creation timestamp, assigned server-side
    #[serde(rename = "created_at", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl ChatEvent {
    /// Create a bare event of the given kind
    pub fn new(kind: EventKind, user: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            kind,
            user: user.into(),
            body: String::new(),
            owner: false,
            room_id: room_id.into(),
            message_id: None,
            reply_to: None,
            encrypted: None,
            encrypted_keys: None,
            created_at: None,
        }
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the message id
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Synthetic presence notification; body is "online" or "offline"
    pub fn presence(room_id: &str, user: &str, online: bool) -> Self {
        ChatEvent::new(EventKind::Presence, user, room_id)
            .with_body(if online { "online" } else { "offline" })
    }

    /// Sender-only system warning
    pub fn system_warn(room_id: &str, body: &str) -> Self {
        ChatEvent::new(EventKind::Warn, "system", room_id).with_body(body)
    }

    /// Administrative broadcast
    pub fn announce(room_id: &str, user: &str, body: &str) -> Self {
        ChatEvent::new(EventKind::Announce, user, room_id).with_body(body)
    }
}

/// Escape HTML-significant characters in a message body before fan-out.
/// Matches the escaping applied by the REST rendering layer so stored and
/// live copies of a message agree.
pub fn escape_body(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    for c in body.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_field_names() {
        let event = ChatEvent::new(EventKind::Msg, "alice", "general")
            .with_body("hi")
            .with_message_id("abc123");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["Event"], "MSG");
        assert_eq!(json["User"], "alice");
        assert_eq!(json["message"], "hi");
        assert_eq!(json["owner"], false);
        assert_eq!(json["room_id"], "general");
        assert_eq!(json["message_id"], "abc123");
        // Unset optionals stay off the wire
        assert!(json.get("reply_to").is_none());
        assert!(json.get("encrypted").is_none());
        assert!(json.get("created_at").is_none());
    }

    #[test]
    fn test_roundtrip() {
        let mut event = ChatEvent::new(EventKind::MsgFile, "bob", "files");
        event.body = "https://example.com/cat.png".to_string();
        event.encrypted = Some(true);
        event.encrypted_keys = Some(HashMap::from([(
            "alice".to_string(),
            "a2V5".to_string(),
        )]));

        let json = serde_json::to_string(&event).unwrap();
        let back: ChatEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let json = r#"{"Event":"SHUTDOWN","User":"mallory","room_id":"general"}"#;
        assert!(serde_json::from_str::<ChatEvent>(json).is_err());
    }

    #[test]
    fn test_client_whitelist() {
        assert!(EventKind::Msg.client_sendable());
        assert!(EventKind::MsgFile.client_sendable());
        assert!(EventKind::TypingStart.client_sendable());
        assert!(EventKind::TypingStop.client_sendable());

        assert!(!EventKind::Open.client_sendable());
        assert!(!EventKind::Close.client_sendable());
        assert!(!EventKind::Presence.client_sendable());
        assert!(!EventKind::Announce.client_sendable());
        assert!(!EventKind::Warn.client_sendable());
        assert!(!EventKind::Chatlog.client_sendable());
    }

    #[test]
    fn test_escape_body() {
        assert_eq!(
            escape_body(r#"<script>alert("hi")</script>"#),
            "&lt;script&gt;alert(&#34;hi&#34;)&lt;/script&gt;"
        );
        assert_eq!(escape_body("a & b"), "a &amp; b");
        assert_eq!(escape_body("plain"), "plain");
    }
}
