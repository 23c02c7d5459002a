//! Events pushed to client sessions and the envelope that carries them
//! between nodes.
//!
//! [`Event`] is a closed union: every consumer (write pump, shard broadcast,
//! cross-node consumer) matches on it exhaustively.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, SessionId, TenantId, UserId};

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

/// A chat event delivered to connected clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    /// A message was posted to a conversation.
    NewMessage(NewMessage),
    /// A message was removed from a conversation.
    DeleteMessage(DeleteMessage),
    /// Liveness probe addressed to one session.
    Ping(Ping),
}

impl Event {
    /// Short name used in logs and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewMessage(_) => "new_message",
            Self::DeleteMessage(_) => "delete_message",
            Self::Ping(_) => "ping",
        }
    }

    /// Conversation the event belongs to, if any.
    #[must_use]
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::NewMessage(m) => Some(&m.conversation_id),
            Self::DeleteMessage(m) => Some(&m.conversation_id),
            Self::Ping(_) => None,
        }
    }

    /// Message the event refers to, if any.
    #[must_use]
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::NewMessage(m) => Some(&m.message_id),
            Self::DeleteMessage(m) => Some(&m.message_id),
            Self::Ping(_) => None,
        }
    }

    /// Build a ping addressed to `session_id`.
    #[must_use]
    pub fn ping(session_id: SessionId) -> Self {
        Self::Ping(Ping { session_id })
    }
}

/// Content type of a chat message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// Image attachment.
    Image,
    /// File attachment.
    File,
    /// System-generated notice.
    System,
}

/// Payload of [`Event::NewMessage`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    /// Conversation the message was posted to.
    pub conversation_id: ConversationId,
    /// Message id.
    pub message_id: MessageId,
    /// Display name of the conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_name: Option<String>,
    /// Author, absent for system messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    /// Message body.
    #[serde(default)]
    pub content: String,
    /// Content type.
    #[serde(default)]
    pub kind: MessageKind,
    /// Media location for image/file messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_media: Option<String>,
    /// Client-side id echoed back to the sender's devices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_message_id: Option<String>,
    /// Recipient a message is specifically aimed at, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user: Option<UserId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Payload of [`Event::DeleteMessage`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    /// Conversation the message belonged to.
    pub conversation_id: ConversationId,
    /// Deleted message id.
    pub message_id: MessageId,
    /// Who deleted it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<UserId>,
    /// Deletion time.
    pub deleted_at: DateTime<Utc>,
}

/// Payload of [`Event::Ping`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    /// Session the ping is addressed to.
    pub session_id: SessionId,
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelopes
// ─────────────────────────────────────────────────────────────────────────────

/// An event bound to the tenant it was produced in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopedEvent {
    /// Tenant that must match the receiving session.
    pub tenant_id: TenantId,
    /// The event itself.
    pub event: Event,
}

impl ScopedEvent {
    /// Pair an event with its tenant.
    #[must_use]
    pub fn new(tenant_id: TenantId, event: Event) -> Self {
        Self { tenant_id, event }
    }
}

/// Envelope published on the pub/sub bus so other nodes can deliver to
/// their local sessions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossNodeEnvelope {
    /// Tenant of the event.
    pub tenant_id: TenantId,
    /// The event to deliver.
    pub event: Event,
    /// Recipients grouped by the node holding their sessions.
    pub node_receive: HashMap<String, Vec<UserId>>,
}

impl CrossNodeEnvelope {
    /// Recipients this node should deliver to, if it has an entry.
    #[must_use]
    pub fn recipients_for(&self, node: &str) -> Option<&[UserId]> {
        self.node_receive.get(node).map(Vec::as_slice)
    }

    /// Split back into the scoped event.
    #[must_use]
    pub fn scoped(&self) -> ScopedEvent {
        ScopedEvent::new(self.tenant_id.clone(), self.event.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message() -> Event {
        Event::NewMessage(NewMessage {
            conversation_id: ConversationId::from("c1"),
            message_id: MessageId::from("m1"),
            conversation_name: Some("Math 101".into()),
            sender_id: Some(UserId::from("u1")),
            content: "hello".into(),
            kind: MessageKind::Text,
            url_media: None,
            local_message_id: None,
            target_user: None,
            created_at: Utc::now(),
        })
    }

    #[test]
    fn event_is_tagged_by_type() {
        let json = serde_json::to_value(Event::ping(SessionId::from("s1"))).unwrap();
        assert_eq!(json["type"], "ping");
        assert_eq!(json["sessionId"], "s1");
    }

    #[test]
    fn new_message_uses_camel_case_and_skips_empty_options() {
        let json = serde_json::to_value(new_message()).unwrap();
        assert_eq!(json["type"], "newMessage");
        assert_eq!(json["conversationId"], "c1");
        assert_eq!(json["kind"], "text");
        assert!(json.get("urlMedia").is_none());
    }

    #[test]
    fn new_message_tolerates_missing_optional_fields() {
        let event: Event = serde_json::from_str(
            r#"{"type":"newMessage","conversationId":"c","messageId":"m","createdAt":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let Event::NewMessage(msg) = event else {
            panic!("expected new message");
        };
        assert_eq!(msg.kind, MessageKind::Text);
        assert!(msg.content.is_empty());
        assert!(msg.sender_id.is_none());
    }

    #[test]
    fn audit_fields() {
        let event = new_message();
        assert_eq!(event.kind(), "new_message");
        assert_eq!(event.conversation_id().map(ConversationId::as_str), Some("c1"));
        assert_eq!(event.message_id().map(MessageId::as_str), Some("m1"));

        let ping = Event::ping(SessionId::from("s"));
        assert_eq!(ping.kind(), "ping");
        assert!(ping.conversation_id().is_none());
    }

    #[test]
    fn envelope_extracts_own_node_only() {
        let mut node_receive = HashMap::new();
        let _ = node_receive.insert("n2".to_owned(), vec![UserId::from("b")]);
        let envelope = CrossNodeEnvelope {
            tenant_id: TenantId::from("t"),
            event: new_message(),
            node_receive,
        };
        assert_eq!(envelope.recipients_for("n2"), Some(&[UserId::from("b")][..]));
        assert!(envelope.recipients_for("n1").is_none());

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["nodeReceive"]["n2"][0], "b");
        assert_eq!(json["tenantId"], "t");
    }
}
