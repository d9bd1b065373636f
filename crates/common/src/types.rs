// Core domain types shared across all Courier crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Media kind of a chat message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Video,
    Audio,
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    /// Set locally on an optimistic echo whose send was never delivered.
    Failed,
}

/// Online status of a user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
}

/// Quoted message a reply points at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyRef {
    pub id: String,
    pub content: String,
}

/// A chat message as exchanged with the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server-assigned message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "sender_id", skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, rename = "type")]
    pub kind: MessageKind,
    #[serde(default, alias = "media_url", skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, alias = "reply_to", skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,
    /// Echo of the client action id that produced this message, if any.
    #[serde(default, alias = "client_id", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

// ── Inbound events ─────────────────────────────────────────────────

/// Classification used for subscriptions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Typing,
    StatusChange,
    Presence,
}

impl EventKind {
    pub const ALL: [EventKind; 4] =
        [EventKind::Message, EventKind::Typing, EventKind::StatusChange, EventKind::Presence];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Typing => "typing",
            Self::StatusChange => "status_change",
            Self::Presence => "presence",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Message { message: ChatMessage },
    Typing { user_id: String, is_typing: bool },
    StatusChange { message_id: String, status: DeliveryStatus },
    Presence { user_id: String, status: PresenceStatus },
}

/// A decoded, classified server notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    pub payload: EventPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<DateTime<Utc>>,
    /// Generated locally (typing expiry, history replay) rather than pushed by the server.
    #[serde(default)]
    pub synthetic: bool,
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Message { .. } => EventKind::Message,
            EventPayload::Typing { .. } => EventKind::Typing,
            EventPayload::StatusChange { .. } => EventKind::StatusChange,
            EventPayload::Presence { .. } => EventKind::Presence,
        }
    }

    /// Identity used for at-most-once delivery.
    ///
    /// Server event id first, then the message id, then a content hash when
    /// the frame carries a timestamp. Returns `None` when the event has no
    /// stable identity (e.g. an untimestamped typing refresh).
    pub fn dedup_key(&self) -> Option<String> {
        if let Some(event_id) = &self.event_id {
            return Some(format!("evt:{event_id}"));
        }
        if let EventPayload::Message { message } = &self.payload {
            if let Some(id) = &message.id {
                return Some(format!("msg:{id}"));
            }
        }
        let timestamp = self.server_timestamp.or(match &self.payload {
            EventPayload::Message { message } => message.timestamp,
            _ => None,
        })?;

        let mut hasher = Sha256::new();
        hasher.update(self.kind().as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.chat_id.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        // Serializing our own enum cannot fail.
        hasher.update(serde_json::to_vec(&self.payload).unwrap_or_default());
        hasher.update([0u8]);
        hasher.update(timestamp.to_rfc3339().as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
        Some(format!("sha:{hex}"))
    }
}
