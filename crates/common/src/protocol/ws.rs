// WebSocket frame types for the courier-chat.v1 protocol.
//
// Outbound frames are a serde-tagged enum. Inbound frames come in two
// shapes (`{type, chatId, ...}` and the legacy `{message_type, chat_id,
// sender_id, ...}`), so decoding reads the kind field first and then
// deserializes the kind-specific body. Unknown kinds decode to
// `ServerFrame::Unknown` instead of failing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{
    ChatMessage, DeliveryStatus, EventPayload, InboundEvent, MessageKind, PresenceStatus, ReplyRef,
};

pub const CURRENT_PROTOCOL_VERSION: &str = "courier-chat.v1";

// ── Client → Server ────────────────────────────────────────────────

/// All frames the client writes to the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Credential frame sent right after the socket opens.
    #[serde(rename_all = "camelCase")]
    Auth { token: String, user_id: String, protocol_version: String },

    /// Liveness probe; the server answers with `pong`.
    Ping,

    #[serde(rename_all = "camelCase")]
    Message {
        action_id: String,
        chat_id: String,
        content: String,
        message_type: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<ReplyRef>,
    },

    #[serde(rename_all = "camelCase")]
    Typing { action_id: String, chat_id: String, is_typing: bool },

    #[serde(rename_all = "camelCase")]
    Read { action_id: String, chat_id: String, message_id: String },
}

impl ClientFrame {
    pub fn auth(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::Auth {
            token: token.into(),
            user_id: user_id.into(),
            protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
        }
    }

    /// Serialize to the JSON text sent over the wire.
    pub fn encode(&self) -> String {
        // All variants are plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Server → Client ────────────────────────────────────────────────

/// Server verdict for a client action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckResult {
    Applied,
    /// The server had already applied this action id.
    Duplicate,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionAck {
    #[serde(alias = "action_id")]
    pub action_id: String,
    #[serde(default = "default_ack_result")]
    pub result: AckResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Message id assigned by the server, for `message` actions.
    #[serde(default, alias = "message_id", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

fn default_ack_result() -> AckResult {
    AckResult::Applied
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    AuthOk { user_id: Option<String> },
    AuthRejected { reason: String },
    Pong,
    Ack(ActionAck),
    Event(InboundEvent),
    Error { code: String, message: String },
    Unknown { kind: String },
}

impl ServerFrame {
    /// Frames consumed by the session layer itself (handshake and liveness).
    pub fn is_control(&self) -> bool {
        matches!(self, Self::AuthOk { .. } | Self::AuthRejected { .. } | Self::Pong)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("frame has no `type` or `message_type` field")]
    MissingKind,
    #[error("invalid `{kind}` frame: {reason}")]
    InvalidBody { kind: String, reason: String },
}

/// Decode one text frame.
pub fn decode_frame(text: &str) -> Result<ServerFrame, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|error| FrameError::Malformed(error.to_string()))?;
    let Value::Object(ref object) = value else {
        return Err(FrameError::Malformed("frame is not a JSON object".to_string()));
    };

    let kind = object
        .get("type")
        .or_else(|| object.get("message_type"))
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingKind)?
        .to_string();

    let frame = match kind.as_str() {
        "auth_ok" | "authenticated" => {
            let body: AuthOkBody = parse_body(&kind, value)?;
            ServerFrame::AuthOk { user_id: body.user_id }
        }
        "auth_error" | "unauthorized" => {
            let body: AuthErrorBody = parse_body(&kind, value)?;
            ServerFrame::AuthRejected {
                reason: body.reason.unwrap_or_else(|| "authentication rejected".to_string()),
            }
        }
        "pong" => ServerFrame::Pong,
        "ack" => ServerFrame::Ack(parse_body(&kind, value)?),
        "error" => {
            let body: ErrorBody = parse_body(&kind, value)?;
            ServerFrame::Error { code: body.code, message: body.message }
        }
        "message" => {
            let body: MessageBody = parse_body(&kind, value)?;
            ServerFrame::Event(body.into_event())
        }
        "typing" => {
            let body: TypingBody = parse_body(&kind, value)?;
            ServerFrame::Event(body.into_event(&kind)?)
        }
        "message_status" | "status" => {
            let body: StatusBody = parse_body(&kind, value)?;
            ServerFrame::Event(InboundEvent {
                event_id: body.event_id,
                chat_id: body.chat_id,
                payload: EventPayload::StatusChange {
                    message_id: body.message_id,
                    status: body.status,
                },
                server_timestamp: body.timestamp,
                synthetic: false,
            })
        }
        "user_status" | "presence" => {
            let body: PresenceBody = parse_body(&kind, value)?;
            ServerFrame::Event(InboundEvent {
                event_id: body.event_id,
                chat_id: body.chat_id,
                payload: EventPayload::Presence { user_id: body.user_id, status: body.user_status },
                server_timestamp: body.timestamp,
                synthetic: false,
            })
        }
        _ => ServerFrame::Unknown { kind },
    };

    Ok(frame)
}

fn parse_body<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T, FrameError> {
    serde_json::from_value(value)
        .map_err(|error| FrameError::InvalidBody { kind: kind.to_string(), reason: error.to_string() })
}

// ── Wire bodies ────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthOkBody {
    #[serde(default, alias = "user_id")]
    user_id: Option<String>,
}

#[derive(Deserialize)]
struct AuthErrorBody {
    #[serde(default, alias = "message")]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageBody {
    #[serde(default, alias = "event_id")]
    event_id: Option<String>,
    #[serde(default, alias = "chat_id")]
    chat_id: Option<String>,
    #[serde(default, alias = "group_id")]
    group_id: Option<String>,
    #[serde(default)]
    message: Option<ChatMessage>,
    // Legacy flat shape.
    #[serde(default, alias = "sender_id")]
    sender_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "message_id")]
    message_id: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl MessageBody {
    fn into_event(self) -> InboundEvent {
        let message = match self.message {
            Some(mut message) => {
                if message.timestamp.is_none() {
                    message.timestamp = self.timestamp;
                }
                if message.sender_id.is_none() {
                    message.sender_id = self.sender_id;
                }
                message
            }
            None => ChatMessage {
                id: self.message_id,
                content: self.content.unwrap_or_default(),
                sender_id: self.sender_id,
                timestamp: self.timestamp,
                ..Default::default()
            },
        };

        InboundEvent {
            event_id: self.event_id,
            chat_id: self.chat_id.or(self.group_id),
            server_timestamp: self.timestamp.or(message.timestamp),
            payload: EventPayload::Message { message },
            synthetic: false,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingBody {
    #[serde(default, alias = "event_id")]
    event_id: Option<String>,
    #[serde(default, alias = "chat_id")]
    chat_id: Option<String>,
    #[serde(default, alias = "group_id")]
    group_id: Option<String>,
    #[serde(default, alias = "user_id")]
    user_id: Option<String>,
    #[serde(default, alias = "sender_id")]
    sender_id: Option<String>,
    // The legacy input box sends typing frames without a flag.
    #[serde(default = "default_is_typing", alias = "is_typing")]
    is_typing: bool,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

fn default_is_typing() -> bool {
    true
}

impl TypingBody {
    fn into_event(self, kind: &str) -> Result<InboundEvent, FrameError> {
        let user_id = self.user_id.or(self.sender_id).ok_or_else(|| FrameError::InvalidBody {
            kind: kind.to_string(),
            reason: "missing user id".to_string(),
        })?;
        Ok(InboundEvent {
            event_id: self.event_id,
            chat_id: self.chat_id.or(self.group_id),
            payload: EventPayload::Typing { user_id, is_typing: self.is_typing },
            server_timestamp: self.timestamp,
            synthetic: false,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    #[serde(default, alias = "event_id")]
    event_id: Option<String>,
    #[serde(default, alias = "chat_id")]
    chat_id: Option<String>,
    #[serde(alias = "message_id")]
    message_id: String,
    status: DeliveryStatus,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresenceBody {
    #[serde(default, alias = "event_id")]
    event_id: Option<String>,
    #[serde(default, alias = "chat_id")]
    chat_id: Option<String>,
    #[serde(alias = "user_id")]
    user_id: String,
    #[serde(alias = "user_status", alias = "status")]
    user_status: PresenceStatus,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(frame: ServerFrame) -> InboundEvent {
        match frame {
            ServerFrame::Event(event) => event,
            other => panic!("expected event frame, got {other:?}"),
        }
    }

    #[test]
    fn decodes_rich_message_frame() {
        let frame = decode_frame(
            r#"{"type":"message","chatId":"42","message":{"id":"m1","content":"hi","senderId":"u7"}}"#,
        )
        .expect("frame should decode");
        let event = event(frame);
        assert_eq!(event.chat_id.as_deref(), Some("42"));
        match event.payload {
            EventPayload::Message { message } => {
                assert_eq!(message.id.as_deref(), Some("m1"));
                assert_eq!(message.content, "hi");
                assert_eq!(message.sender_id.as_deref(), Some("u7"));
            }
            other => panic!("expected message payload, got {other:?}"),
        }
    }

    #[test]
    fn decodes_legacy_message_frame() {
        let frame = decode_frame(
            r#"{"message_type":"message","chat_id":"7","sender_id":"u1","content":"yo","timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .expect("legacy frame should decode");
        let event = event(frame);
        assert_eq!(event.chat_id.as_deref(), Some("7"));
        assert!(event.server_timestamp.is_some());
        match event.payload {
            EventPayload::Message { message } => {
                assert_eq!(message.content, "yo");
                assert_eq!(message.sender_id.as_deref(), Some("u1"));
            }
            other => panic!("expected message payload, got {other:?}"),
        }
    }

    #[test]
    fn legacy_typing_frame_defaults_to_typing() {
        let frame = decode_frame(
            r#"{"message_type":"typing","chat_id":"7","sender_id":"u1","timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .expect("typing frame should decode");
        assert_eq!(
            event(frame).payload,
            EventPayload::Typing { user_id: "u1".into(), is_typing: true }
        );
    }

    #[test]
    fn decodes_status_and_presence() {
        let status = decode_frame(
            r#"{"type":"message_status","chatId":"1","messageId":"m1","status":"read"}"#,
        )
        .expect("status should decode");
        assert_eq!(
            event(status).payload,
            EventPayload::StatusChange { message_id: "m1".into(), status: DeliveryStatus::Read }
        );

        let presence =
            decode_frame(r#"{"type":"user_status","userId":"u2","userStatus":"away"}"#)
                .expect("presence should decode");
        assert_eq!(
            event(presence).payload,
            EventPayload::Presence { user_id: "u2".into(), status: PresenceStatus::Away }
        );
    }

    #[test]
    fn decodes_control_frames() {
        assert_eq!(
            decode_frame(r#"{"type":"auth_ok","userId":"u1"}"#).expect("auth_ok"),
            ServerFrame::AuthOk { user_id: Some("u1".into()) }
        );
        assert_eq!(
            decode_frame(r#"{"type":"auth_error","reason":"bad token"}"#).expect("auth_error"),
            ServerFrame::AuthRejected { reason: "bad token".into() }
        );
        assert_eq!(decode_frame(r#"{"type":"pong"}"#).expect("pong"), ServerFrame::Pong);
        assert!(ServerFrame::Pong.is_control());
    }

    #[test]
    fn decodes_ack_variants() {
        let ack = decode_frame(r#"{"type":"ack","actionId":"a1","result":"duplicate"}"#)
            .expect("ack should decode");
        assert_eq!(
            ack,
            ServerFrame::Ack(ActionAck {
                action_id: "a1".into(),
                result: AckResult::Duplicate,
                reason: None,
                message_id: None,
            })
        );

        let bare = decode_frame(r#"{"type":"ack","actionId":"a2"}"#).expect("bare ack");
        match bare {
            ServerFrame::Ack(ack) => assert_eq!(ack.result, AckResult::Applied),
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_not_an_error() {
        assert_eq!(
            decode_frame(r#"{"type":"reaction","emoji":"+1"}"#).expect("unknown kind"),
            ServerFrame::Unknown { kind: "reaction".into() }
        );
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(decode_frame("not json"), Err(FrameError::Malformed(_))));
        assert!(matches!(decode_frame("[1,2]"), Err(FrameError::Malformed(_))));
        assert_eq!(decode_frame(r#"{"chatId":"1"}"#), Err(FrameError::MissingKind));
        assert!(matches!(
            decode_frame(r#"{"type":"typing","chatId":"1"}"#),
            Err(FrameError::InvalidBody { .. })
        ));
    }

    #[test]
    fn client_frames_use_camel_case_fields() {
        let frame = ClientFrame::Typing { action_id: "a1".into(), chat_id: "42".into(), is_typing: true };
        let json: Value = serde_json::from_str(&frame.encode()).expect("encoded frame is JSON");
        assert_eq!(json["type"], "typing");
        assert_eq!(json["actionId"], "a1");
        assert_eq!(json["chatId"], "42");
        assert_eq!(json["isTyping"], true);

        let auth: Value =
            serde_json::from_str(&ClientFrame::auth("tok", "u1").encode()).expect("auth is JSON");
        assert_eq!(auth["type"], "auth");
        assert_eq!(auth["protocolVersion"], CURRENT_PROTOCOL_VERSION);
        assert_eq!(ClientFrame::Ping.encode(), r#"{"type":"ping"}"#);
    }
}
