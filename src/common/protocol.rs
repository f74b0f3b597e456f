use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::models::{deserialize_id, deserialize_opt_id, ClientMessageId, ConversationId, Message, MessageId, Provenance, UserId};

pub const TYPING_STATUS: &str = "typing_status";
pub const CHAT_MESSAGE: &str = "chat_message";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON frame: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("unknown frame type: {0}")]
    UnknownType(String),
}

/// Chat message frame as delivered by the server.
///
/// `id`, `client_id` and `is_read` are optional: older servers send only
/// `{message, sender_id, timestamp}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatFrame {
    pub message: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub sender_id: UserId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub client_id: Option<ClientMessageId>,
    #[serde(default)]
    pub is_read: Option<bool>,
}

impl ChatFrame {
    /// Turn the frame into a confirmed message of `conversation_id`.
    pub fn into_message(self, conversation_id: &str) -> Message {
        let id = self
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Message {
            id,
            conversation_id: conversation_id.to_string(),
            sender_id: self.sender_id,
            content: self.message,
            timestamp: self.timestamp,
            is_read: self.is_read,
            provenance: Provenance::Confirmed,
            client_id: self.client_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TypingFrame {
    is_typing: bool,
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    sender_id: Option<UserId>,
}

/// Frames the server can push on the chat socket.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingFrame {
    TypingStatus { is_typing: bool, sender_id: Option<UserId> },
    ChatMessage(ChatFrame),
}

/// Frames the client sends on the chat socket.
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingFrame {
    Chat { message: String, client_id: ClientMessageId },
    TypingStatus { is_typing: bool },
}

#[derive(Serialize)]
struct ChatPayload<'a> {
    message: &'a str,
    client_id: ClientMessageId,
}

#[derive(Serialize)]
struct TypingPayload {
    #[serde(rename = "type")]
    kind: &'static str,
    is_typing: bool,
}

impl OutgoingFrame {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let json = match self {
            OutgoingFrame::Chat { message, client_id } => serde_json::to_string(&ChatPayload {
                message,
                client_id: *client_id,
            })?,
            OutgoingFrame::TypingStatus { is_typing } => serde_json::to_string(&TypingPayload {
                kind: TYPING_STATUS,
                is_typing: *is_typing,
            })?,
        };
        Ok(json)
    }
}

/// Decode one text frame received from the chat socket.
///
/// Frames without a `type` field are chat messages.
pub fn decode_frame(text: &str) -> Result<IncomingFrame, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }

    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    match kind.as_deref() {
        Some(TYPING_STATUS) => {
            let frame: TypingFrame = serde_json::from_value(value)?;
            Ok(IncomingFrame::TypingStatus {
                is_typing: frame.is_typing,
                sender_id: frame.sender_id,
            })
        }
        Some(CHAT_MESSAGE) | None => {
            let frame: ChatFrame = serde_json::from_value(value)?;
            Ok(IncomingFrame::ChatMessage(frame))
        }
        Some(other) => Err(ProtocolError::UnknownType(other.to_string())),
    }
}

/// Short description of a frame for log lines (never includes message content).
pub fn describe_frame(frame: &IncomingFrame, conversation_id: &ConversationId) -> String {
    match frame {
        IncomingFrame::TypingStatus { is_typing, .. } => {
            format!("typing_status({}) in {}", is_typing, conversation_id)
        }
        IncomingFrame::ChatMessage(chat) => {
            format!("chat_message from {} in {}", chat.sender_id, conversation_id)
        }
    }
}
