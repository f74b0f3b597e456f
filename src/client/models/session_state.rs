use thiserror::Error;

use crate::common::models::{Message, UserId};

/// Stato di una Chat Session
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    /// Resolving the conversation, fetching history, opening the socket
    Loading,
    Connected,
    /// Waiting for the backoff before reconnect attempt `attempt` (1-based)
    Reconnecting { attempt: u32 },
    Closed,
    Error(SessionFailure),
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// Closed or Error: nothing more will happen without a new `open`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFailure {
    /// Resolve-or-create of the conversation failed
    ConversationUnavailable(String),
    /// No access token, or the backend rejected it
    Unauthenticated,
    /// The socket never opened and retries are exhausted
    TransportUnavailable,
}

impl std::fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionFailure::ConversationUnavailable(reason) => write!(f, "conversation unavailable: {}", reason),
            SessionFailure::Unauthenticated => write!(f, "not authenticated"),
            SessionFailure::TransportUnavailable => write!(f, "chat server unreachable"),
        }
    }
}

/// Fire-and-forget message for the user (toast, status line).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
        }
    }
}

/// Updates pushed to the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    StateChanged(SessionState),
    /// Full snapshot of the ordered message view
    MessagesChanged(Vec<Message>),
    PeerTyping(bool),
    Notice(Notice),
}

/// Commands accepted by `ChatService::run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Open { peer_id: UserId },
    Close,
    TextChanged(String),
    Send(String),
    SignedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("not connected to the chat")]
    NotConnected,
    #[error("message is empty")]
    EmptyMessage,
}
