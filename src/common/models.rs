use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = String;
pub type ConversationId = String;
pub type MessageId = String;
/// Correlation id generated by the client for an optimistic message.
pub type ClientMessageId = Uuid;

/// The backend serializes primary keys either as strings or as integers.
pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}

pub(crate) fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapped(#[serde(deserialize_with = "deserialize_id")] String);

    Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|w| w.0))
}

/// Rappresenta un utente del backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: UserId,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub avatar_url: String,
    /// Online status as reported by the backend
    #[serde(default)]
    pub status: bool,
}

impl User {
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() {
            self.email.clone()
        } else {
            name.to_string()
        }
    }
}

/// Conversazione tra due utenti, creata lato server al primo contatto
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: ConversationId,
    pub participants: Vec<User>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// Authored locally, shown before the server confirmed it
    Provisional,
    /// Delivered by the transport or by the history endpoint
    Confirmed,
}

/// Rappresenta un messaggio nella chat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Only confirmed messages carry a read flag
    pub is_read: Option<bool>,
    pub provenance: Provenance,
    pub client_id: Option<ClientMessageId>,
}

impl Message {
    pub fn is_provisional(&self) -> bool {
        self.provenance == Provenance::Provisional
    }
}

/// Stato della connessione di un Transport Socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
    Error,
}

impl ConnectionState {
    /// A socket in these states counts as the live socket of its transport.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}
