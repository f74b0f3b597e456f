//! Fakes for driving a `ChatService` without network access.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ruggine_chat::client::config::ClientConfig;
use ruggine_chat::client::models::SessionUpdate;
use ruggine_chat::client::services::api_client::{ApiError, ConversationApi};
use ruggine_chat::client::services::auth::{Session, SessionStore};
use ruggine_chat::client::services::chat_service::ChatService;
use ruggine_chat::client::services::chat_session::SessionDeps;
use ruggine_chat::client::services::transport::{
    CloseReason, TransportError, TransportEvent, TransportEvents, TransportFactory, TransportSocket,
};
use ruggine_chat::common::models::{ConnectionState, Conversation, Message, Provenance, User};
use ruggine_chat::common::protocol::{IncomingFrame, OutgoingFrame};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use url::Url;

pub const SELF_ID: &str = "me";

struct Slot {
    events: TransportEvents,
    state: ConnectionState,
    url: Option<Url>,
    sent: Vec<OutgoingFrame>,
}

#[derive(Default)]
struct NetState {
    log: Vec<String>,
    sockets: Vec<Slot>,
}

/// Transport factory whose sockets are opened, closed and fed by the test.
#[derive(Clone, Default)]
pub struct FakeNetwork {
    inner: Arc<Mutex<NetState>>,
}

impl FakeNetwork {
    /// "create:N", "connect:N" and "disconnect:N" entries in call order.
    pub fn log(&self) -> Vec<String> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().sockets.len()
    }

    pub fn live_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .sockets
            .iter()
            .filter(|s| s.state.is_live())
            .count()
    }

    pub fn state(&self, index: usize) -> ConnectionState {
        self.inner.lock().unwrap().sockets[index].state
    }

    pub fn url(&self, index: usize) -> Option<Url> {
        self.inner.lock().unwrap().sockets[index].url.clone()
    }

    pub fn sent(&self, index: usize) -> Vec<OutgoingFrame> {
        self.inner.lock().unwrap().sockets[index].sent.clone()
    }

    /// Complete the handshake of socket `index`.
    pub fn open(&self, index: usize) {
        let mut net = self.inner.lock().unwrap();
        let slot = &mut net.sockets[index];
        slot.state = ConnectionState::Open;
        let _ = slot.events.send(TransportEvent::Open);
    }

    /// Server-side close or network failure of socket `index`.
    pub fn close(&self, index: usize, reason: CloseReason) {
        let mut net = self.inner.lock().unwrap();
        let slot = &mut net.sockets[index];
        slot.state = match reason {
            CloseReason::Normal => ConnectionState::Closed,
            CloseReason::Error(_) => ConnectionState::Error,
        };
        let _ = slot.events.send(TransportEvent::Closed(reason));
    }

    /// Push a frame as if the server sent it on socket `index`, whatever its state.
    pub fn deliver(&self, index: usize, frame: IncomingFrame) {
        let net = self.inner.lock().unwrap();
        let _ = net.sockets[index].events.send(TransportEvent::Message(frame));
    }
}

impl TransportFactory for FakeNetwork {
    fn create(&self, events: TransportEvents) -> Box<dyn TransportSocket> {
        let mut net = self.inner.lock().unwrap();
        let index = net.sockets.len();
        net.sockets.push(Slot {
            events,
            state: ConnectionState::Idle,
            url: None,
            sent: Vec::new(),
        });
        net.log.push(format!("create:{}", index));
        Box::new(FakeSocket {
            index,
            net: self.inner.clone(),
        })
    }
}

struct FakeSocket {
    index: usize,
    net: Arc<Mutex<NetState>>,
}

impl TransportSocket for FakeSocket {
    fn connect(&mut self, url: Url) -> Result<(), TransportError> {
        let mut net = self.net.lock().unwrap();
        let slot = &mut net.sockets[self.index];
        if slot.state.is_live() {
            return Err(TransportError::AlreadyActive);
        }
        slot.state = ConnectionState::Connecting;
        slot.url = Some(url);
        net.log.push(format!("connect:{}", self.index));
        Ok(())
    }

    fn send(&self, frame: &OutgoingFrame) -> bool {
        let mut net = self.net.lock().unwrap();
        let slot = &mut net.sockets[self.index];
        if slot.state != ConnectionState::Open {
            return false;
        }
        slot.sent.push(frame.clone());
        true
    }

    fn disconnect(&mut self) {
        let mut net = self.net.lock().unwrap();
        let slot = &mut net.sockets[self.index];
        if slot.state.is_live() {
            slot.state = ConnectionState::Closed;
            net.log.push(format!("disconnect:{}", self.index));
        }
    }

    fn state(&self) -> ConnectionState {
        self.net.lock().unwrap().sockets[self.index].state
    }
}

#[derive(Default)]
struct ApiState {
    conversations: HashMap<String, Conversation>,
    histories: HashMap<String, Vec<Message>>,
    gates: HashMap<String, Arc<Notify>>,
    broken_histories: Vec<String>,
    session_expired: bool,
}

/// In-memory conversation backend.
#[derive(Default)]
pub struct FakeApi {
    inner: Mutex<ApiState>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conversation(self, peer_id: &str, conversation_id: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .conversations
            .insert(peer_id.to_string(), conversation(conversation_id, peer_id));
        self
    }

    pub fn with_history(self, conversation_id: &str, history: Vec<Message>) -> Self {
        self.inner
            .lock()
            .unwrap()
            .histories
            .insert(conversation_id.to_string(), history);
        self
    }

    /// History of `conversation_id` fails with a server error.
    pub fn with_broken_history(self, conversation_id: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .broken_histories
            .push(conversation_id.to_string());
        self
    }

    /// Every request fails as after a rejected token refresh.
    pub fn with_expired_session(self) -> Self {
        self.inner.lock().unwrap().session_expired = true;
        self
    }

    /// Hold the history response of `conversation_id` until the returned gate is notified.
    pub fn gate_history(&self, conversation_id: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.inner
            .lock()
            .unwrap()
            .gates
            .insert(conversation_id.to_string(), gate.clone());
        gate
    }
}

#[async_trait]
impl ConversationApi for FakeApi {
    async fn resolve_or_create_conversation(&self, peer_user_id: &str) -> Result<Conversation, ApiError> {
        let state = self.inner.lock().unwrap();
        if state.session_expired {
            return Err(ApiError::SessionExpired);
        }
        state
            .conversations
            .get(peer_user_id)
            .cloned()
            .ok_or_else(|| ApiError::Status {
                status: 404,
                message: format!("no user {}", peer_user_id),
            })
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, ApiError> {
        let gate = self.inner.lock().unwrap().gates.get(conversation_id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let state = self.inner.lock().unwrap();
        if state.session_expired {
            return Err(ApiError::SessionExpired);
        }
        if state.broken_histories.iter().any(|c| c == conversation_id) {
            return Err(ApiError::Status {
                status: 500,
                message: "history unavailable".to_string(),
            });
        }
        Ok(state
            .histories
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn user(id: &str) -> User {
    User {
        id: id.to_string(),
        email: format!("{}@ruggine.test", id),
        first_name: String::new(),
        last_name: String::new(),
        is_active: true,
        avatar_url: String::new(),
        status: true,
    }
}

pub fn conversation(id: &str, peer_id: &str) -> Conversation {
    Conversation {
        id: id.to_string(),
        participants: vec![user(SELF_ID), user(peer_id)],
        created_at: at(0),
        updated_at: at(0),
    }
}

pub fn history_message(id: &str, conversation_id: &str, sender: &str, content: &str, secs: i64) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender.to_string(),
        content: content.to_string(),
        timestamp: at(secs),
        is_read: Some(true),
        provenance: Provenance::Confirmed,
        client_id: None,
    }
}

/// Defaults with a deterministic backoff: 2s, 4s, 8s... capped at 30s.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::with_api_url(Url::parse("http://chat.test").unwrap());
    config.reconnect.jitter = 0.0;
    config
}

pub struct Harness {
    pub service: ChatService,
    pub updates: mpsc::UnboundedReceiver<SessionUpdate>,
    pub net: FakeNetwork,
    pub api: Arc<FakeApi>,
    pub session: SessionStore,
}

pub fn harness(api: FakeApi) -> Harness {
    harness_with(api, test_config())
}

pub fn harness_with(api: FakeApi, config: ClientConfig) -> Harness {
    let net = FakeNetwork::default();
    let api = Arc::new(api);
    let session = SessionStore::with_session(Session {
        access: "tok".to_string(),
        refresh: "ref".to_string(),
    });
    let deps = SessionDeps {
        api: api.clone(),
        tokens: Arc::new(session.clone()),
        transports: Arc::new(net.clone()),
        config,
    };
    let (service, updates) = ChatService::new(deps, SELF_ID.to_string());
    Harness {
        service,
        updates,
        net,
        api,
        session,
    }
}

impl Harness {
    /// Let spawned tasks run and process everything they posted.
    pub async fn settle(&mut self) {
        for _ in 0..50 {
            tokio::task::yield_now().await;
            self.service.poll_pending();
        }
    }

    pub async fn advance(&mut self, millis: u64) {
        tokio::time::advance(Duration::from_millis(millis)).await;
        self.settle().await;
    }

    /// Open the chat with `peer_id` and complete the handshake of the newest socket.
    pub async fn connect(&mut self, peer_id: &str) -> usize {
        self.service.open_conversation(peer_id);
        self.settle().await;
        let index = self.net.count() - 1;
        self.net.open(index);
        self.settle().await;
        index
    }

    pub fn drain_updates(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = self.updates.try_recv() {
            updates.push(update);
        }
        updates
    }
}
