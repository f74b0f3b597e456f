use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::config::ClientConfig;
use crate::client::models::{Notice, SendError, SessionFailure, SessionState, SessionUpdate};
use crate::client::services::api_client::{ApiError, ConversationApi};
use crate::client::services::auth::TokenProvider;
use crate::client::services::reconciler::{MessageReconciler, ReconcileOutcome};
use crate::client::services::transport::{socket_url, CloseReason, TransportEvent, TransportFactory, TransportSocket};
use crate::client::services::typing::{TypingDebouncer, TypingSignal};
use crate::common::models::{ClientMessageId, Conversation, ConversationId, Message, UserId};
use crate::common::protocol::{describe_frame, IncomingFrame, OutgoingFrame};

/// Input posted back to the event loop by spawned tasks.
///
/// `generation` identifies the session instance, `epoch` the transport within it.
#[derive(Debug)]
pub enum Inbound {
    ConversationResolved {
        generation: u64,
        result: Result<Conversation, ApiError>,
    },
    HistoryLoaded {
        generation: u64,
        result: Result<Vec<Message>, ApiError>,
    },
    Transport {
        generation: u64,
        epoch: u64,
        event: TransportEvent,
    },
    ReconnectDue {
        generation: u64,
        epoch: u64,
    },
}

impl Inbound {
    pub fn generation(&self) -> u64 {
        match self {
            Inbound::ConversationResolved { generation, .. }
            | Inbound::HistoryLoaded { generation, .. }
            | Inbound::Transport { generation, .. }
            | Inbound::ReconnectDue { generation, .. } => *generation,
        }
    }
}

pub type Inbox = mpsc::UnboundedSender<Inbound>;

/// Collaborators injected into every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub api: Arc<dyn ConversationApi>,
    pub tokens: Arc<dyn TokenProvider>,
    pub transports: Arc<dyn TransportFactory>,
    pub config: ClientConfig,
}

/// Real-time chat with one peer.
///
/// Every method runs on the owning event loop; network work is spawned and
/// reports back through the inbox.
pub struct ChatSession {
    generation: u64,
    peer_id: UserId,
    self_id: UserId,
    state: SessionState,
    conversation: Option<Conversation>,
    reconciler: Option<MessageReconciler>,
    transport: Option<Box<dyn TransportSocket>>,
    epoch: u64,
    attempt: u32,
    ever_connected: bool,
    debouncer: TypingDebouncer,
    peer_typing: bool,
    peer_typing_deadline: Option<Instant>,
    deps: SessionDeps,
    inbox: Inbox,
    updates: mpsc::UnboundedSender<SessionUpdate>,
}

impl ChatSession {
    pub fn new(
        generation: u64,
        peer_id: UserId,
        self_id: UserId,
        deps: SessionDeps,
        inbox: Inbox,
        updates: mpsc::UnboundedSender<SessionUpdate>,
    ) -> Self {
        let debouncer = TypingDebouncer::new(deps.config.typing_timeout);
        Self {
            generation,
            peer_id,
            self_id,
            state: SessionState::Idle,
            conversation: None,
            reconciler: None,
            transport: None,
            epoch: 0,
            attempt: 0,
            ever_connected: false,
            debouncer,
            peer_typing: false,
            peer_typing_deadline: None,
            deps,
            inbox,
            updates,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation.as_ref().map(|c| &c.id)
    }

    pub fn messages(&self) -> &[Message] {
        self.reconciler.as_ref().map(|r| r.messages()).unwrap_or(&[])
    }

    pub fn peer_typing(&self) -> bool {
        self.peer_typing
    }

    pub fn is_local_typing(&self) -> bool {
        self.debouncer.is_typing()
    }

    /// Idle -> Loading: resolve the conversation in the background.
    pub fn start(&mut self) {
        if self.state != SessionState::Idle {
            return;
        }
        info!("[CHAT_SESSION] Opening chat with {} (generation {})", self.peer_id, self.generation);
        self.set_state(SessionState::Loading);

        let api = self.deps.api.clone();
        let inbox = self.inbox.clone();
        let generation = self.generation;
        let peer_id = self.peer_id.clone();
        tokio::spawn(async move {
            let result = api.resolve_or_create_conversation(&peer_id).await;
            let _ = inbox.send(Inbound::ConversationResolved { generation, result });
        });
    }

    /// Route one inbox input. The caller has already checked the generation.
    pub fn handle(&mut self, input: Inbound) {
        match input {
            Inbound::ConversationResolved { result, .. } => self.on_conversation_resolved(result),
            Inbound::HistoryLoaded { result, .. } => self.on_history_loaded(result),
            Inbound::Transport { epoch, event, .. } => self.on_transport_event(epoch, event),
            Inbound::ReconnectDue { epoch, .. } => self.on_reconnect_due(epoch),
        }
    }

    fn on_conversation_resolved(&mut self, result: Result<Conversation, ApiError>) {
        if self.state != SessionState::Loading || self.conversation.is_some() {
            debug!("[CHAT_SESSION] Ignoring conversation result in state {:?}", self.state);
            return;
        }
        let conversation = match result {
            Ok(conversation) => conversation,
            Err(e) => {
                error!("[CHAT_SESSION] Unable to resolve conversation with {}: {}", self.peer_id, e);
                let failure = if e.is_auth_failure() {
                    SessionFailure::Unauthenticated
                } else {
                    SessionFailure::ConversationUnavailable(e.to_string())
                };
                self.fail(failure, Notice::new("Error", "Unable to load the conversation"));
                return;
            }
        };

        info!("[CHAT_SESSION] Conversation {} ready", conversation.id);
        self.reconciler = Some(MessageReconciler::new(conversation.id.clone(), self.self_id.clone()));
        let history_id = conversation.id.clone();
        self.conversation = Some(conversation);
        self.emit_messages();

        let api = self.deps.api.clone();
        let inbox = self.inbox.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = api.list_messages(&history_id).await;
            let _ = inbox.send(Inbound::HistoryLoaded { generation, result });
        });

        self.open_transport();
    }

    fn on_history_loaded(&mut self, result: Result<Vec<Message>, ApiError>) {
        let Some(reconciler) = self.reconciler.as_mut() else {
            return;
        };
        match result {
            Ok(history) => {
                let added = reconciler.seed_history(history);
                debug!("[CHAT_SESSION] Seeded {} history messages", added);
                self.emit_messages();
            }
            Err(e) => {
                warn!("[CHAT_SESSION] History unavailable: {}", e);
                self.notify(Notice::new("Error", "Unable to load the messages"));
            }
        }
    }

    /// Build and connect a fresh transport; any previous one is released first.
    fn open_transport(&mut self) {
        self.release_transport();

        let Some(conversation_id) = self.conversation_id().cloned() else {
            return;
        };
        let Some(token) = self.deps.tokens.access_token() else {
            warn!("[CHAT_SESSION] No access token, cannot open the chat socket");
            self.fail(SessionFailure::Unauthenticated, Notice::new("Error", "Please sign in again"));
            return;
        };
        let url = match socket_url(&self.deps.config.websocket_url, &conversation_id, &token) {
            Ok(url) => url,
            Err(e) => {
                error!("[CHAT_SESSION] {}", e);
                self.fail(SessionFailure::TransportUnavailable, Notice::new("Error", "Unable to reach the chat server"));
                return;
            }
        };

        self.epoch += 1;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let inbox = self.inbox.clone();
        let generation = self.generation;
        let epoch = self.epoch;
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if inbox.send(Inbound::Transport { generation, epoch, event }).is_err() {
                    break;
                }
            }
        });

        let mut transport = self.deps.transports.create(events_tx);
        if let Err(e) = transport.connect(url) {
            error!("[CHAT_SESSION] Socket connect rejected: {}", e);
            self.fail(SessionFailure::TransportUnavailable, Notice::new("Error", "Unable to reach the chat server"));
            return;
        }
        debug!("[CHAT_SESSION] Transport epoch {} connecting", epoch);
        self.transport = Some(transport);
    }

    fn on_transport_event(&mut self, epoch: u64, event: TransportEvent) {
        if epoch != self.epoch || self.transport.is_none() {
            debug!("[CHAT_SESSION] Dropping event from stale transport epoch {}", epoch);
            return;
        }
        match event {
            TransportEvent::Open => {
                if matches!(self.state, SessionState::Loading | SessionState::Reconnecting { .. }) {
                    self.attempt = 0;
                    self.ever_connected = true;
                    self.set_state(SessionState::Connected);
                }
            }
            TransportEvent::Message(frame) => self.on_frame(frame),
            TransportEvent::Closed(reason) => {
                match &reason {
                    CloseReason::Normal => info!("[CHAT_SESSION] Chat socket closed"),
                    CloseReason::Error(e) => warn!("[CHAT_SESSION] Chat socket failed: {}", e),
                }
                self.release_transport();
                self.debouncer.reset();
                self.set_peer_typing(false);
                self.schedule_reconnect();
            }
        }
    }

    fn on_frame(&mut self, frame: IncomingFrame) {
        if !self.state.is_connected() {
            debug!("[CHAT_SESSION] Frame received while {:?}, dropped", self.state);
            return;
        }
        if let Some(conversation_id) = self.conversation_id() {
            debug!("[CHAT_SESSION] Received {}", describe_frame(&frame, conversation_id));
        }
        match frame {
            IncomingFrame::TypingStatus { is_typing, sender_id } => {
                if sender_id.as_deref() == Some(self.self_id.as_str()) {
                    return;
                }
                self.peer_typing_deadline = if is_typing {
                    Some(Instant::now() + self.deps.config.peer_typing_timeout)
                } else {
                    None
                };
                self.set_peer_typing(is_typing);
            }
            IncomingFrame::ChatMessage(chat) => {
                let Some(reconciler) = self.reconciler.as_mut() else {
                    return;
                };
                let message = chat.into_message(reconciler.conversation_id());
                if reconciler.append_remote(message) != ReconcileOutcome::Duplicate {
                    self.emit_messages();
                }
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        self.attempt += 1;
        match self.deps.config.reconnect.delay_for(self.attempt) {
            Some(delay) => {
                info!("[CHAT_SESSION] Reconnect attempt {} in {:?}", self.attempt, delay);
                self.set_state(SessionState::Reconnecting { attempt: self.attempt });
                let inbox = self.inbox.clone();
                let generation = self.generation;
                let epoch = self.epoch;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inbox.send(Inbound::ReconnectDue { generation, epoch });
                });
            }
            None => {
                warn!("[CHAT_SESSION] Giving up after {} reconnect attempts", self.attempt - 1);
                let notice = Notice::new("Connection lost", "Unable to reach the chat server");
                if self.ever_connected {
                    self.set_state(SessionState::Closed);
                    self.notify(notice);
                } else {
                    self.fail(SessionFailure::TransportUnavailable, notice);
                }
            }
        }
    }

    fn on_reconnect_due(&mut self, epoch: u64) {
        if epoch != self.epoch || !matches!(self.state, SessionState::Reconnecting { .. }) {
            debug!("[CHAT_SESSION] Ignoring stale reconnect timer (epoch {})", epoch);
            return;
        }
        self.open_transport();
    }

    /// Optimistically append `text` and send it. Returns the correlation id.
    pub fn send_message(&mut self, text: &str) -> Result<ClientMessageId, SendError> {
        if !self.state.is_connected() {
            return Err(SendError::NotConnected);
        }
        if text.trim().is_empty() {
            return Err(SendError::EmptyMessage);
        }
        let (Some(reconciler), Some(transport)) = (self.reconciler.as_mut(), self.transport.as_ref()) else {
            return Err(SendError::NotConnected);
        };

        let local = reconciler.append_local(text, Utc::now());
        let client_id = match local.client_id {
            Some(client_id) => client_id,
            None => return Err(SendError::NotConnected),
        };
        if !transport.send(&OutgoingFrame::Chat {
            message: text.to_string(),
            client_id,
        }) {
            warn!("[CHAT_SESSION] Message {} not delivered to the socket", client_id);
        }
        self.emit_messages();
        Ok(client_id)
    }

    /// Keystroke in the composer. Ignored unless connected, so a burst always
    /// starts with a `true` on the wire.
    pub fn on_local_text_changed(&mut self, text: &str) {
        if !self.state.is_connected() {
            return;
        }
        if let Some(signal) = self.debouncer.on_local_text_changed(text, Instant::now()) {
            self.send_typing(signal);
        }
    }

    /// Earliest timer the event loop must wake up for.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.debouncer.deadline(), self.peer_typing_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_timer(&mut self, now: Instant) {
        if let Some(signal) = self.debouncer.on_timer(now) {
            self.send_typing(signal);
        }
        if matches!(self.peer_typing_deadline, Some(deadline) if deadline <= now) {
            self.peer_typing_deadline = None;
            self.set_peer_typing(false);
        }
    }

    /// Explicit close (navigation away, sign-out, conversation switch).
    pub fn close(&mut self) {
        if let Some(signal) = self.debouncer.reset() {
            self.send_typing(signal);
        }
        self.release_transport();
        self.set_peer_typing(false);
        if !self.state.is_terminal() {
            info!("[CHAT_SESSION] Closing chat with {}", self.peer_id);
            self.set_state(SessionState::Closed);
        }
    }

    fn send_typing(&self, signal: TypingSignal) {
        let sent = match (&self.transport, self.state.is_connected()) {
            (Some(transport), true) => transport.send(&OutgoingFrame::TypingStatus {
                is_typing: signal.is_typing(),
            }),
            _ => false,
        };
        if !sent {
            debug!("[CHAT_SESSION] Typing signal {:?} dropped", signal);
        }
    }

    fn release_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect();
        }
    }

    fn fail(&mut self, failure: SessionFailure, notice: Notice) {
        self.release_transport();
        self.debouncer.reset();
        self.set_peer_typing(false);
        self.set_state(SessionState::Error(failure));
        self.notify(notice);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!("[CHAT_SESSION] {:?} -> {:?}", self.state, state);
        self.state = state.clone();
        self.emit(SessionUpdate::StateChanged(state));
    }

    fn set_peer_typing(&mut self, typing: bool) {
        if !typing {
            self.peer_typing_deadline = None;
        }
        if self.peer_typing != typing {
            self.peer_typing = typing;
            self.emit(SessionUpdate::PeerTyping(typing));
        }
    }

    fn emit_messages(&self) {
        self.emit(SessionUpdate::MessagesChanged(self.messages().to_vec()));
    }

    fn notify(&self, notice: Notice) {
        self.emit(SessionUpdate::Notice(notice));
    }

    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }
}
