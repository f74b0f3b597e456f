use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::client::models::{ChatCommand, Notice, SendError, SessionState, SessionUpdate};
use crate::client::services::chat_session::{ChatSession, Inbound, Inbox, SessionDeps};
use crate::common::models::{ClientMessageId, Message, UserId};

enum Wake {
    Command(Option<ChatCommand>),
    Input(Option<Inbound>),
    Timer,
}

/// Owns the active chat session and runs the single event loop that drives it.
///
/// At most one session exists at a time; opening another conversation tears
/// the current one down first. Each session gets a new generation, and inbox
/// inputs from older generations are discarded.
pub struct ChatService {
    deps: SessionDeps,
    self_id: UserId,
    inbox_tx: Inbox,
    inbox_rx: mpsc::UnboundedReceiver<Inbound>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    generation: u64,
    session: Option<ChatSession>,
}

impl ChatService {
    /// Returns the service and the receiver of UI updates.
    pub fn new(deps: SessionDeps, self_id: UserId) -> (Self, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let service = Self {
            deps,
            self_id,
            inbox_tx,
            inbox_rx,
            updates,
            generation: 0,
            session: None,
        };
        (service, updates_rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session(&self) -> Option<&ChatSession> {
        self.session.as_ref()
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state().clone())
            .unwrap_or_default()
    }

    pub fn messages(&self) -> &[Message] {
        self.session.as_ref().map(|s| s.messages()).unwrap_or(&[])
    }

    /// Switch to the conversation with `peer_id`.
    pub fn open_conversation(&mut self, peer_id: impl Into<UserId>) {
        let peer_id = peer_id.into();
        if let Some(mut previous) = self.session.take() {
            info!("[CHAT_SERVICE] Leaving chat with {}", previous.peer_id());
            previous.close();
        }
        self.generation += 1;
        let mut session = ChatSession::new(
            self.generation,
            peer_id,
            self.self_id.clone(),
            self.deps.clone(),
            self.inbox_tx.clone(),
            self.updates.clone(),
        );
        session.start();
        self.session = Some(session);
    }

    pub fn close_conversation(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.close();
        }
    }

    pub fn sign_out(&mut self) {
        info!("[CHAT_SERVICE] Signed out, closing chat");
        self.close_conversation();
    }

    pub fn send_message(&mut self, text: &str) -> Result<ClientMessageId, SendError> {
        match self.session.as_mut() {
            Some(session) => session.send_message(text),
            None => Err(SendError::NotConnected),
        }
    }

    pub fn on_local_text_changed(&mut self, text: &str) {
        if let Some(session) = self.session.as_mut() {
            session.on_local_text_changed(text);
        }
    }

    /// Process every input already queued and any expired timer, without waiting.
    pub fn poll_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(input) = self.inbox_rx.try_recv() {
            self.dispatch(input);
            handled += 1;
        }
        if matches!(self.next_deadline(), Some(deadline) if deadline <= Instant::now()) {
            self.process(Wake::Timer);
            handled += 1;
        }
        handled
    }

    /// Drive the service from UI commands until the command channel closes.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ChatCommand>) {
        info!("[CHAT_SERVICE] Event loop started");
        loop {
            let deadline = self.next_deadline();
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                input = self.inbox_rx.recv() => Wake::Input(input),
                _ = wait_until(deadline) => Wake::Timer,
            };
            if matches!(wake, Wake::Command(None)) {
                break;
            }
            self.process(wake);
        }
        self.close_conversation();
        info!("[CHAT_SERVICE] Event loop stopped");
    }

    pub fn execute(&mut self, command: ChatCommand) {
        match command {
            ChatCommand::Open { peer_id } => self.open_conversation(peer_id),
            ChatCommand::Close => self.close_conversation(),
            ChatCommand::TextChanged(text) => self.on_local_text_changed(&text),
            ChatCommand::Send(text) => {
                if let Err(e) = self.send_message(&text) {
                    warn!("[CHAT_SERVICE] Message not sent: {}", e);
                    let _ = self
                        .updates
                        .send(SessionUpdate::Notice(Notice::new("Message not sent", e.to_string())));
                }
            }
            ChatCommand::SignedOut => self.sign_out(),
        }
    }

    fn process(&mut self, wake: Wake) {
        match wake {
            Wake::Command(Some(command)) => self.execute(command),
            Wake::Command(None) => {}
            Wake::Input(Some(input)) => self.dispatch(input),
            // the service keeps a sender, so the inbox never closes
            Wake::Input(None) => {}
            Wake::Timer => {
                if let Some(session) = self.session.as_mut() {
                    session.on_timer(Instant::now());
                }
            }
        }
    }

    fn dispatch(&mut self, input: Inbound) {
        match self.session.as_mut() {
            Some(session) if session.generation() == input.generation() && !session.state().is_terminal() => {
                session.handle(input)
            }
            _ => debug!("[CHAT_SERVICE] Discarding input from generation {}", input.generation()),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.session.as_ref().and_then(|s| s.next_deadline())
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
