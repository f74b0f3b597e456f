use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

use crate::common::models::ConnectionState;
use crate::common::protocol::{decode_frame, IncomingFrame, OutgoingFrame};

#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// Close frame received or stream ended
    Normal,
    /// Handshake, network or protocol failure
    Error(String),
}

/// Eventi emessi da un Transport Socket
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Closed(CloseReason),
    Message(IncomingFrame),
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("a socket is already active on this transport")]
    AlreadyActive,
    #[error("invalid socket URL: {0}")]
    InvalidUrl(String),
}

/// One chat socket. At most one live connection per instance, no reconnection.
pub trait TransportSocket: Send {
    fn connect(&mut self, url: Url) -> Result<(), TransportError>;
    /// At-most-once: returns `false` and drops the frame unless the socket is open.
    fn send(&self, frame: &OutgoingFrame) -> bool;
    /// Idempotent. Does not emit a `Closed` event.
    fn disconnect(&mut self);
    fn state(&self) -> ConnectionState;
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, events: TransportEvents) -> Box<dyn TransportSocket>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransportFactory;

impl TransportFactory for WebSocketTransportFactory {
    fn create(&self, events: TransportEvents) -> Box<dyn TransportSocket> {
        Box::new(WebSocketTransport::new(events))
    }
}

pub struct WebSocketTransport {
    events: TransportEvents,
    state: Arc<watch::Sender<ConnectionState>>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    pub fn new(events: TransportEvents) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            events,
            state: Arc::new(state),
            outgoing: None,
            task: None,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

impl TransportSocket for WebSocketTransport {
    fn connect(&mut self, url: Url) -> Result<(), TransportError> {
        if self.state().is_live() {
            return Err(TransportError::AlreadyActive);
        }
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidUrl(format!("unsupported scheme '{}'", url.scheme())));
        }

        info!("[WS:CLIENT] Connecting to {}", redact_token(&url));
        self.state.send_replace(ConnectionState::Connecting);

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel::<String>();
        self.outgoing = Some(outgoing_tx);
        let events = self.events.clone();
        let state = self.state.clone();
        self.task = Some(tokio::spawn(async move {
            run_socket(url, outgoing_rx, events, state).await;
        }));
        Ok(())
    }

    fn send(&self, frame: &OutgoingFrame) -> bool {
        if self.state() != ConnectionState::Open {
            debug!("[WS:CLIENT] Socket not open, dropping outgoing frame");
            return false;
        }
        let json = match frame.encode() {
            Ok(json) => json,
            Err(e) => {
                error!("[WS:CLIENT] Failed to serialize outgoing frame: {}", e);
                return false;
            }
        };
        match &self.outgoing {
            Some(sender) => sender.send(json).is_ok(),
            None => false,
        }
    }

    fn disconnect(&mut self) {
        let was = self.state();
        // Dropping the sender makes the socket task send a close frame and exit.
        self.outgoing = None;
        if let Some(task) = self.task.take() {
            if was == ConnectionState::Connecting {
                task.abort();
            }
        }
        let closed = self.state.send_if_modified(|s| {
            if s.is_live() {
                *s = ConnectionState::Closed;
                true
            } else {
                false
            }
        });
        if closed {
            info!("[WS:CLIENT] Disconnected");
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run_socket(
    url: Url,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    events: TransportEvents,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            error!("[WS:CLIENT] Connection failed: {}", e);
            let failed = state.send_if_modified(|s| {
                if *s == ConnectionState::Connecting {
                    *s = ConnectionState::Error;
                    true
                } else {
                    false
                }
            });
            if failed {
                let _ = events.send(TransportEvent::Closed(CloseReason::Error(format!("connect failed: {}", e))));
            }
            return;
        }
    };

    let opened = state.send_if_modified(|s| {
        if *s == ConnectionState::Connecting {
            *s = ConnectionState::Open;
            true
        } else {
            false
        }
    });
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    if !opened {
        // disconnect() won the race against the handshake
        let _ = ws_sender.send(WsMessage::Close(None)).await;
        return;
    }

    info!("[WS:CLIENT] Connected to {}", redact_token(&url));
    let _ = events.send(TransportEvent::Open);

    let reason = loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(json) => {
                    if let Err(e) = ws_sender.send(WsMessage::Text(json)).await {
                        error!("[WS:CLIENT] Failed to send frame: {}", e);
                        break Some(CloseReason::Error(format!("send failed: {}", e)));
                    }
                }
                None => {
                    debug!("[WS:CLIENT] Closing socket on request");
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    break None;
                }
            },
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => match decode_frame(&text) {
                    Ok(frame) => {
                        if events.send(TransportEvent::Message(frame)).is_err() {
                            debug!("[WS:CLIENT] Event receiver dropped, stopping socket task");
                            break None;
                        }
                    }
                    Err(e) => warn!("[WS:CLIENT] Dropping undecodable frame: {}", e),
                },
                Some(Ok(WsMessage::Close(_))) => {
                    info!("[WS:CLIENT] WebSocket connection closed by server");
                    // flushes the close reply queued by the read
                    let _ = ws_sender.close().await;
                    break Some(CloseReason::Normal);
                }
                Some(Ok(_)) => {
                    // binary, ping, pong: nothing to deliver
                }
                Some(Err(e)) => {
                    warn!("[WS:CLIENT] WebSocket error: {}", e);
                    break Some(CloseReason::Error(e.to_string()));
                }
                None => break Some(CloseReason::Normal),
            },
        }
    };

    if let Some(reason) = reason {
        let next = match reason {
            CloseReason::Normal => ConnectionState::Closed,
            CloseReason::Error(_) => ConnectionState::Error,
        };
        let changed = state.send_if_modified(|s| {
            if *s == ConnectionState::Open {
                *s = next;
                true
            } else {
                false
            }
        });
        if changed {
            let _ = events.send(TransportEvent::Closed(reason));
        }
    }
    debug!("[WS:CLIENT] Socket task ended");
}

/// `<base>/ws/chat/<conversation_id>/?token=<token>`, with http(s) mapped to ws(s).
pub fn socket_url(base: &Url, conversation_id: &str, token: &str) -> Result<Url, TransportError> {
    let mut url = base.clone();
    let scheme = match base.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(TransportError::InvalidUrl(format!("unsupported scheme '{}'", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::InvalidUrl(base.to_string()))?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| TransportError::InvalidUrl(base.to_string()))?;
        segments.pop_if_empty().extend(["ws", "chat", conversation_id, ""]);
    }
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

/// The access token travels in the query string; never log it.
pub fn redact_token(url: &Url) -> String {
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "token" { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    if pairs.is_empty() {
        return redacted.to_string();
    }
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}
