use clap::Parser;
use log::{error, info};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use ruggine_chat::client::config::ClientConfig;
use ruggine_chat::client::models::{ChatCommand, SessionState, SessionUpdate};
use ruggine_chat::client::services::api_client::HttpApi;
use ruggine_chat::client::services::auth::SessionStore;
use ruggine_chat::client::services::chat_service::ChatService;
use ruggine_chat::client::services::chat_session::SessionDeps;
use ruggine_chat::client::services::transport::WebSocketTransportFactory;
use ruggine_chat::common::models::{Message, UserId};
use ruggine_chat::utils::logger;

/// Terminal client for Ruggine real-time chats
#[derive(Parser, Debug)]
#[command(name = "ruggine-chat", version)]
struct Args {
    /// User id of the friend to chat with
    #[arg(long)]
    peer: Option<String>,
    #[arg(long, env = "RUGGINE_EMAIL")]
    email: String,
    #[arg(long, env = "RUGGINE_PASSWORD", hide_env_values = true)]
    password: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Carica il file .env prima del logger, così LOG_LEVEL viene rispettato
    let _ = dotenvy::dotenv();
    logger::init(&std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()));

    let args = Args::parse();
    let config = ClientConfig::from_env()?;

    let session = SessionStore::new();
    let api = Arc::new(HttpApi::new(config.api_url.clone(), session.clone()));
    api.sign_in(&args.email, &args.password).await?;
    let me = api.current_user().await?;
    println!("[CLIENT] Benvenuto {}!", me.display_name());

    if args.peer.is_none() {
        let friends = api.friends().await?;
        if friends.is_empty() {
            println!("[CLIENT] Nessun amico trovato");
        }
        for friend in friends {
            println!("[CLIENT]   {}  {}", friend.id, friend.display_name());
        }
        println!("[CLIENT] Usa /open <id> per aprire una chat");
    }

    let deps = SessionDeps {
        api: api.clone(),
        tokens: Arc::new(session.clone()),
        transports: Arc::new(WebSocketTransportFactory),
        config,
    };
    let (service, mut updates) = ChatService::new(deps, me.id.clone());
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let service_task = tokio::spawn(service.run(commands_rx));

    if let Some(peer_id) = args.peer {
        commands.send(ChatCommand::Open { peer_id })?;
    }

    // Sign-out forzato (refresh fallito o account disattivato)
    let mut session_rx = session.subscribe();
    let signout_commands = commands.clone();
    let signout_watch = tokio::spawn(async move {
        while session_rx.changed().await.is_ok() {
            if session_rx.borrow().is_none() {
                let _ = signout_commands.send(ChatCommand::SignedOut);
                break;
            }
        }
    });

    let self_id = me.id.clone();
    let printer = tokio::spawn(async move {
        let mut shown = HashSet::new();
        while let Some(update) = updates.recv().await {
            print_update(update, &self_id, &mut shown);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        let mut parts = line.splitn(2, ' ');
        match (parts.next().unwrap_or(""), parts.next()) {
            ("", _) => continue,
            ("/quit", _) => break,
            ("/close", _) => commands.send(ChatCommand::Close)?,
            // il watcher della sessione inoltra SignedOut al servizio
            ("/logout", _) => {
                api.sign_out();
                println!("[CLIENT] Logout effettuato");
            }
            ("/open", Some(peer_id)) if !peer_id.trim().is_empty() => {
                commands.send(ChatCommand::Open {
                    peer_id: peer_id.trim().to_string(),
                })?;
            }
            ("/open", _) => println!("[CLIENT] Uso: /open <id>"),
            _ => {
                commands.send(ChatCommand::TextChanged(line.to_string()))?;
                commands.send(ChatCommand::Send(line.to_string()))?;
            }
        }
    }

    signout_watch.abort();
    drop(commands);
    if let Err(e) = service_task.await {
        error!("Chat service task failed: {}", e);
    }
    let _ = printer.await;
    info!("Bye");
    Ok(())
}

/// `shown` holds ids and correlation ids already printed.
fn print_update(update: SessionUpdate, self_id: &UserId, shown: &mut HashSet<String>) {
    match update {
        SessionUpdate::StateChanged(state) => match state {
            SessionState::Loading => println!("[CHAT] Apertura chat..."),
            SessionState::Connected => println!("[CHAT] Connesso"),
            SessionState::Reconnecting { attempt } => println!("[CHAT] Connessione persa, tentativo {}...", attempt),
            SessionState::Closed => println!("[CHAT] Chat chiusa"),
            SessionState::Error(failure) => println!("[CHAT] Errore: {}", failure),
            SessionState::Idle => {}
        },
        SessionUpdate::MessagesChanged(messages) => {
            for message in messages.iter().filter(|m| is_new(m, shown)) {
                let who = if &message.sender_id == self_id { "tu" } else { message.sender_id.as_str() };
                println!("[{}] {}: {}", message.timestamp.format("%H:%M"), who, message.content);
            }
        }
        SessionUpdate::PeerTyping(true) => println!("[CHAT] sta scrivendo..."),
        SessionUpdate::PeerTyping(false) => {}
        SessionUpdate::Notice(notice) => println!("[{}] {}", notice.title, notice.message),
    }
}

fn is_new(message: &Message, shown: &mut HashSet<String>) -> bool {
    // the confirmed copy of a message printed as provisional shares its client_id
    let correlation = message.client_id.map(|c| c.to_string());
    let seen = shown.contains(&message.id) || correlation.as_ref().map_or(false, |c| shown.contains(c));
    shown.insert(message.id.clone());
    if let Some(correlation) = correlation {
        shown.insert(correlation);
    }
    !seen
}
