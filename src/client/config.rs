use dotenvy::dotenv;
use log::info;
use std::env;
use std::time::Duration;
use url::Url;

use crate::client::services::reconnect::ReconnectPolicy;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST backend (auth, conversations, history)
    pub api_url: Url,
    /// Base URL of the chat sockets, `ws://` or `wss://`
    pub websocket_url: Url,
    pub typing_timeout: Duration,
    /// How long a peer "typing" flag survives without a refresh
    pub peer_typing_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub log_level: String,
}

impl ClientConfig {
    /// Default settings for a backend at `api_url`, socket on the same host.
    pub fn with_api_url(api_url: Url) -> Self {
        let websocket_url = websocket_url_for(&api_url);
        Self {
            api_url,
            websocket_url,
            typing_timeout: Duration::from_millis(2000),
            peer_typing_timeout: Duration::from_millis(5000),
            reconnect: ReconnectPolicy::default(),
            log_level: "info".to_string(),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        // Carica il file .env
        dotenv().ok();

        let raw_api_url = env::var("API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let api_url = Url::parse(&raw_api_url)
            .map_err(|e| anyhow::anyhow!("invalid API_URL '{}': {}", raw_api_url, e))?;
        let defaults = Self::with_api_url(api_url.clone());

        let websocket_url = match env::var("WEBSOCKET_URL") {
            Ok(raw) => Url::parse(&raw).map_err(|e| anyhow::anyhow!("invalid WEBSOCKET_URL '{}': {}", raw, e))?,
            Err(_) => websocket_url_for(&api_url),
        };

        let reconnect = ReconnectPolicy {
            initial_delay: env_millis("RECONNECT_INITIAL_DELAY_MS").unwrap_or(defaults.reconnect.initial_delay),
            max_delay: env_millis("RECONNECT_MAX_DELAY_MS").unwrap_or(defaults.reconnect.max_delay),
            max_attempts: env::var("RECONNECT_MAX_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(defaults.reconnect.max_attempts),
            jitter: env::var("RECONNECT_JITTER").ok().and_then(|v| parse_jitter(&v)).unwrap_or(defaults.reconnect.jitter),
        };

        let config = Self {
            api_url,
            websocket_url,
            typing_timeout: env_millis("TYPING_TIMEOUT_MS").unwrap_or(defaults.typing_timeout),
            peer_typing_timeout: env_millis("PEER_TYPING_TIMEOUT_MS").unwrap_or(defaults.peer_typing_timeout),
            reconnect,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        };

        info!("Client configuration loaded:");
        info!("  API URL: {}", config.api_url);
        info!("  WebSocket URL: {}", config.websocket_url);
        info!("  Typing timeout: {:?}", config.typing_timeout);
        info!("  Reconnect: up to {} attempts, {:?}..{:?}", config.reconnect.max_attempts, config.reconnect.initial_delay, config.reconnect.max_delay);

        Ok(config)
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env::var(key).ok().and_then(|v| v.parse::<u64>().ok()).map(Duration::from_millis)
}

/// Jitter is a fraction of the delay: finite and within `0.0..=1.0`.
fn parse_jitter(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|j| j.is_finite() && (0.0..=1.0).contains(j))
}

/// Same host as the REST API, with the socket scheme.
pub fn websocket_url_for(api_url: &Url) -> Url {
    let mut ws = api_url.clone();
    let scheme = if api_url.scheme() == "https" { "wss" } else { "ws" };
    // http(s) -> ws(s) stays within the special schemes, which `set_scheme` allows.
    let _ = ws.set_scheme(scheme);
    ws
}
