use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::client::services::auth::{Session, SessionStore, TokenProvider};
use crate::common::models::{deserialize_id, ClientMessageId, Conversation, Message, Provenance, User};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not signed in")]
    NotSignedIn,
    #[error("session expired, please sign in again")]
    SessionExpired,
    #[error("account inactive, please contact support")]
    Forbidden,
    #[error("request failed ({status}): {message}")]
    Status { status: u16, message: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl ApiError {
    /// Errors that ended the auth session.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::NotSignedIn | ApiError::SessionExpired | ApiError::Forbidden)
    }
}

/// Conversation endpoints the chat session depends on.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn resolve_or_create_conversation(&self, peer_user_id: &str) -> Result<Conversation, ApiError>;

    /// History of a conversation, ascending by timestamp.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, ApiError>;
}

#[derive(Debug, Deserialize)]
struct HistoryMessage {
    #[serde(deserialize_with = "deserialize_id")]
    id: String,
    #[serde(deserialize_with = "deserialize_id")]
    conversation: String,
    sender: User,
    content: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    client_id: Option<ClientMessageId>,
}

impl From<HistoryMessage> for Message {
    fn from(m: HistoryMessage) -> Self {
        Message {
            id: m.id,
            conversation_id: m.conversation,
            sender_id: m.sender.id,
            content: m.content,
            timestamp: m.timestamp,
            is_read: Some(m.is_read),
            provenance: Provenance::Confirmed,
            client_id: m.client_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
}

/// REST client for the chat backend.
///
/// A 401 triggers one token refresh and one retry; when that fails, or on a
/// 403, the session is cleared.
#[derive(Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: Url,
    session: SessionStore,
}

impl HttpApi {
    pub fn new(mut base_url: Url, session: SessionStore) -> Self {
        // join() replaces the last segment unless the base ends with '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            client: reqwest::Client::new(),
            base_url,
            session,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        let url = self.endpoint("auth/token/")?;
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;
        if response.status() == StatusCode::FORBIDDEN {
            return Err(ApiError::Forbidden);
        }
        let session: Session = decode(response).await?;
        self.session.set(session.clone());
        info!("[API] Signed in as {}", email);
        Ok(session)
    }

    /// Exchange the refresh token for a new access token.
    pub async fn refresh(&self) -> Result<(), ApiError> {
        let refresh = self
            .session
            .get()
            .map(|s| s.refresh)
            .filter(|r| !r.is_empty())
            .ok_or(ApiError::SessionExpired)?;
        let url = self.endpoint("auth/token/refresh/")?;
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "refresh": refresh }))
            .send()
            .await?;
        let body: RefreshResponse = decode(response).await?;
        if !self.session.update_access(body.access) {
            return Err(ApiError::SessionExpired);
        }
        info!("[API] Access token refreshed");
        Ok(())
    }

    pub fn sign_out(&self) {
        self.session.clear();
    }

    pub async fn current_user(&self) -> Result<User, ApiError> {
        self.get_json("auth/user-data/").await
    }

    pub async fn friends(&self) -> Result<Vec<User>, ApiError> {
        self.get_json("auth/friends/").await
    }

    /// Post `content` to a conversation over HTTP, outside the socket.
    pub async fn post_message(&self, conversation_id: &str, content: &str) -> Result<Message, ApiError> {
        let body = serde_json::json!({ "content": content });
        let row: HistoryMessage = self
            .send_json(
                Method::POST,
                &format!("chat/conversations/{}/messages/", conversation_id),
                Some(&body),
            )
            .await?;
        Ok(row.into())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(Method::GET, path, None).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T, ApiError> {
        let url = self.endpoint(path)?;
        let mut response = self.authorized(method.clone(), &url, body).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            info!("[API] 401 on {}, refreshing token", path);
            if let Err(e) = self.refresh().await {
                warn!("[API] Token refresh failed: {}", e);
                self.session.clear();
                return Err(ApiError::SessionExpired);
            }
            response = self.authorized(method, &url, body).await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                self.session.clear();
                return Err(ApiError::SessionExpired);
            }
        }

        if response.status() == StatusCode::FORBIDDEN {
            warn!("[API] 403 on {}, signing out", path);
            self.session.clear();
            return Err(ApiError::Forbidden);
        }

        decode(response).await
    }

    async fn authorized(
        &self,
        method: Method,
        url: &Url,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, ApiError> {
        let token = self.session.access_token().ok_or(ApiError::NotSignedIn)?;
        let mut request = self.client.request(method, url.clone()).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }
}

#[async_trait]
impl ConversationApi for HttpApi {
    async fn resolve_or_create_conversation(&self, peer_user_id: &str) -> Result<Conversation, ApiError> {
        self.get_json(&format!("chat/conversations/with-user/{}/", peer_user_id))
            .await
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, ApiError> {
        let history: Vec<HistoryMessage> = self
            .get_json(&format!("chat/conversations/{}/messages/", conversation_id))
            .await?;
        Ok(history.into_iter().map(Message::from).collect())
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            message: error_message(&body),
        });
    }
    Ok(response.json::<T>().await?)
}

/// The backend reports errors as `{"error": ...}` or `{"detail": ...}`.
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["error", "detail"] {
            if let Some(msg) = value.get(key).and_then(|v| v.as_str()) {
                return msg.to_string();
            }
        }
    }
    body.chars().take(200).collect()
}
