use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Access/refresh token pair returned by the backend on sign-in.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access: String,
    pub refresh: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access", &"***")
            .field("refresh", &"***")
            .finish()
    }
}

/// Read-only access to the current access token.
pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

/// In-memory session holder shared by the HTTP client and the chat sockets.
///
/// Persisting the tokens is left to the embedding application.
#[derive(Clone)]
pub struct SessionStore {
    session: std::sync::Arc<watch::Sender<Option<Session>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (session, _) = watch::channel(None);
        Self {
            session: std::sync::Arc::new(session),
        }
    }

    pub fn with_session(session: Session) -> Self {
        let store = Self::new();
        store.set(session);
        store
    }

    pub fn get(&self) -> Option<Session> {
        self.session.borrow().clone()
    }

    pub fn set(&self, session: Session) {
        self.session.send_replace(Some(session));
    }

    /// Replace the access token after a refresh, keeping the refresh token.
    pub fn update_access(&self, access: String) -> bool {
        self.session.send_if_modified(|current| match current {
            Some(session) => {
                session.access = access;
                true
            }
            None => false,
        })
    }

    pub fn clear(&self) {
        if self.session.send_replace(None).is_some() {
            info!("[SESSION_STORE] Session cleared");
        }
    }

    pub fn is_signed_in(&self) -> bool {
        self.session.borrow().is_some()
    }

    /// Observe sign-in / sign-out transitions.
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }
}

impl TokenProvider for SessionStore {
    fn access_token(&self) -> Option<String> {
        self.session.borrow().as_ref().map(|s| s.access.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session {
            access: "a1".to_string(),
            refresh: "r1".to_string(),
        }
    }

    #[test]
    fn token_follows_the_session_lifecycle() {
        let store = SessionStore::new();
        assert_eq!(store.access_token(), None);
        store.set(session());
        assert_eq!(store.access_token().as_deref(), Some("a1"));
        assert!(store.update_access("a2".to_string()));
        assert_eq!(store.get().map(|s| s.refresh), Some("r1".to_string()));
        assert_eq!(store.access_token().as_deref(), Some("a2"));
        store.clear();
        assert!(!store.is_signed_in());
        assert!(!store.update_access("a3".to_string()));
    }

    #[test]
    fn debug_output_hides_tokens() {
        let shown = format!("{:?}", session());
        assert!(!shown.contains("a1"));
        assert!(!shown.contains("r1"));
    }

    #[tokio::test]
    async fn subscribers_see_sign_out() {
        let store = SessionStore::with_session(session());
        let mut rx = store.subscribe();
        let clone = store.clone();
        clone.clear();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
    }
}
