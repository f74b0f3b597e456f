pub mod api_client;
pub mod auth;
pub mod chat_service;
pub mod chat_session;
pub mod reconciler;
pub mod reconnect;
pub mod transport;
pub mod typing;
