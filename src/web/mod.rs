pub mod admin;
pub mod auth;
pub mod oauth;
pub mod server;

pub use admin::{reviewer_router, AdminState};
pub use auth::{create_session_store, DiscordOAuth, SharedSessionStore};
pub use oauth::OAuthState;
pub use server::{start_web_server, AppState, WebServerConfig};
