//! Discord OAuth authentication for the review panel.
//!
//! Reviewers authenticate with Discord; access requires membership of the
//! reviewer roster, not a Discord permission. Sessions are short-lived
//! tokens in an in-memory store.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Result, VerificationError};

/// Session data for an authenticated reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerSession {
    pub discord_id: u64,
    pub username: String,
    pub created_at: u64,
    pub expires_at: u64,
}

impl ReviewerSession {
    /// Create a new session with 24-hour expiry.
    pub fn new(discord_id: u64, username: String) -> Self {
        let now = current_timestamp();
        Self {
            discord_id,
            username,
            created_at: now,
            expires_at: now + 86400,
        }
    }

    pub fn is_expired(&self) -> bool {
        current_timestamp() >= self.expires_at
    }
}

/// Session store - maps session tokens to session data.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, ReviewerSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create_session(&self, session: ReviewerSession) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        self.sessions.write().await.insert(token.clone(), session);
        token
    }

    pub async fn get_session(&self, token: &str) -> Option<ReviewerSession> {
        let sessions = self.sessions.read().await;
        sessions.get(token).and_then(|s| {
            if s.is_expired() {
                None
            } else {
                Some(s.clone())
            }
        })
    }

    pub async fn remove_session(&self, token: &str) {
        self.sessions.write().await.remove(token);
    }

    pub async fn cleanup_expired(&self) {
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, s| !s.is_expired());
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedSessionStore = Arc<SessionStore>;

pub fn create_session_store() -> SharedSessionStore {
    Arc::new(SessionStore::new())
}

/// Discord OAuth application settings for reviewer login.
#[derive(Clone)]
pub struct DiscordOAuth {
    pub client_id: String,
    pub client_secret: String,
    pub base_url: String,
    pub http_client: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Discord user info from /users/@me.
#[derive(Deserialize, Debug)]
pub struct DiscordUser {
    pub id: String,
    pub username: String,
    pub global_name: Option<String>,
}

impl DiscordOAuth {
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("DISCORD_CLIENT_ID").ok()?;
        let client_secret = std::env::var("DISCORD_CLIENT_SECRET").ok()?;
        let base_url =
            std::env::var("WEB_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

        Some(Self {
            client_id,
            client_secret,
            base_url,
            http_client: reqwest::Client::new(),
        })
    }

    fn redirect_uri(&self) -> String {
        format!("{}/admin/callback", self.base_url)
    }

    /// Authorization URL the login page links to.
    pub fn login_url(&self) -> String {
        format!(
            "https://discord.com/api/oauth2/authorize?client_id={}&redirect_uri={}&response_type=code&scope=identify&state=reviewer_login",
            self.client_id,
            urlencoding::encode(&self.redirect_uri())
        )
    }

    /// Exchange an authorization code for the authenticated Discord user.
    pub async fn fetch_user(&self, code: &str) -> Result<DiscordUser> {
        let token: TokenResponse = self
            .http_client
            .post("https://discord.com/api/oauth2/token")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", &self.redirect_uri()),
            ])
            .send()
            .await?
            .json()
            .await
            .map_err(|e| VerificationError::Http {
                message: format!("token exchange failed: {}", e),
            })?;

        let user: DiscordUser = self
            .http_client
            .get("https://discord.com/api/users/@me")
            .bearer_auth(&token.access_token)
            .send()
            .await?
            .json()
            .await
            .map_err(|e| VerificationError::Http {
                message: format!("user lookup failed: {}", e),
            })?;

        Ok(user)
    }
}

/// OAuth callback parameters for reviewer login.
#[derive(Deserialize)]
pub struct ReviewerCallbackParams {
    pub code: String,
    pub state: String,
}

/// Extract the session token from cookies.
pub fn get_session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::COOKIE)?
        .to_str()
        .ok()?
        .split(';')
        .find_map(|cookie| {
            let cookie = cookie.trim();
            cookie
                .strip_prefix("reviewer_session=")
                .map(|token| token.to_string())
        })
}

pub fn create_session_cookie(token: &str) -> String {
    format!(
        "reviewer_session={}; Path=/admin; HttpOnly; SameSite=Lax; Max-Age=86400",
        token
    )
}

pub fn create_logout_cookie() -> String {
    "reviewer_session=; Path=/admin; HttpOnly; SameSite=Lax; Max-Age=0".to_string()
}

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_lifecycle() {
        let store = SessionStore::new();
        let token = store
            .create_session(ReviewerSession::new(7, "rev".to_string()))
            .await;

        let session = store.get_session(&token).await.unwrap();
        assert_eq!(session.discord_id, 7);

        store.remove_session(&token).await;
        assert!(store.get_session(&token).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_session_is_rejected() {
        let store = SessionStore::new();
        let mut session = ReviewerSession::new(7, "rev".to_string());
        session.expires_at = 0;
        let token = store.create_session(session).await;

        assert!(store.get_session(&token).await.is_none());

        store.cleanup_expired().await;
        assert!(store.sessions.read().await.is_empty());
    }

    #[test]
    fn test_session_token_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            "theme=dark; reviewer_session=abc123; other=1".parse().unwrap(),
        );
        assert_eq!(get_session_token(&headers).as_deref(), Some("abc123"));

        let empty = HeaderMap::new();
        assert!(get_session_token(&empty).is_none());
    }
}
