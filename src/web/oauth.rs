//! Identity-provider interaction for the user verification flow.
//!
//! The login page posts the provider's ID token (credential) back to us; we
//! hand it to the provider's token-info endpoint, which checks the signature
//! and returns the claim set. Claim validation against issuer, audience and
//! expiry happens in the verifier.

use serde::Deserialize;

use crate::error::{Result, VerificationError};
use crate::managers::OAuthAssertion;

/// Identity-provider configuration for user verification.
#[derive(Clone)]
pub struct OAuthState {
    /// Expected `iss` claim
    pub issuer: String,
    /// OAuth client id, the expected `aud` claim
    pub client_id: String,
    /// Token-info endpoint validating credentials remotely
    pub token_info_url: String,
    /// Public base URL of this server, used to build verification links
    pub base_url: String,
    pub http_client: reqwest::Client,
}

impl OAuthState {
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("OAUTH_CLIENT_ID").ok()?;
        let issuer = std::env::var("OAUTH_ISSUER")
            .unwrap_or_else(|_| "https://accounts.google.com".to_string());
        let token_info_url = std::env::var("OAUTH_TOKENINFO_URL")
            .unwrap_or_else(|_| "https://oauth2.googleapis.com/tokeninfo".to_string());
        let base_url =
            std::env::var("WEB_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

        Some(Self {
            issuer,
            client_id,
            token_info_url,
            base_url,
            http_client: reqwest::Client::new(),
        })
    }

    /// Exchange a posted credential for its claim set. The provider rejects
    /// tokens with bad signatures here; any such rejection is a classified
    /// `InvalidAssertion`.
    pub async fn fetch_claims(&self, credential: &str) -> Result<OAuthAssertion> {
        let response = self
            .http_client
            .get(&self.token_info_url)
            .query(&[("id_token", credential)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(VerificationError::InvalidAssertion {
                reason: format!("issuer rejected the credential ({})", response.status()),
            });
        }

        let claims: serde_json::Map<String, serde_json::Value> =
            response
                .json()
                .await
                .map_err(|e| VerificationError::InvalidAssertion {
                    reason: format!("malformed token-info response: {}", e),
                })?;

        Ok(OAuthAssertion::new(claims))
    }
}

/// Form posted by the provider's sign-in widget.
#[derive(Deserialize)]
pub struct CredentialForm {
    /// The secret code of the verification link that initiated the flow
    pub state: String,
    /// The provider-issued ID token
    pub credential: String,
}
