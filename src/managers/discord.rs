use std::sync::Arc;

use async_trait::async_trait;
use poise::serenity_prelude::{self as serenity, GuildId, RoleId, UserId};
use tracing::{debug, warn};

use crate::error::{Result, VerificationError};
use crate::messages::DmMessage;

use super::dispatcher::{EmailKind, SideEffects};

/// Templated-mail provider settings (SendGrid-style HTTP API).
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_url: String,
    pub api_key: String,
    pub from_email: String,
    pub from_name: String,
    pub confirmation_template_id: String,
    pub rejection_template_id: String,
}

impl EmailConfig {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("SENDGRID_API_KEY").ok()?;
        let from_email = std::env::var("EMAIL_FROM").ok()?;
        let confirmation_template_id = std::env::var("EMAIL_CONFIRMATION_TEMPLATE").ok()?;
        let rejection_template_id = std::env::var("EMAIL_REJECTION_TEMPLATE").ok()?;

        Some(Self {
            api_url: std::env::var("EMAIL_API_URL")
                .unwrap_or_else(|_| "https://api.sendgrid.com".to_string()),
            api_key,
            from_email,
            from_name: std::env::var("EMAIL_FROM_NAME").unwrap_or_else(|_| "warden".to_string()),
            confirmation_template_id,
            rejection_template_id,
        })
    }

    fn template_id(&self, kind: EmailKind) -> &str {
        match kind {
            EmailKind::Confirmation => &self.confirmation_template_id,
            EmailKind::Rejection => &self.rejection_template_id,
        }
    }
}

/// Production side effects: Discord role grants and DMs over the serenity
/// HTTP client, templated mail over the provider's HTTP API.
pub struct DiscordEffects {
    http: Arc<serenity::Http>,
    email: Option<EmailConfig>,
    client: reqwest::Client,
}

impl DiscordEffects {
    pub fn new(http: Arc<serenity::Http>, email: Option<EmailConfig>) -> Self {
        if email.is_none() {
            warn!("Email delivery not configured: confirmation and rejection mail will be skipped");
        }
        Self {
            http,
            email,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SideEffects for DiscordEffects {
    async fn grant_role(&self, guild_id: u64, user_id: u64, role_id: u64) -> Result<()> {
        // Adding a role the member already holds is a no-op on Discord's
        // side, which is what makes redelivery safe
        self.http
            .add_member_role(
                GuildId::new(guild_id),
                UserId::new(user_id),
                RoleId::new(role_id),
                Some("identity verification completed"),
            )
            .await?;
        debug!("Granted role {} to user {} in guild {}", role_id, user_id, guild_id);
        Ok(())
    }

    async fn direct_message(&self, user_id: u64, message: DmMessage) -> Result<()> {
        let channel = UserId::new(user_id).create_dm_channel(&*self.http).await?;

        channel
            .id
            .send_message(
                &*self.http,
                serenity::CreateMessage::new().embed(render_dm_embed(&message)),
            )
            .await?;
        Ok(())
    }

    async fn send_templated_email(
        &self,
        to: &str,
        kind: EmailKind,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let config = match &self.email {
            Some(config) => config,
            None => {
                // Deployment without a mail provider; not a delivery failure
                warn!("Skipping {:?} email to {}: no provider configured", kind, to);
                return Ok(());
            }
        };

        let body = serde_json::json!({
            "personalizations": [{
                "to": [{"email": to}],
                "dynamic_template_data": data,
            }],
            "from": {
                "email": config.from_email,
                "name": config.from_name,
            },
            "template_id": config.template_id(kind),
        });

        let response = self
            .client
            .post(format!("{}/v3/mail/send", config.api_url))
            .bearer_auth(&config.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(VerificationError::Http {
                message: format!("mail API returned {}: {}", status, detail),
            });
        }
        debug!("Sent {:?} email to {}", kind, to);
        Ok(())
    }
}

/// Render a [`DmMessage`] as a Discord embed.
pub fn render_dm_embed(message: &DmMessage) -> serenity::CreateEmbed {
    let mut embed = serenity::CreateEmbed::new()
        .title(&message.title)
        .description(&message.body)
        .color(serenity::Colour::new(message.color));
    for (name, value) in &message.fields {
        embed = embed.field(name, value, false);
    }
    if let Some(link) = &message.link {
        embed = embed.url(link);
    }
    embed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_config_requires_core_variables() {
        // Isolated check of the template lookup only; from_env is exercised
        // in deployment
        let config = EmailConfig {
            api_url: "https://api.sendgrid.com".to_string(),
            api_key: "key".to_string(),
            from_email: "bot@example.com".to_string(),
            from_name: "warden".to_string(),
            confirmation_template_id: "d-confirm".to_string(),
            rejection_template_id: "d-reject".to_string(),
        };

        assert_eq!(config.template_id(EmailKind::Confirmation), "d-confirm");
        assert_eq!(config.template_id(EmailKind::Rejection), "d-reject");
    }
}
