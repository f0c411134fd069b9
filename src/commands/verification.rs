use poise::serenity_prelude as serenity;
use tracing::{error, info};

use crate::error::VerificationError;
use crate::managers::discord::render_dm_embed;
use crate::messages;
use crate::state::UserIdentity;
use crate::{Context, Error};

fn identity_from_context(ctx: &Context<'_>) -> Option<UserIdentity> {
    let guild_id = ctx.guild_id()?;
    let guild_name = ctx
        .guild()
        .map(|g| g.name.clone())
        .unwrap_or_else(|| guild_id.to_string());
    Some(UserIdentity::with_names(
        guild_id.get(),
        guild_name,
        ctx.author().id.get(),
        ctx.author().name.clone(),
    ))
}

/// Start the verification process
///
/// Opens a verification request and sends you a personal sign-in link by DM.
#[poise::command(slash_command, guild_only)]
pub async fn verify(ctx: Context<'_>) -> Result<(), Error> {
    let identity = match identity_from_context(&ctx) {
        Some(identity) => identity,
        None => {
            ctx.say("This command only works inside a server.").await?;
            return Ok(());
        }
    };
    let manager = &ctx.data().manager;

    let request = match manager.create(identity).await {
        Ok(request) => request,
        Err(VerificationError::DuplicateIdentity { .. }) => {
            // Either already trusted or a request is in flight; say which
            let guild_id = ctx.guild_id().map(|g| g.get()).unwrap_or_default();
            let content = if manager.is_trusted(guild_id, ctx.author().id.get()).await {
                "You are already verified!"
            } else {
                "You already have a verification in progress. Check your DMs for the link."
            };
            ctx.send(
                poise::CreateReply::default()
                    .content(content)
                    .ephemeral(true),
            )
            .await?;
            return Ok(());
        }
        Err(e) => {
            error!("Failed to open verification request: {}", e);
            ctx.send(
                poise::CreateReply::default()
                    .content("Could not start verification, try again later.")
                    .ephemeral(true),
            )
            .await?;
            return Ok(());
        }
    };

    let verify_url = format!("{}/verify/{}", ctx.data().base_url, request.secret_code);
    let message = messages::verification_link_message(&ctx.author().name, &verify_url);

    match ctx.author().create_dm_channel(&ctx.http()).await {
        Ok(dm_channel) => {
            dm_channel
                .send_message(
                    &ctx.http(),
                    serenity::CreateMessage::new().embed(render_dm_embed(&message)),
                )
                .await?;
            ctx.send(poise::CreateReply::default()
                .content("**Verification started**\n\nI've sent you a private message with your personal verification link.")
                .ephemeral(true))
                .await?;
            info!(
                "Sent verification link for request {} to {}",
                request.id,
                ctx.author().name
            );
        }
        Err(e) => {
            error!(
                "Failed to create DM channel for {}: {}",
                ctx.author().name,
                e
            );
            ctx.send(poise::CreateReply::default()
                .content("**Verification started, but I couldn't DM you.**\n\nPlease enable DMs from server members and run `/verify` again.")
                .ephemeral(true))
                .await?;
        }
    }

    Ok(())
}

/// Manage your own verification
#[poise::command(slash_command, guild_only, subcommands("status", "sign_out"))]
pub async fn manage(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Show your verification status
#[poise::command(slash_command, guild_only)]
pub async fn status(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().map(|g| g.get()).unwrap_or_default();
    let user_id = ctx.author().id.get();
    let manager = &ctx.data().manager;

    let content = if let Some(record) = manager.trusted_record(guild_id, user_id).await {
        let number = record
            .student_number
            .as_deref()
            .unwrap_or("none")
            .to_string();
        format!(
            "You are verified ({}), since {}. Linked student number: {}.",
            record.method.describe(),
            record.verified_at.format("%Y-%m-%d"),
            number
        )
    } else {
        let store = manager.store().read().await;
        match store.active_request_for(&UserIdentity::new(guild_id, user_id)) {
            Some(request) => format!("Your verification is in progress ({}).", request.state),
            None => "You are not verified. Run `/verify` to start.".to_string(),
        }
    };

    ctx.send(
        poise::CreateReply::default()
            .content(content)
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

/// Remove your verification and unlink your student number
#[poise::command(slash_command, guild_only, rename = "sign_out")]
pub async fn sign_out(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().map(|g| g.get()).unwrap_or_default();
    let removed = ctx
        .data()
        .manager
        .revoke(guild_id, ctx.author().id.get())
        .await?;

    let content = match removed {
        Some(_) => {
            info!("User {} signed out of verification", ctx.author().name);
            "Your verification has been removed. You can verify again at any time."
        }
        None => "You are not verified in this server.",
    };
    ctx.send(
        poise::CreateReply::default()
            .content(content)
            .ephemeral(true),
    )
    .await?;
    Ok(())
}
