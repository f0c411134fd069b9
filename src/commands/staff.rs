use poise::serenity_prelude as serenity;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::VerificationError;
use crate::state::{Reviewer, UserIdentity, VerificationMethod};
use crate::{Context, Error};

/// Staff check: reviewer roster membership, or the guild configuration's
/// staff lists.
async fn ensure_staff(ctx: &Context<'_>) -> Result<bool, Error> {
    let guild_id = match ctx.guild_id() {
        Some(id) => id.get(),
        None => return Ok(false),
    };
    let user_id = ctx.author().id.get();

    {
        let store = ctx.data().manager.store().read().await;
        if store.is_reviewer(guild_id, user_id) {
            return Ok(true);
        }
    }

    let config = match ctx.data().guilds.snapshot(guild_id).await {
        Ok(config) => config,
        Err(e) => {
            warn!("No guild configuration for staff check: {}", e);
            return Ok(false);
        }
    };

    let role_ids: Vec<u64> = match ctx.author_member().await {
        Some(member) => member.roles.iter().map(|r| r.get()).collect(),
        None => Vec::new(),
    };
    Ok(config.is_staff(user_id, &role_ids))
}

async fn deny_non_staff(ctx: &Context<'_>) -> Result<(), Error> {
    ctx.send(
        poise::CreateReply::default()
            .content("You are not allowed to use this command.")
            .ephemeral(true),
    )
    .await?;
    Ok(())
}

fn target_identity(ctx: &Context<'_>, user: &serenity::User) -> UserIdentity {
    let guild_id = ctx.guild_id().map(|g| g.get()).unwrap_or_default();
    let guild_name = ctx
        .guild()
        .map(|g| g.name.clone())
        .unwrap_or_else(|| guild_id.to_string());
    UserIdentity::with_names(guild_id, guild_name, user.id.get(), user.name.clone())
}

/// Record a staff command in the audit log; completion is best effort.
async fn record_audit(
    ctx: &Context<'_>,
    command: &str,
    options: serde_json::Map<String, serde_json::Value>,
) -> Option<Uuid> {
    let identity = UserIdentity::with_names(
        ctx.guild_id().map(|g| g.get()).unwrap_or_default(),
        ctx.guild()
            .map(|g| g.name.clone())
            .unwrap_or_default(),
        ctx.author().id.get(),
        ctx.author().name.clone(),
    );

    let mut audit = ctx.data().audit.write().await;
    match audit.record(identity, command, options).await {
        Ok(id) => Some(id),
        Err(e) => {
            error!("Failed to record audit entry for '{}': {}", command, e);
            None
        }
    }
}

async fn complete_audit(ctx: &Context<'_>, entry: Option<Uuid>) {
    if let Some(id) = entry {
        let mut audit = ctx.data().audit.write().await;
        if let Err(e) = audit.complete(&id).await {
            error!("Failed to complete audit entry {}: {}", id, e);
        }
    }
}

fn audit_options(user: &serenity::User) -> serde_json::Map<String, serde_json::Value> {
    let mut options = serde_json::Map::new();
    options.insert("user".to_string(), serde_json::json!(user.id.get()));
    options
}

/// Manage trusted records (Staff)
#[poise::command(slash_command, guild_only, subcommands("assign", "enforce", "revoke"))]
pub async fn trust(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Mark a user as verified without the OAuth flow
#[poise::command(slash_command, guild_only)]
pub async fn assign(
    ctx: Context<'_>,
    #[description = "User to mark as verified"] user: serenity::User,
) -> Result<(), Error> {
    trust_with_method(ctx, user, VerificationMethod::StaffAssigned, "trust assign").await
}

/// Force verification for a user (overrides pending requests)
#[poise::command(slash_command, guild_only)]
pub async fn enforce(
    ctx: Context<'_>,
    #[description = "User to verify"] user: serenity::User,
) -> Result<(), Error> {
    trust_with_method(ctx, user, VerificationMethod::StaffEnforced, "trust enforce").await
}

async fn trust_with_method(
    ctx: Context<'_>,
    user: serenity::User,
    method: VerificationMethod,
    command: &str,
) -> Result<(), Error> {
    if !ensure_staff(&ctx).await? {
        return deny_non_staff(&ctx).await;
    }
    let audit = record_audit(&ctx, command, audit_options(&user)).await;

    let mut context = serde_json::Map::new();
    context.insert(
        "staff_user_id".to_string(),
        serde_json::json!(ctx.author().id.get()),
    );

    let content = match ctx
        .data()
        .manager
        .trust_directly(target_identity(&ctx, &user), method, context)
        .await
    {
        Ok(_) => {
            info!(
                "{} marked {} as verified ({})",
                ctx.author().name,
                user.name,
                method.describe()
            );
            format!("**{}** is now verified ({}).", user.name, method.describe())
        }
        Err(VerificationError::IdentityConflict { .. }) => {
            format!("**{}** is already verified.", user.name)
        }
        Err(e) => {
            error!("Failed to trust {}: {}", user.name, e);
            format!("Could not verify **{}**: {}", user.name, e)
        }
    };

    ctx.send(
        poise::CreateReply::default()
            .content(content)
            .ephemeral(true),
    )
    .await?;
    complete_audit(&ctx, audit).await;
    Ok(())
}

/// Remove a user's verification
#[poise::command(slash_command, guild_only)]
pub async fn revoke(
    ctx: Context<'_>,
    #[description = "User whose verification to remove"] user: serenity::User,
) -> Result<(), Error> {
    if !ensure_staff(&ctx).await? {
        return deny_non_staff(&ctx).await;
    }
    let audit = record_audit(&ctx, "trust revoke", audit_options(&user)).await;

    let guild_id = ctx.guild_id().map(|g| g.get()).unwrap_or_default();
    let content = match ctx.data().manager.revoke(guild_id, user.id.get()).await {
        Ok(Some(_)) => format!("Verification removed for **{}**.", user.name),
        Ok(None) => format!("**{}** is not verified.", user.name),
        Err(e) => {
            error!("Failed to revoke {}: {}", user.name, e);
            format!("Could not revoke **{}**: {}", user.name, e)
        }
    };

    ctx.send(
        poise::CreateReply::default()
            .content(content)
            .ephemeral(true),
    )
    .await?;
    complete_audit(&ctx, audit).await;
    Ok(())
}

/// Ask a user to submit document photos for manual review (Staff)
#[poise::command(slash_command, guild_only, rename = "request_evidence")]
pub async fn request_evidence(
    ctx: Context<'_>,
    #[description = "User who should submit documents"] user: serenity::User,
) -> Result<(), Error> {
    if !ensure_staff(&ctx).await? {
        return deny_non_staff(&ctx).await;
    }
    let audit = record_audit(&ctx, "request_evidence", audit_options(&user)).await;

    let manager = &ctx.data().manager;
    let identity = target_identity(&ctx, &user);

    // Reuse the user's active request or open one for them
    let request_id = {
        let store = manager.store().read().await;
        store.active_request_for(&identity).map(|r| r.id)
    };
    let request_id = match request_id {
        Some(id) => id,
        None => match manager.create(identity).await {
            Ok(request) => request.id,
            Err(VerificationError::DuplicateIdentity { .. }) => {
                ctx.send(
                    poise::CreateReply::default()
                        .content(format!("**{}** is already verified.", user.name))
                        .ephemeral(true),
                )
                .await?;
                complete_audit(&ctx, audit).await;
                return Ok(());
            }
            Err(e) => {
                error!("Failed to open request for {}: {}", user.name, e);
                ctx.send(
                    poise::CreateReply::default()
                        .content("Could not open a verification request.")
                        .ephemeral(true),
                )
                .await?;
                return Ok(());
            }
        },
    };

    let content = match manager.request_evidence(&request_id).await {
        Ok(()) => format!(
            "**{}** will be asked by DM to submit their student ID.",
            user.name
        ),
        Err(VerificationError::InvalidState { state, .. }) => format!(
            "Cannot request documents: the request is already {}.",
            state
        ),
        Err(e) => {
            error!("Failed to request evidence: {}", e);
            format!("Could not request documents: {}", e)
        }
    };

    ctx.send(
        poise::CreateReply::default()
            .content(content)
            .ephemeral(true),
    )
    .await?;
    complete_audit(&ctx, audit).await;
    Ok(())
}

/// Manage the reviewer roster (Staff)
#[poise::command(
    slash_command,
    guild_only,
    subcommands("reviewer_add", "reviewer_remove", "reviewer_list")
)]
pub async fn reviewer(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Register a reviewer for this guild
#[poise::command(slash_command, guild_only, rename = "add")]
pub async fn reviewer_add(
    ctx: Context<'_>,
    #[description = "User to register as reviewer"] user: serenity::User,
) -> Result<(), Error> {
    if !ensure_staff(&ctx).await? {
        return deny_non_staff(&ctx).await;
    }
    let audit = record_audit(&ctx, "reviewer add", audit_options(&user)).await;

    let identity = target_identity(&ctx, &user);
    {
        let mut store = ctx.data().manager.store().write().await;
        store.add_reviewer(Reviewer::new(identity)).await?;
    }
    info!("{} registered {} as reviewer", ctx.author().name, user.name);

    ctx.send(
        poise::CreateReply::default()
            .content(format!("**{}** can now review verification requests.", user.name))
            .ephemeral(true),
    )
    .await?;
    complete_audit(&ctx, audit).await;
    Ok(())
}

/// Remove a reviewer from this guild
#[poise::command(slash_command, guild_only, rename = "remove")]
pub async fn reviewer_remove(
    ctx: Context<'_>,
    #[description = "Reviewer to remove"] user: serenity::User,
) -> Result<(), Error> {
    if !ensure_staff(&ctx).await? {
        return deny_non_staff(&ctx).await;
    }
    let audit = record_audit(&ctx, "reviewer remove", audit_options(&user)).await;

    let guild_id = ctx.guild_id().map(|g| g.get()).unwrap_or_default();
    let removed = {
        let mut store = ctx.data().manager.store().write().await;
        store.remove_reviewer(guild_id, user.id.get()).await?
    };

    let content = if removed {
        format!("**{}** is no longer a reviewer.", user.name)
    } else {
        format!("**{}** was not a reviewer.", user.name)
    };
    ctx.send(
        poise::CreateReply::default()
            .content(content)
            .ephemeral(true),
    )
    .await?;
    complete_audit(&ctx, audit).await;
    Ok(())
}

/// List reviewers for this guild
#[poise::command(slash_command, guild_only, rename = "list")]
pub async fn reviewer_list(ctx: Context<'_>) -> Result<(), Error> {
    if !ensure_staff(&ctx).await? {
        return deny_non_staff(&ctx).await;
    }

    let guild_id = ctx.guild_id().map(|g| g.get()).unwrap_or_default();
    let names: Vec<String> = {
        let store = ctx.data().manager.store().read().await;
        store
            .reviewers_for_guild(guild_id)
            .iter()
            .map(|r| r.identity.display_name())
            .collect()
    };

    let content = if names.is_empty() {
        "No reviewers registered for this guild.".to_string()
    } else {
        format!("Reviewers: {}", names.join(", "))
    };
    ctx.send(
        poise::CreateReply::default()
            .content(content)
            .ephemeral(true),
    )
    .await?;
    Ok(())
}
