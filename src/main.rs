use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Discord bot for student identity verification
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Force re-sync of slash commands to all guilds (use when commands aren't showing up)
    #[arg(long, short = 's')]
    sync_commands: bool,

    /// Register commands per-guild instead of globally (faster for testing)
    #[arg(long)]
    guild_commands: bool,

    /// Specific guild ID to sync commands to (for testing)
    #[arg(long)]
    guild_id: Option<u64>,
}

mod commands;
mod config;
mod error;
mod logging;
mod managers;
mod messages;
mod state;
mod web;

use commands::{help, manage, ping, request_evidence, reviewer, trust, verify};
use config::GuildDirectory;
use managers::{
    create_shared_dispatcher, create_shared_verification_manager, spawn_dispatcher_worker,
    DiscordEffects, EmailConfig, OAuthVerifier, SharedVerificationManager,
};
use state::{
    create_shared_audit_log, create_shared_identity_store, AuditLog, IdentityStore,
    SharedAuditLog,
};

type Error = Box<dyn std::error::Error + Send + Sync>;
type Context<'a> = poise::Context<'a, Data, Error>;

/// Shared application state
pub struct Data {
    pub manager: SharedVerificationManager,
    pub guilds: GuildDirectory,
    pub audit: SharedAuditLog,
    /// Public base URL used in verification links
    pub base_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    // Log buffer backing the operator error channel and the panel stream
    let log_buffer = logging::create_log_buffer(1000);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true),
        )
        .with(tracing_subscriber::filter::LevelFilter::INFO)
        .with(logging::LogCaptureLayer::new(log_buffer.clone()))
        .init();

    let token = std::env::var("DISCORD_TOKEN").expect("Missing DISCORD_TOKEN environment variable");

    let data_path = std::env::var("DATA_PATH").unwrap_or_else(|_| "data".to_string());
    let state_path = std::env::var("STATE_PATH").unwrap_or_else(|_| "state".to_string());
    tokio::fs::create_dir_all(&state_path).await.ok();

    info!("Loading identity store...");
    let store_path = format!("{}/identity_store.json", state_path);
    let identity_store = IdentityStore::load(&store_path).await.unwrap_or_else(|e| {
        warn!("Could not load identity store: {}, starting empty", e);
        IdentityStore::empty(&store_path)
    });
    let shared_store = create_shared_identity_store(identity_store);

    info!("Loading audit log...");
    let audit_path = format!("{}/audit_log.json", state_path);
    let audit_log = AuditLog::load(&audit_path).await.unwrap_or_else(|e| {
        warn!("Could not load audit log: {}, starting empty", e);
        AuditLog::empty(&audit_path)
    });
    let shared_audit = create_shared_audit_log(audit_log);

    let guilds = GuildDirectory::new(&data_path);
    match guilds.configured_guilds().await {
        Ok(configs) => info!("Loaded configuration for {} guild(s)", configs.len()),
        Err(e) => warn!("Guild configuration not readable yet: {}", e),
    }

    // The verifier validates against a fixed issuer and client id
    let oauth_issuer = std::env::var("OAUTH_ISSUER")
        .unwrap_or_else(|_| "https://accounts.google.com".to_string());
    let oauth_client_id = std::env::var("OAUTH_CLIENT_ID").unwrap_or_default();
    if oauth_client_id.is_empty() {
        warn!("OAUTH_CLIENT_ID not set: the OAuth verification path is disabled");
    }
    let verifier = OAuthVerifier::new(oauth_issuer, oauth_client_id);

    let manager = create_shared_verification_manager(shared_store.clone(), verifier);

    let base_url =
        std::env::var("WEB_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

    let outbox_poll = std::env::var("OUTBOX_POLL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30u64);

    let sync_commands = args.sync_commands;
    let guild_commands = args.guild_commands;
    let target_guild_id = args.guild_id;

    if sync_commands {
        info!("--sync-commands: Will force re-register slash commands");
    }
    if guild_commands {
        info!("--guild-commands: Will register commands per-guild (faster for testing)");
    } else {
        info!("Registering commands globally by default (takes up to 1 hour to propagate)");
    }

    let framework_manager = manager.clone();
    let framework_store = shared_store.clone();
    let framework_guilds = guilds.clone();
    let framework_base_url = base_url.clone();

    // Build framework
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                ping(),
                help(),
                verify(),
                manage(),
                trust(),
                request_evidence(),
                reviewer(),
            ],
            pre_command: |ctx| {
                Box::pin(async move {
                    info!(
                        "Command '{}' invoked by {} (ID: {}) in {}",
                        ctx.command().qualified_name,
                        ctx.author().name,
                        ctx.author().id,
                        ctx.guild_id()
                            .map(|g| g.to_string())
                            .unwrap_or_else(|| "DM".to_string())
                    );
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    info!(
                        "Command '{}' completed for {}",
                        ctx.command().qualified_name,
                        ctx.author().name
                    );
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    match error {
                        poise::FrameworkError::Command { error, ctx, .. } => {
                            error!(
                                "Error in command '{}': {}",
                                ctx.command().qualified_name,
                                error
                            );
                            let _ = ctx.say(format!("An error occurred: {}", error)).await;
                        }
                        poise::FrameworkError::GuildOnly { ctx, .. } => {
                            error!(
                                "Command '{}' is guild-only, used in DM by {}",
                                ctx.command().qualified_name,
                                ctx.author().name
                            );
                        }
                        other => {
                            error!("Other framework error: {}", other);
                        }
                    }
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            let manager = framework_manager;
            let store = framework_store;
            let guilds = framework_guilds;
            let base_url = framework_base_url;
            let audit = shared_audit;
            let log_buffer = log_buffer.clone();

            Box::pin(async move {
                info!("Bot logged in as: {}", ready.user.name);

                // Determine which guilds to register commands for
                let guilds_to_register: Vec<serenity::GuildId> =
                    if let Some(gid) = target_guild_id {
                        vec![serenity::GuildId::new(gid)]
                    } else {
                        ready.guilds.iter().map(|g| g.id).collect()
                    };

                if guild_commands || sync_commands {
                    for guild_id in &guilds_to_register {
                        info!("Registering commands to guild: {}", guild_id);
                        if let Err(e) = poise::builtins::register_in_guild(
                            ctx,
                            &framework.options().commands,
                            *guild_id,
                        )
                        .await
                        {
                            error!("Failed to register commands for guild {}: {}", guild_id, e);
                        }
                    }
                } else {
                    info!("Registering commands globally...");
                    if let Err(e) =
                        poise::builtins::register_globally(ctx, &framework.options().commands)
                            .await
                    {
                        error!("Failed to register commands globally: {}", e);
                    }
                }

                // Outbox worker delivering decision side effects
                let effects = Arc::new(DiscordEffects::new(
                    ctx.http.clone(),
                    EmailConfig::from_env(),
                ));
                let dispatcher = create_shared_dispatcher(
                    store.clone(),
                    guilds.clone(),
                    effects,
                    base_url.clone(),
                );
                spawn_dispatcher_worker(dispatcher, Duration::from_secs(outbox_poll));

                // Web server for the OAuth flow and the review panel
                match (web::OAuthState::from_env(), web::DiscordOAuth::from_env()) {
                    (Some(oauth_state), Some(discord_oauth)) => {
                        let web_config = web::WebServerConfig::from_env();
                        let admin_state = web::AdminState {
                            oauth: discord_oauth,
                            manager: manager.clone(),
                            store: store.clone(),
                            session_store: web::create_session_store(),
                            log_buffer: log_buffer.clone(),
                        };
                        let web_manager = manager.clone();

                        tokio::spawn(async move {
                            info!(
                                "Starting verification web server on HTTPS port {}...",
                                web_config.https_port
                            );
                            if let Err(e) = web::start_web_server(
                                web_config,
                                oauth_state,
                                web_manager,
                                admin_state,
                            )
                            .await
                            {
                                error!("Web server error: {}", e);
                            }
                        });
                    }
                    _ => {
                        warn!(
                            "Web server not started: OAUTH_CLIENT_ID, DISCORD_CLIENT_ID or \
                             DISCORD_CLIENT_SECRET not set"
                        );
                    }
                }

                Ok(Data {
                    manager,
                    guilds,
                    audit,
                    base_url,
                })
            })
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged() | serenity::GatewayIntents::GUILD_MEMBERS;

    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await?;

    info!("Starting bot...");
    if let Err(e) = client.start().await {
        error!("Failed to start bot: {}", e);
        return Err(e.into());
    }
    warn!("Bot ended.");

    Ok(())
}
