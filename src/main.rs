//! discord-relay CLI entry point.

use anyhow::Context as _;
use clap::Parser;
use discord_relay::config::Config;
use discord_relay::messaging::{DiscordHandler, RelayEvent, SerenityWebhooks};
use discord_relay::relay::Relay;
use serenity::http::Http;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "discord-relay")]
#[command(about = "Discord relay with webhook personas and proxy-aware author resolution")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("starting discord-relay");

    let config = match cli.config {
        Some(config_path) => Config::load_from_path(&config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?,
        None => Config::load().with_context(|| "failed to load configuration")?,
    };
    let token = config.require_token()?.to_string();

    let webhooks = SerenityWebhooks::new(Arc::new(Http::new(&token)));
    let relay = Arc::new(Relay::new(&config, Arc::new(webhooks.clone())).context("failed to build relay")?);
    let sweepers = relay.start_sweepers();

    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(256);
    let handler = DiscordHandler::new(relay.clone(), event_tx);

    let mut client = serenity::Client::builder(&token, discord_relay::messaging::discord::intents())
        .event_handler(handler)
        .await
        .context("failed to build discord client")?;
    let shard_manager = client.shard_manager.clone();

    let gateway = tokio::spawn(async move { client.start().await });

    let event_loop = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                RelayEvent::Ready { bot_name, guilds } => {
                    tracing::info!(%bot_name, guilds, "relay ready");
                }
                RelayEvent::Message { message, verdict } => {
                    tracing::debug!(
                        message_id = message.id,
                        channel_id = message.channel_id,
                        author = %verdict.author,
                        is_proxy = verdict.is_proxy,
                        identity_verification_allowed = verdict.identity_verification_allowed,
                        "relay event"
                    );
                }
            }
        }
    });

    tracing::info!("discord-relay started");

    tokio::select! {
        result = gateway => {
            match result {
                Ok(Ok(())) => tracing::info!("gateway closed"),
                Ok(Err(error)) => tracing::error!(%error, "gateway failed"),
                Err(error) => tracing::error!(%error, "gateway task panicked"),
            }
        }
        _ = event_loop => {
            tracing::info!("event loop ended");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    tracing::info!("shutting down...");
    shard_manager.shutdown_all().await;
    for mut sweeper in sweepers {
        sweeper.stop();
    }

    let state = relay.queue().state();
    tracing::info!(
        pending = state.pending,
        active = state.active_count,
        webhooks = relay.webhooks().len(),
        "discord-relay stopped"
    );
    Ok(())
}
