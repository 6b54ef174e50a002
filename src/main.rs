mod config;
mod mirror;
mod platform;
mod store;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use teloxide::prelude::*;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::mirror::filter::build_filter;
use crate::mirror::mapping::MirrorMapping;
use crate::mirror::relay::Relay;
use crate::mirror::{MirrorContext, MirrorEngine};
use crate::platform::discord::DiscordClient;
use crate::platform::telegram::{self, TelegramClient};
use crate::platform::SourceClient;
use crate::store::SqliteMappingStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,telemirror=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Source chats: {:?}", config.source_chats());
    info!("  Mirror routes: {}", config.mirror.routes.len());
    info!("  Discord relay: {}", config.crosspost_enabled());

    let store = Arc::new(SqliteMappingStore::open(&config.storage.database_path)?);
    info!("  Stored mappings: {}", store.count().await?);

    let filter = build_filter(&config.filter)?;

    let bot = Bot::new(&config.telegram.bot_token);
    let me = bot
        .get_me()
        .await
        .context("Cannot be authorized, check the Telegram bot token")?;
    info!(
        "Authorized as {} (@{})",
        me.user.first_name,
        me.user.username.as_deref().unwrap_or("unknown")
    );

    let client: Arc<dyn SourceClient> = Arc::new(TelegramClient::new(bot.clone()));

    let relay = match &config.discord {
        Some(discord) => Some(Arc::new(Relay::new(
            Arc::new(DiscordClient::new(discord)),
            Arc::clone(&client),
            discord.max_concurrent_sessions,
            &discord.media_dir,
        )?)),
        None => None,
    };

    let ctx = MirrorContext::new(
        MirrorMapping::from_routes(&config.mirror.routes),
        filter,
        config.source_chats(),
    );
    info!("Listening to {} source chat(s)", ctx.source_count());

    let engine = Arc::new(MirrorEngine::new(Arc::new(ctx), client, store, relay));

    info!("Channels mirroring was started...");
    telegram::run(
        bot,
        engine,
        Duration::from_millis(config.album.quiet_window_ms),
    )
    .await?;

    Ok(())
}
