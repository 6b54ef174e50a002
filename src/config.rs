use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub album: AlbumConfig,
    #[serde(default = "default_storage_config")]
    pub storage: StorageConfig,
    /// Cross-posting to Discord is enabled by the presence of this section
    pub discord: Option<DiscordConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    /// Falls back to the TELEGRAM_BOT_TOKEN environment variable when empty
    #[serde(default)]
    pub bot_token: String,
    /// Chats to listen to in addition to every route source
    #[serde(default)]
    pub source_chats: Vec<i64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MirrorConfig {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub source: i64,
    pub targets: Vec<i64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FilterConfig {
    #[serde(default)]
    pub remove_urls: bool,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub whitelist: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AlbumConfig {
    /// How long to wait for further items before sending an album
    #[serde(default = "default_quiet_window_ms")]
    pub quiet_window_ms: u64,
}

impl Default for AlbumConfig {
    fn default() -> Self {
        Self {
            quiet_window_ms: default_quiet_window_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscordConfig {
    /// Falls back to the DISCORD_BOT_TOKEN environment variable when empty
    #[serde(default)]
    pub bot_token: String,
    pub guild_id: u64,
    pub channel_id: u64,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
}

fn default_quiet_window_ms() -> u64 {
    800
}

fn default_db_path() -> PathBuf {
    PathBuf::from("telemirror.db")
}

fn default_storage_config() -> StorageConfig {
    StorageConfig {
        database_path: default_db_path(),
    }
}

fn default_max_concurrent_sessions() -> usize {
    4
}

fn default_media_dir() -> PathBuf {
    std::env::temp_dir().join("telemirror")
}

fn token_from_env(value: &mut String, var: &str) {
    if value.trim().is_empty() {
        if let Ok(token) = std::env::var(var) {
            *value = token;
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::parse(&content)?;

        token_from_env(&mut config.telegram.bot_token, "TELEGRAM_BOT_TOKEN");
        if let Some(discord) = config.discord.as_mut() {
            token_from_env(&mut discord.bot_token, "DISCORD_BOT_TOKEN");
        }

        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            bail!("telegram.bot_token is empty and TELEGRAM_BOT_TOKEN is not set");
        }
        if !self.mirror_enabled() && !self.crosspost_enabled() {
            bail!("Nothing to do: configure [[mirror.routes]] and/or a [discord] section");
        }
        if self.source_chats().is_empty() {
            bail!("No source chats configured");
        }
        if let Some(discord) = &self.discord {
            if discord.bot_token.trim().is_empty() {
                bail!("discord.bot_token is empty and DISCORD_BOT_TOKEN is not set");
            }
            if discord.max_concurrent_sessions == 0 {
                bail!("discord.max_concurrent_sessions must be at least 1");
            }
        }
        for route in &self.mirror.routes {
            if route.targets.is_empty() {
                warn!("Route for source {} has no targets", route.source);
            }
        }
        Ok(())
    }

    /// Every chat the bot listens to, sorted
    pub fn source_chats(&self) -> Vec<i64> {
        let mut chats: Vec<i64> = self
            .telegram
            .source_chats
            .iter()
            .copied()
            .chain(self.mirror.routes.iter().map(|r| r.source))
            .collect();
        chats.sort_unstable();
        chats.dedup();
        chats
    }

    /// Same-platform mirroring with edit tracking
    pub fn mirror_enabled(&self) -> bool {
        !self.mirror.routes.is_empty()
    }

    /// Cross-posting to Discord
    pub fn crosspost_enabled(&self) -> bool {
        self.discord.is_some()
    }
}
