use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DiscordConfig;
use crate::mirror::relay::{RelaySession, RelayTarget};

const API_BASE: &str = "https://discord.com/api/v10";

/// Discord's message content limit, in characters
pub const MESSAGE_LIMIT: usize = 2000;

/// Posts to one fixed Discord channel with a bot token.
///
/// No gateway connection is kept: each relayed message opens its own short-lived session.
pub struct DiscordClient {
    token: String,
    guild_id: u64,
    channel_id: u64,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct CurrentUser {
    username: String,
}

#[derive(Debug, Deserialize)]
struct GuildChannel {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

impl DiscordClient {
    pub fn new(config: &DiscordConfig) -> Self {
        Self {
            token: config.bot_token.clone(),
            guild_id: config.guild_id,
            channel_id: config.channel_id,
            api_base: API_BASE.to_string(),
        }
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token)
    }
}

#[async_trait]
impl RelayTarget for DiscordClient {
    async fn open_session(&self) -> Result<Box<dyn RelaySession>> {
        let session_id = Uuid::new_v4();
        let http = reqwest::Client::builder()
            .user_agent(concat!("telemirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build Discord HTTP client")?;

        let me: CurrentUser = http
            .get(format!("{}/users/@me", self.api_base))
            .header(AUTHORIZATION, self.auth())
            .send()
            .await
            .context("Discord login request failed")?
            .error_for_status()
            .context("Discord rejected the bot token")?
            .json()
            .await
            .context("Failed to parse Discord user")?;

        let channels: Vec<GuildChannel> = http
            .get(format!("{}/guilds/{}/channels", self.api_base, self.guild_id))
            .header(AUTHORIZATION, self.auth())
            .send()
            .await
            .context("Discord guild lookup failed")?
            .error_for_status()
            .with_context(|| format!("Guild {} is not accessible", self.guild_id))?
            .json()
            .await
            .context("Failed to parse Discord guild channels")?;

        let channel_id = self.channel_id.to_string();
        let channel = channels
            .into_iter()
            .find(|c| c.id == channel_id)
            .with_context(|| {
                format!("Channel {} not found in guild {}", self.channel_id, self.guild_id)
            })?;

        debug!(
            "Discord session {} opened as {} for #{}",
            session_id,
            me.username,
            channel.name.as_deref().unwrap_or(&channel_id)
        );

        Ok(Box::new(DiscordSession {
            http,
            auth: self.auth(),
            url: format!("{}/channels/{}/messages", self.api_base, channel_id),
            session_id,
        }))
    }
}

struct DiscordSession {
    http: reqwest::Client,
    auth: String,
    url: String,
    session_id: Uuid,
}

impl DiscordSession {
    async fn post(&self, content: &str, attachment: Option<&Path>) -> Result<()> {
        let request = self.http.post(&self.url).header(AUTHORIZATION, &self.auth);

        let request = match attachment {
            Some(path) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read attachment: {}", path.display()))?;
                let file_name = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or("attachment")
                    .to_string();
                let form = Form::new()
                    .text("payload_json", attachment_payload(content, &file_name).to_string())
                    .part("files[0]", Part::bytes(bytes).file_name(file_name));
                request.multipart(form)
            }
            None => request.json(&json!({ "content": content })),
        };

        let response = request.send().await.context("Discord request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Discord API returned {}: {}", status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl RelaySession for DiscordSession {
    /// Long text is split into several posts; the attachment goes on the last one
    async fn send(&mut self, text: &str, attachment: Option<&Path>) -> Result<()> {
        let chunks = split_message(text, MESSAGE_LIMIT);
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            let file = if i == last { attachment } else { None };
            self.post(chunk, file).await?;
        }
        Ok(())
    }

    async fn close(self: Box<Self>) {
        info!("Discord session {} closed", self.session_id);
    }
}

fn attachment_payload(content: &str, file_name: &str) -> serde_json::Value {
    json!({
        "content": content,
        "attachments": [{ "id": 0, "filename": file_name }],
    })
}

/// Split text into chunks of at most `max_len` bytes, preferring line and word breaks
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}
