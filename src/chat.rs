//! The chat platform surface the pipeline consumes: channel listing, history
//! pages, message sending, reactions, direct messages and attachment
//! downloads. The daemon only ever talks to this trait; the REST adapter
//! below is the production implementation.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{
    Context,
    Result,
    bail,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::sync_ext::MutexExt;

pub type ChannelId = u64;
pub type MessageId = u64;
pub type UserId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub guild_id: u64,
    pub guild: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAttachment {
    pub id: u64,
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub content: String,
    pub attachments: Vec<MessageAttachment>,
    pub jump_url: String,
}

/// Everything the ingestion loop and the completion reactor need from the
/// chat platform. All calls are blocking; errors carry enough context to be
/// logged as-is.
pub trait ChatClient: Send + Sync {
    fn list_channels(&self) -> Result<Vec<ChannelInfo>>;

    /// One page of a channel's history strictly after `after`, oldest first.
    /// An empty page means the traversal caught up.
    fn history_page(
        &self,
        channel: ChannelId,
        after: Option<MessageId>,
    ) -> Result<Vec<ChatMessage>>;

    fn send_message(
        &self,
        channel: ChannelId,
        content: &str,
        reply_to: Option<(ChannelId, MessageId)>,
    ) -> Result<MessageId>;

    /// Posts a file into a channel; returns the resulting message's jump URL.
    fn upload_file(
        &self,
        channel: ChannelId,
        content: &str,
        file: &Path,
        reply_to: Option<(ChannelId, MessageId)>,
    ) -> Result<String>;

    fn fetch_message(&self, channel: ChannelId, message: MessageId)
    -> Result<Option<ChatMessage>>;

    fn add_reaction(&self, channel: ChannelId, message: MessageId, emoji: &str) -> Result<()>;

    fn remove_own_reaction(
        &self,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
    ) -> Result<()>;

    fn direct_message(&self, user: UserId, content: &str) -> Result<()>;

    fn download_attachment(&self, attachment: &MessageAttachment, dest: &Path) -> Result<()>;
}

const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
const HISTORY_PAGE_LIMIT: u32 = 100;
const RATE_LIMIT_RETRIES: u32 = 5;

/// REST-polling Discord client. No gateway connection: history replay and
/// the poll cadence in the orchestrator cover message delivery.
pub struct DiscordRestClient {
    http: reqwest::blocking::Client,
    token: String,
    base_url: String,
    guild_by_channel: Mutex<HashMap<ChannelId, u64>>,
}

#[derive(Debug, Deserialize)]
struct WireGuild {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    id: String,
    #[serde(rename = "type")]
    kind: u32,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAttachment {
    id: String,
    filename: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    channel_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
}

#[derive(Debug, Deserialize)]
struct WireDmChannel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireRateLimit {
    retry_after: f64,
}

const GUILD_TEXT_CHANNEL: u32 = 0;

impl DiscordRestClient {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(token, DEFAULT_API_BASE)
    }

    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build HTTP client for the chat API")?;
        Ok(Self {
            http,
            token: token.into(),
            base_url: base_url.into(),
            guild_by_channel: Mutex::new(HashMap::new()),
        })
    }

    fn request(
        &self,
        build: impl Fn(&reqwest::blocking::Client) -> reqwest::blocking::RequestBuilder,
    ) -> Result<reqwest::blocking::Response> {
        for _ in 0..RATE_LIMIT_RETRIES {
            let response = build(&self.http)
                .header("Authorization", format!("Bot {}", self.token))
                .send()
                .context("chat API request failed")?;
            if response.status().as_u16() == 429 {
                let retry_after = response
                    .json::<WireRateLimit>()
                    .map(|r| r.retry_after)
                    .unwrap_or(1.0);
                warn!(retry_after, "chat API rate limited; backing off");
                std::thread::sleep(Duration::from_secs_f64(retry_after.max(0.1)));
                continue;
            }
            return Ok(response);
        }
        bail!("chat API rate limit persisted after {RATE_LIMIT_RETRIES} retries")
    }

    fn jump_url(&self, channel: ChannelId, message: MessageId) -> String {
        let guild = self
            .guild_by_channel
            .lock_unpoisoned()
            .get(&channel)
            .copied();
        match guild {
            Some(guild) => {
                format!("https://discord.com/channels/{guild}/{channel}/{message}")
            }
            None => format!("https://discord.com/channels/@me/{channel}/{message}"),
        }
    }

    fn decode_message(&self, wire: WireMessage) -> Result<ChatMessage> {
        let id = parse_snowflake(&wire.id)?;
        let channel_id = parse_snowflake(&wire.channel_id)?;
        let attachments = wire
            .attachments
            .into_iter()
            .map(|a| {
                Ok(MessageAttachment {
                    id: parse_snowflake(&a.id)?,
                    filename: a.filename,
                    url: a.url,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ChatMessage {
            id,
            channel_id,
            content: wire.content,
            attachments,
            jump_url: self.jump_url(channel_id, id),
        })
    }

    fn message_reference(reply_to: Option<(ChannelId, MessageId)>) -> serde_json::Value {
        match reply_to {
            Some((channel, message)) => json!({
                "channel_id": channel.to_string(),
                "message_id": message.to_string(),
                "fail_if_not_exists": false,
            }),
            None => serde_json::Value::Null,
        }
    }
}

impl ChatClient for DiscordRestClient {
    fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
        let guilds: Vec<WireGuild> = self
            .request(|http| http.get(format!("{}/users/@me/guilds", self.base_url)))?
            .error_for_status()
            .context("failed to list guilds")?
            .json()
            .context("failed to decode guild list")?;

        let mut channels = Vec::new();
        for guild in guilds {
            let guild_id = parse_snowflake(&guild.id)?;
            let wire_channels: Vec<WireChannel> = self
                .request(|http| {
                    http.get(format!("{}/guilds/{}/channels", self.base_url, guild.id))
                })?
                .error_for_status()
                .with_context(|| format!("failed to list channels of guild {}", guild.name))?
                .json()
                .context("failed to decode channel list")?;
            for channel in wire_channels {
                if channel.kind != GUILD_TEXT_CHANNEL {
                    continue;
                }
                let Some(name) = channel.name else { continue };
                let id = parse_snowflake(&channel.id)?;
                self.guild_by_channel.lock_unpoisoned().insert(id, guild_id);
                channels.push(ChannelInfo {
                    id,
                    guild_id,
                    guild: guild.name.clone(),
                    name,
                });
            }
        }
        Ok(channels)
    }

    fn history_page(
        &self,
        channel: ChannelId,
        after: Option<MessageId>,
    ) -> Result<Vec<ChatMessage>> {
        let after = after.unwrap_or(0);
        let response = self.request(|http| {
            http.get(format!(
                "{}/channels/{channel}/messages?limit={HISTORY_PAGE_LIMIT}&after={after}",
                self.base_url
            ))
        })?;
        if response.status().as_u16() == 403 {
            bail!("history access to channel {channel} is forbidden");
        }
        let wire: Vec<WireMessage> = response
            .error_for_status()
            .with_context(|| format!("failed to read history of channel {channel}"))?
            .json()
            .context("failed to decode history page")?;
        let mut messages = wire
            .into_iter()
            .map(|m| self.decode_message(m))
            .collect::<Result<Vec<_>>>()?;
        // The endpoint serves newest-first; replay wants oldest-first.
        messages.sort_by_key(|m| m.id);
        Ok(messages)
    }

    fn send_message(
        &self,
        channel: ChannelId,
        content: &str,
        reply_to: Option<(ChannelId, MessageId)>,
    ) -> Result<MessageId> {
        let mut payload = json!({ "content": content });
        let reference = Self::message_reference(reply_to);
        if !reference.is_null() {
            payload["message_reference"] = reference;
        }
        let wire: WireMessage = self
            .request(|http| {
                http.post(format!("{}/channels/{channel}/messages", self.base_url))
                    .json(&payload)
            })?
            .error_for_status()
            .with_context(|| format!("failed to send message to channel {channel}"))?
            .json()
            .context("failed to decode sent message")?;
        parse_snowflake(&wire.id)
    }

    fn upload_file(
        &self,
        channel: ChannelId,
        content: &str,
        file: &Path,
        reply_to: Option<(ChannelId, MessageId)>,
    ) -> Result<String> {
        let mut payload = json!({ "content": content });
        let reference = Self::message_reference(reply_to);
        if !reference.is_null() {
            payload["message_reference"] = reference;
        }
        // Multipart bodies cannot be rebuilt for the rate-limit retry loop;
        // uploads are a single attempt.
        let form = reqwest::blocking::multipart::Form::new()
            .text("payload_json", payload.to_string())
            .file("files[0]", file)
            .with_context(|| format!("failed to attach {}", file.display()))?;
        let wire: WireMessage = self
            .http
            .post(format!("{}/channels/{channel}/messages", self.base_url))
            .header("Authorization", format!("Bot {}", self.token))
            .multipart(form)
            .send()
            .context("chat API request failed")?
            .error_for_status()
            .with_context(|| format!("failed to upload {} to channel {channel}", file.display()))?
            .json()
            .context("failed to decode upload response")?;
        let message = parse_snowflake(&wire.id)?;
        Ok(self.jump_url(channel, message))
    }

    fn fetch_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<ChatMessage>> {
        let response = self.request(|http| {
            http.get(format!(
                "{}/channels/{channel}/messages/{message}",
                self.base_url
            ))
        })?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let wire: WireMessage = response
            .error_for_status()
            .with_context(|| format!("failed to fetch message {message}"))?
            .json()
            .context("failed to decode fetched message")?;
        Ok(Some(self.decode_message(wire)?))
    }

    fn add_reaction(&self, channel: ChannelId, message: MessageId, emoji: &str) -> Result<()> {
        let encoded = urlencoding::encode(emoji);
        self.request(|http| {
            http.put(format!(
                "{}/channels/{channel}/messages/{message}/reactions/{encoded}/@me",
                self.base_url
            ))
        })?
        .error_for_status()
        .with_context(|| format!("failed to add reaction {emoji} to message {message}"))?;
        Ok(())
    }

    fn remove_own_reaction(
        &self,
        channel: ChannelId,
        message: MessageId,
        emoji: &str,
    ) -> Result<()> {
        let encoded = urlencoding::encode(emoji);
        let response = self.request(|http| {
            http.delete(format!(
                "{}/channels/{channel}/messages/{message}/reactions/{encoded}/@me",
                self.base_url
            ))
        })?;
        // Removing a reaction that is not there is fine.
        if response.status().as_u16() != 404 {
            response
                .error_for_status()
                .with_context(|| format!("failed to remove reaction {emoji}"))?;
        }
        Ok(())
    }

    fn direct_message(&self, user: UserId, content: &str) -> Result<()> {
        let dm: WireDmChannel = self
            .request(|http| {
                http.post(format!("{}/users/@me/channels", self.base_url))
                    .json(&json!({ "recipient_id": user.to_string() }))
            })?
            .error_for_status()
            .with_context(|| format!("failed to open DM channel to user {user}"))?
            .json()
            .context("failed to decode DM channel")?;
        let channel = parse_snowflake(&dm.id)?;
        self.send_message(channel, content, None)?;
        Ok(())
    }

    fn download_attachment(&self, attachment: &MessageAttachment, dest: &Path) -> Result<()> {
        let mut response = self
            .http
            .get(&attachment.url)
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .with_context(|| format!("failed to download attachment {}", attachment.url))?;
        let mut file = fs::File::create(dest)
            .with_context(|| format!("failed to create {}", dest.display()))?;
        std::io::copy(&mut response, &mut file)
            .with_context(|| format!("failed to stream attachment to {}", dest.display()))?;
        file.flush()
            .and_then(|()| file.sync_all())
            .with_context(|| format!("failed to fsync {}", dest.display()))?;
        Ok(())
    }
}

fn parse_snowflake(raw: &str) -> Result<u64> {
    raw.parse()
        .with_context(|| format!("invalid snowflake id {raw:?}"))
}
