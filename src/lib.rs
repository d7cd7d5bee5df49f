//! Discord relay: webhook-identity reply delivery with proxy-aware author resolution.

pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod messaging;
pub mod proxy;
pub mod relay;
pub mod sweep;
pub mod webhooks;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// Discord snowflake identifier (users, channels, guilds, messages, webhooks).
pub type Snowflake = u64;

/// Inbound message as seen by the relay, independent of the gateway library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    pub guild_id: Option<Snowflake>,
    pub author: MessageAuthor,
    /// Guild nickname of the author, when Discord sent member data.
    pub member_nick: Option<String>,
    /// Set when the message was posted through a webhook.
    pub webhook_id: Option<Snowflake>,
    /// Application that produced the message (bots and app-owned webhooks).
    pub application_id: Option<Snowflake>,
    pub content: String,
    pub embeds: Vec<EmbedSummary>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl RelayMessage {
    pub fn is_webhook(&self) -> bool {
        self.webhook_id.is_some()
    }

    /// Every display label attached to the author (username, global name, nickname).
    pub fn display_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.author.username.as_str())
            .chain(self.author.global_name.as_deref())
            .chain(self.member_nick.as_deref())
    }
}

/// Author fields carried on a message. For webhook messages these describe the
/// webhook's display identity, not a real account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAuthor {
    pub id: Snowflake,
    pub username: String,
    pub global_name: Option<String>,
    pub bot: bool,
}

/// The parts of an embed the proxy heuristics look at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedSummary {
    pub title: Option<String>,
    pub footer: Option<String>,
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
}

/// Where a reply is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    Channel { id: Snowflake },
    /// Threads cannot own webhooks; sends go through the parent's webhook.
    Thread { id: Snowflake, parent_id: Snowflake },
}

impl Destination {
    pub fn id(&self) -> Snowflake {
        match self {
            Destination::Channel { id } | Destination::Thread { id, .. } => *id,
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::Channel { id } => write!(f, "channel:{}", id),
            Destination::Thread { id, parent_id } => write!(f, "thread:{}/{}", parent_id, id),
        }
    }
}

/// Display identity a reply is posted under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub avatar_url: Option<String>,
}

impl Persona {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            avatar_url: None,
        }
    }

    pub fn with_avatar(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }
}
