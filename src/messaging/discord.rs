//! Discord gateway and HTTP glue using serenity.

use crate::error::{DeliveryError, WebhookError};
use crate::relay::{InboundVerdict, Relay};
use crate::webhooks::{ExistingWebhook, WebhookCredential, WebhookDirectory, WebhookExecutor, WebhookPayload};
use crate::{Destination, EmbedField, EmbedSummary, MessageAuthor, RelayMessage, Snowflake};

use async_trait::async_trait;
use serenity::all::{
    ChannelId, ChannelType, Context, CreateWebhook, EventHandler, GatewayIntents, GuildChannel, GuildId, Message,
    MessageId, PartialGuildChannel, Ready, Webhook, WebhookId,
};
use serenity::http::{Http, HttpError};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Gateway intents the relay needs to see message content and deletions.
pub fn intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
}

/// What the gateway handler hands to the command layer.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Ready { bot_name: String, guilds: usize },
    Message { message: RelayMessage, verdict: InboundVerdict },
}

/// Serenity event handler feeding the relay.
pub struct DiscordHandler {
    relay: Arc<Relay>,
    events: mpsc::Sender<RelayEvent>,
    /// Zero until the gateway reports ready.
    bot_user_id: AtomicU64,
}

impl DiscordHandler {
    pub fn new(relay: Arc<Relay>, events: mpsc::Sender<RelayEvent>) -> Self {
        Self {
            relay,
            events,
            bot_user_id: AtomicU64::new(0),
        }
    }

    fn is_own_message(&self, message: &RelayMessage) -> bool {
        if message.author.id == self.bot_user_id.load(Ordering::Relaxed) {
            return true;
        }
        message
            .webhook_id
            .is_some_and(|webhook_id| self.relay.webhooks().owns_webhook(webhook_id))
    }

    async fn emit(&self, event: RelayEvent) {
        if self.events.send(event).await.is_err() {
            tracing::warn!("relay event receiver dropped");
        }
    }
}

#[async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        self.bot_user_id.store(ready.user.id.get(), Ordering::Relaxed);

        // Webhooks may have been deleted while we were disconnected
        let dropped = self.relay.reset();
        tracing::info!(
            bot_name = %ready.user.name,
            guilds = ready.guilds.len(),
            dropped_webhooks = dropped,
            "discord connected"
        );

        self.emit(RelayEvent::Ready {
            bot_name: ready.user.name.clone(),
            guilds: ready.guilds.len(),
        })
        .await;
    }

    async fn message(&self, _ctx: Context, message: Message) {
        let message = relay_message(&message);
        if self.is_own_message(&message) {
            return;
        }

        let verdict = self.relay.observe_message(&message);
        self.emit(RelayEvent::Message { message, verdict }).await;
    }

    async fn message_delete(
        &self,
        _ctx: Context,
        channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<GuildId>,
    ) {
        tracing::trace!(channel_id = channel_id.get(), message_id = deleted_message_id.get(), "message deleted");
        self.relay.observe_delete(deleted_message_id.get());
    }

    async fn message_delete_bulk(
        &self,
        _ctx: Context,
        _channel_id: ChannelId,
        multiple_deleted_messages_ids: Vec<MessageId>,
        _guild_id: Option<GuildId>,
    ) {
        for message_id in multiple_deleted_messages_ids {
            self.relay.observe_delete(message_id.get());
        }
    }

    async fn channel_delete(&self, _ctx: Context, channel: GuildChannel, _messages: Option<Vec<Message>>) {
        self.relay.observe_destination_deleted(channel.id.get());
    }

    async fn thread_delete(&self, _ctx: Context, thread: PartialGuildChannel, _full_thread_data: Option<GuildChannel>) {
        self.relay.observe_destination_deleted(thread.id.get());
    }
}

/// Convert a serenity message into the relay's own representation.
pub fn relay_message(message: &Message) -> RelayMessage {
    RelayMessage {
        id: message.id.get(),
        channel_id: message.channel_id.get(),
        guild_id: message.guild_id.map(|id| id.get()),
        author: MessageAuthor {
            id: message.author.id.get(),
            username: message.author.name.clone(),
            global_name: message.author.global_name.clone(),
            bot: message.author.bot,
        },
        member_nick: message.member.as_ref().and_then(|member| member.nick.clone()),
        webhook_id: message.webhook_id.map(|id| id.get()),
        application_id: message.application_id.map(|id| id.get()),
        content: message.content.clone(),
        embeds: message
            .embeds
            .iter()
            .map(|embed| EmbedSummary {
                title: embed.title.clone(),
                footer: embed.footer.as_ref().map(|footer| footer.text.clone()),
                fields: embed
                    .fields
                    .iter()
                    .map(|field| EmbedField {
                        name: field.name.clone(),
                        value: field.value.clone(),
                    })
                    .collect(),
            })
            .collect(),
        timestamp: chrono::DateTime::from_timestamp(message.timestamp.unix_timestamp(), 0)
            .unwrap_or_else(chrono::Utc::now),
    }
}

/// Work out where a reply to `channel_id` goes. Threads post through their parent.
pub async fn resolve_destination(http: &Http, channel_id: Snowflake) -> crate::Result<Destination> {
    let channel = http.get_channel(ChannelId::new(channel_id)).await?;

    let destination = match channel.guild() {
        Some(channel)
            if matches!(
                channel.kind,
                ChannelType::PublicThread | ChannelType::PrivateThread | ChannelType::NewsThread
            ) =>
        {
            match channel.parent_id {
                Some(parent_id) => Destination::Thread {
                    id: channel_id,
                    parent_id: parent_id.get(),
                },
                None => Destination::Channel { id: channel_id },
            }
        }
        _ => Destination::Channel { id: channel_id },
    };

    Ok(destination)
}

/// Webhook listing, creation and execution over Discord's HTTP API.
#[derive(Clone)]
pub struct SerenityWebhooks {
    http: Arc<Http>,
}

impl SerenityWebhooks {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }

    pub fn http(&self) -> &Arc<Http> {
        &self.http
    }
}

impl std::fmt::Debug for SerenityWebhooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerenityWebhooks").finish_non_exhaustive()
    }
}

#[async_trait]
impl WebhookDirectory for SerenityWebhooks {
    async fn list_webhooks(&self, channel_id: Snowflake) -> Result<Vec<ExistingWebhook>, WebhookError> {
        let webhooks = ChannelId::new(channel_id)
            .webhooks(&*self.http)
            .await
            .map_err(|error| WebhookError::List {
                channel_id,
                reason: error.to_string(),
            })?;

        Ok(webhooks.iter().map(existing_webhook).collect())
    }

    async fn create_webhook(&self, channel_id: Snowflake, name: &str) -> Result<ExistingWebhook, WebhookError> {
        let webhook = ChannelId::new(channel_id)
            .create_webhook(&*self.http, CreateWebhook::new(name))
            .await
            .map_err(|error| WebhookError::Create {
                channel_id,
                reason: error.to_string(),
            })?;

        Ok(existing_webhook(&webhook))
    }
}

#[async_trait]
impl WebhookExecutor for SerenityWebhooks {
    async fn execute(&self, credential: &WebhookCredential, payload: &WebhookPayload) -> Result<(), DeliveryError> {
        self.http
            .execute_webhook(
                WebhookId::new(credential.webhook_id),
                credential.thread_id.map(ChannelId::new),
                &credential.token,
                false,
                Vec::new(),
                payload,
            )
            .await
            .map(|_| ())
            .map_err(delivery_error)
    }
}

fn existing_webhook(webhook: &Webhook) -> ExistingWebhook {
    ExistingWebhook {
        webhook_id: webhook.id.get(),
        name: webhook.name.clone(),
        token: webhook.url().ok().and_then(|url| token_from_url(&url)),
    }
}

/// The token is the last path segment of `https://discord.com/api/webhooks/<id>/<token>`.
fn token_from_url(url: &str) -> Option<String> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|token| !token.is_empty() && !token.contains(':'))
        .map(str::to_string)
}

fn delivery_error(error: serenity::Error) -> DeliveryError {
    let mapped = match &error {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) => status_error(response.status_code.as_u16()),
        _ => None,
    };
    mapped.unwrap_or_else(|| DeliveryError::Failed(error.to_string()))
}

fn status_error(status: u16) -> Option<DeliveryError> {
    match status {
        429 => Some(DeliveryError::Throttled { retry_after: None }),
        404 => Some(DeliveryError::UnknownWebhook),
        _ => None,
    }
}
