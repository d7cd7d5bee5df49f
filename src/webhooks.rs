//! Per-destination webhook credentials, created once and reused.
//!
//! Channels own webhooks; threads post through their parent's webhook with a
//! `thread_id`. Thread credentials are cached under their own key so repeated
//! sends to a thread never re-resolve the parent.

use crate::error::{DeliveryError, WebhookError};
use crate::{Destination, Persona, Snowflake};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier and token of a webhook, scoped to where messages land.
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookCredential {
    pub webhook_id: Snowflake,
    pub token: String,
    /// Channel owning the webhook.
    pub channel_id: Snowflake,
    /// Set for thread-scoped credentials derived from the parent channel.
    pub thread_id: Option<Snowflake>,
}

impl std::fmt::Debug for WebhookCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookCredential")
            .field("webhook_id", &self.webhook_id)
            .field("token", &"<redacted>")
            .field("channel_id", &self.channel_id)
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

/// A webhook as returned by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingWebhook {
    pub webhook_id: Snowflake,
    pub name: Option<String>,
    /// Only present for webhooks created by an application we can act for.
    pub token: Option<String>,
}

/// Platform operations needed to find or make a webhook.
#[async_trait]
pub trait WebhookDirectory: Send + Sync + 'static {
    async fn list_webhooks(&self, channel_id: Snowflake) -> Result<Vec<ExistingWebhook>, WebhookError>;

    async fn create_webhook(&self, channel_id: Snowflake, name: &str) -> Result<ExistingWebhook, WebhookError>;
}

/// One webhook message: the text and the persona it is posted under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookPayload {
    pub content: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl WebhookPayload {
    pub fn new(persona: &Persona, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            username: persona.name.clone(),
            avatar_url: persona.avatar_url.clone(),
        }
    }
}

/// Performs a single webhook send. Retrying is the caller's business.
#[async_trait]
pub trait WebhookExecutor: Send + Sync + 'static {
    async fn execute(&self, credential: &WebhookCredential, payload: &WebhookPayload) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CacheKey {
    Channel(Snowflake),
    Thread(Snowflake),
}

/// Cache of delivery credentials for the life of the process.
pub struct WebhookCache {
    directory: Arc<dyn WebhookDirectory>,
    reserved_name: String,
    entries: Mutex<HashMap<CacheKey, Arc<WebhookCredential>>>,
    /// Serializes misses so two first sends to a channel create one webhook.
    resolving: tokio::sync::Mutex<()>,
    /// Bumped by every invalidation, under the `entries` lock. A lookup that
    /// started before a bump must not cache what it resolved.
    generation: AtomicU64,
}

impl std::fmt::Debug for WebhookCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookCache")
            .field("reserved_name", &self.reserved_name)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl WebhookCache {
    pub fn new(directory: Arc<dyn WebhookDirectory>, reserved_name: impl Into<String>) -> Self {
        Self {
            directory,
            reserved_name: reserved_name.into(),
            entries: Mutex::new(HashMap::new()),
            resolving: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Credential for sending to `destination`, creating a webhook on first use.
    ///
    /// Listing or creation failures are returned as-is and leave the cache untouched.
    pub async fn get_or_create(&self, destination: Destination) -> Result<Arc<WebhookCredential>, WebhookError> {
        match destination {
            Destination::Channel { id } => self.channel_credential(id).await,
            Destination::Thread { id, parent_id } => {
                if let Some(credential) = self.cached(CacheKey::Thread(id)) {
                    return Ok(credential);
                }

                let generation = self.generation.load(Ordering::SeqCst);
                let parent = self.channel_credential(parent_id).await?;
                let credential = Arc::new(WebhookCredential {
                    thread_id: Some(id),
                    ..(*parent).clone()
                });

                if self.insert_if_current(CacheKey::Thread(id), credential.clone(), generation) {
                    tracing::debug!(thread_id = id, parent_id, webhook_id = credential.webhook_id, "thread webhook derived from parent");
                }
                Ok(credential)
            }
        }
    }

    async fn channel_credential(&self, channel_id: Snowflake) -> Result<Arc<WebhookCredential>, WebhookError> {
        if let Some(credential) = self.cached(CacheKey::Channel(channel_id)) {
            return Ok(credential);
        }

        let _resolving = self.resolving.lock().await;
        // Another caller may have resolved it while we waited
        if let Some(credential) = self.cached(CacheKey::Channel(channel_id)) {
            return Ok(credential);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let existing = self.directory.list_webhooks(channel_id).await?;
        let reusable = existing
            .into_iter()
            .find(|webhook| webhook.token.is_some() && webhook.name.as_deref() == Some(self.reserved_name.as_str()));

        let webhook = match reusable {
            Some(webhook) => {
                tracing::debug!(channel_id, webhook_id = webhook.webhook_id, "reusing existing webhook");
                webhook
            }
            None => {
                let webhook = self.directory.create_webhook(channel_id, &self.reserved_name).await?;
                tracing::info!(channel_id, webhook_id = webhook.webhook_id, "created webhook");
                webhook
            }
        };

        let token = webhook.token.ok_or(WebhookError::MissingToken {
            webhook_id: webhook.webhook_id,
        })?;

        let credential = Arc::new(WebhookCredential {
            webhook_id: webhook.webhook_id,
            token,
            channel_id,
            thread_id: None,
        });
        self.insert_if_current(CacheKey::Channel(channel_id), credential.clone(), generation);
        Ok(credential)
    }

    /// Cache `credential` unless an invalidation ran since `generation` was read.
    fn insert_if_current(&self, key: CacheKey, credential: Arc<WebhookCredential>, generation: u64) -> bool {
        let mut entries = self.entries.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(?key, "cache invalidated during lookup, not caching");
            return false;
        }
        entries.insert(key, credential);
        true
    }

    fn cached(&self, key: CacheKey) -> Option<Arc<WebhookCredential>> {
        let credential = self.entries.lock().get(&key).cloned();
        if credential.is_some() {
            tracing::trace!(?key, "webhook cache hit");
        }
        credential
    }

    /// Whether `webhook_id` is one of ours. Used to ignore our own posts.
    pub fn owns_webhook(&self, webhook_id: Snowflake) -> bool {
        self.entries
            .lock()
            .values()
            .any(|credential| credential.webhook_id == webhook_id)
    }

    /// Forget everything cached for a deleted channel or thread.
    ///
    /// Dropping a channel also drops the thread credentials derived from it,
    /// since they share its (now deleted) webhook.
    pub fn invalidate(&self, destination_id: Snowflake) -> usize {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        let before = entries.len();
        entries.retain(|key, credential| {
            let keyed_here = matches!(key, CacheKey::Channel(id) | CacheKey::Thread(id) if *id == destination_id);
            !keyed_here && credential.channel_id != destination_id
        });
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(destination_id, removed, "webhook cache invalidated");
        }
        removed
    }

    /// Forget every cached credential.
    pub fn invalidate_all(&self) -> usize {
        let mut entries = self.entries.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        let removed = entries.len();
        entries.clear();
        tracing::info!(removed, "webhook cache cleared");
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
