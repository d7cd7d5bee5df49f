//! Short-lived store matching deleted originals to proxy reposts.
//!
//! A proxy bot deletes the user's message and reposts the same text through a
//! webhook, under a new message id and a webhook author. The only link between
//! the two is `(channel, content)` inside a tight window, so deleted messages
//! are keyed by exactly that and can be claimed once.

use crate::Snowflake;
use crate::config::CorrelationConfig;
use crate::sweep::SweepHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Fields recorded for every non-webhook message on receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedMessage {
    pub author_id: Snowflake,
    pub author_username: String,
    pub channel_id: Snowflake,
    pub guild_id: Option<Snowflake>,
    pub content: String,
}

impl From<&crate::RelayMessage> for ObservedMessage {
    fn from(message: &crate::RelayMessage) -> Self {
        Self {
            author_id: message.author.id,
            author_username: message.author.username.clone(),
            channel_id: message.channel_id,
            guild_id: message.guild_id,
            content: message.content.clone(),
        }
    }
}

/// A message seen recently that has not been deleted (yet).
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub message: ObservedMessage,
    pub created_at: Instant,
}

/// A deleted message waiting to be matched against a repost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedMessage {
    pub author_id: Snowflake,
    pub author_username: String,
    pub guild_id: Option<Snowflake>,
    pub deleted_at: Instant,
}

type DeletedKey = (Snowflake, String);

#[derive(Default)]
struct Entries {
    pending: HashMap<Snowflake, PendingMessage>,
    deleted: HashMap<DeletedKey, DeletedMessage>,
}

/// Pending and deleted messages inside the correlation window.
pub struct CorrelationStore {
    expiration: Duration,
    entries: Mutex<Entries>,
}

impl std::fmt::Debug for CorrelationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationStore")
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

impl CorrelationStore {
    pub fn new(config: CorrelationConfig) -> Self {
        Self::with_expiration(config.expiration)
    }

    pub fn with_expiration(expiration: Duration) -> Self {
        Self {
            expiration,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Record a freshly received message. Last write wins per message id.
    pub fn store(&self, message_id: Snowflake, message: ObservedMessage) {
        let pending = PendingMessage {
            message,
            created_at: Instant::now(),
        };
        self.entries.lock().pending.insert(message_id, pending);
        tracing::trace!(message_id, "pending message stored");
    }

    /// Move a pending message to the deleted set. Unknown or expired ids are ignored.
    pub fn mark_deleted(&self, message_id: Snowflake) {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let Some(pending) = entries.pending.remove(&message_id) else {
            return;
        };

        if now.duration_since(pending.created_at) > self.expiration {
            tracing::trace!(message_id, "deleted message already outside correlation window");
            return;
        }

        let ObservedMessage {
            author_id,
            author_username,
            channel_id,
            guild_id,
            content,
        } = pending.message;

        tracing::debug!(message_id, channel_id, author_id, "message deleted, awaiting repost");

        entries.deleted.insert(
            (channel_id, content),
            DeletedMessage {
                author_id,
                author_username,
                guild_id,
                deleted_at: now,
            },
        );
    }

    /// Claim the deleted message with this exact content in this channel.
    ///
    /// A hit removes the entry, so a second lookup for the same content returns
    /// `None`. Entries past the window are dropped and never returned.
    pub fn find_deleted_message(&self, content: &str, channel_id: Snowflake) -> Option<DeletedMessage> {
        let key = (channel_id, content.to_string());
        let deleted = self.entries.lock().deleted.remove(&key)?;

        if deleted.deleted_at.elapsed() > self.expiration {
            tracing::debug!(channel_id, "matching deleted message expired");
            return None;
        }

        Some(deleted)
    }

    /// Drop every pending and deleted entry older than the window.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expiration = self.expiration;
        let mut entries = self.entries.lock();

        let before = entries.pending.len() + entries.deleted.len();
        entries
            .pending
            .retain(|_, pending| now.duration_since(pending.created_at) <= expiration);
        entries
            .deleted
            .retain(|_, deleted| now.duration_since(deleted.deleted_at) <= expiration);
        before - (entries.pending.len() + entries.deleted.len())
    }

    /// Sweep on a timer until the handle is stopped or the store dropped.
    pub fn start_sweeper(self: &Arc<Self>, every: Duration) -> SweepHandle {
        SweepHandle::spawn("correlation", self, every, CorrelationStore::sweep)
    }

    pub fn pending_len(&self) -> usize {
        self.entries.lock().pending.len()
    }

    pub fn deleted_len(&self) -> usize {
        self.entries.lock().deleted.len()
    }
}
