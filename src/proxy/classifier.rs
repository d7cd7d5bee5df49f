//! ProxyClassifier: cached proxy detection and webhook→author resolution.
//!
//! Positive classifications are cached per webhook for the association
//! window, so an ambiguous message can't flip a webhook back and forth.
//! Author associations are only ever created for classified proxies, which
//! keeps ordinary bot webhooks from picking up a human identity.

use crate::config::ProxyConfig;
use crate::correlation::CorrelationStore;
use crate::error::{ConfigError, Result};
use crate::proxy::heuristics::{MarkerHeuristic, ProxyHeuristic, ProxySignal};
use crate::sweep::SweepHandle;
use crate::{RelayMessage, Snowflake};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Who actually wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedAuthor {
    /// The message's own author: a user, or a webhook that isn't a proxy.
    Own(Snowflake),
    /// The human behind a proxy repost.
    Proxied(Snowflake),
    /// A proxy repost whose original could not be matched. Identity-sensitive
    /// checks must treat this as a denial.
    UnresolvedProxy,
}

impl ResolvedAuthor {
    pub fn id(&self) -> Option<Snowflake> {
        match self {
            ResolvedAuthor::Own(id) | ResolvedAuthor::Proxied(id) => Some(*id),
            ResolvedAuthor::UnresolvedProxy => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.id().is_some()
    }
}

impl std::fmt::Display for ResolvedAuthor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedAuthor::Own(id) => write!(f, "{}", id),
            ResolvedAuthor::Proxied(id) => write!(f, "{} (proxied)", id),
            ResolvedAuthor::UnresolvedProxy => write!(f, "unresolved proxy"),
        }
    }
}

/// Webhook resolved to the account that wrote through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorAssociation {
    pub author_id: Snowflake,
    pub author_username: String,
    pub last_seen_at: Instant,
}

/// Positive "this webhook belongs to a proxy system" result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyClassification {
    pub signal: ProxySignal,
    pub classified_at: Instant,
}

pub struct ProxyClassifier {
    expiration: Duration,
    command_prefix: String,
    sensitive_commands: Vec<String>,
    heuristic: Box<dyn ProxyHeuristic>,
    correlation: Arc<CorrelationStore>,
    associations: Mutex<HashMap<Snowflake, AuthorAssociation>>,
    classifications: Mutex<HashMap<Snowflake, ProxyClassification>>,
}

impl std::fmt::Debug for ProxyClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyClassifier")
            .field("expiration", &self.expiration)
            .field("associations", &self.association_count())
            .field("classifications", &self.classification_count())
            .finish_non_exhaustive()
    }
}

impl ProxyClassifier {
    /// Build a classifier using the configured marker heuristic.
    pub fn new(config: &ProxyConfig, correlation: Arc<CorrelationStore>) -> Result<Self> {
        let heuristic = MarkerHeuristic::from_config(config)
            .map_err(|error| ConfigError::Invalid(format!("proxy.command_marker: {error}")))?;
        Ok(Self::with_heuristic(config, correlation, Box::new(heuristic)))
    }

    pub fn with_heuristic(
        config: &ProxyConfig,
        correlation: Arc<CorrelationStore>,
        heuristic: Box<dyn ProxyHeuristic>,
    ) -> Self {
        Self {
            expiration: config.association_expiration,
            command_prefix: config.command_prefix.clone(),
            sensitive_commands: config
                .sensitive_commands
                .iter()
                .map(|command| command.to_lowercase())
                .collect(),
            heuristic,
            correlation,
            associations: Mutex::new(HashMap::new()),
            classifications: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a webhook message was posted by a proxy system.
    ///
    /// Non-webhook messages are never proxies. Positive results are cached
    /// per webhook; negative results are not.
    pub fn is_proxy_message(&self, message: &RelayMessage) -> bool {
        let Some(webhook_id) = message.webhook_id else {
            return false;
        };

        let now = Instant::now();
        {
            let mut classifications = self.classifications.lock();
            match classifications.get(&webhook_id) {
                Some(cached) if now.duration_since(cached.classified_at) <= self.expiration => {
                    return true;
                }
                Some(_) => {
                    classifications.remove(&webhook_id);
                }
                None => {}
            }
        }

        let Some(signal) = self.heuristic.detect(message) else {
            return false;
        };

        tracing::debug!(webhook_id, %signal, "webhook classified as proxy");
        self.classifications.lock().insert(
            webhook_id,
            ProxyClassification {
                signal,
                classified_at: now,
            },
        );
        true
    }

    /// The account that actually wrote `message`.
    pub fn resolve_real_author(&self, message: &RelayMessage) -> ResolvedAuthor {
        let Some(webhook_id) = message.webhook_id else {
            return ResolvedAuthor::Own(message.author.id);
        };

        if let Some(author_id) = self.touch_association(webhook_id) {
            tracing::trace!(webhook_id, author_id, "author association hit");
            return ResolvedAuthor::Proxied(author_id);
        }

        if !self.is_proxy_message(message) {
            return ResolvedAuthor::Own(message.author.id);
        }

        match self
            .correlation
            .find_deleted_message(&message.content, message.channel_id)
        {
            Some(original) => {
                tracing::info!(
                    webhook_id,
                    author_id = original.author_id,
                    author = %original.author_username,
                    channel_id = message.channel_id,
                    "proxy message resolved to original author"
                );
                let now = Instant::now();
                self.associations.lock().insert(
                    webhook_id,
                    AuthorAssociation {
                        author_id: original.author_id,
                        author_username: original.author_username,
                        last_seen_at: now,
                    },
                );
                self.refresh_classification(webhook_id, now);
                ResolvedAuthor::Proxied(original.author_id)
            }
            None => {
                tracing::debug!(
                    webhook_id,
                    channel_id = message.channel_id,
                    "no deleted original for proxy message"
                );
                ResolvedAuthor::UnresolvedProxy
            }
        }
    }

    /// Whether content-sensitivity checks may be skipped for `message`.
    ///
    /// Sensitive commands never skip them, even from a proxy.
    pub fn should_bypass_sensitive_content_check(&self, message: &RelayMessage) -> bool {
        match self.command_name(&message.content) {
            Some(command) if self.is_sensitive_command(&command) => false,
            Some(_) => true,
            None => self.is_proxy_message(message),
        }
    }

    /// Whether `message` may drive identity-sensitive operations.
    ///
    /// Webhook messages qualify only while their webhook is classified as a
    /// proxy and has a resolved author.
    pub fn is_identity_verification_allowed(&self, message: &RelayMessage) -> bool {
        let Some(webhook_id) = message.webhook_id else {
            return true;
        };

        let associations = self.associations.lock();
        let associated = associations
            .get(&webhook_id)
            .is_some_and(|association| association.last_seen_at.elapsed() <= self.expiration);
        associated
            && self
                .classifications
                .lock()
                .get(&webhook_id)
                .is_some_and(|classification| classification.classified_at.elapsed() <= self.expiration)
    }

    /// The live association for `webhook_id`, if any, with its timestamp bumped.
    ///
    /// An association only counts while the webhook's classification is live;
    /// a hit refreshes both so they always expire together.
    fn touch_association(&self, webhook_id: Snowflake) -> Option<Snowflake> {
        let now = Instant::now();
        let mut associations = self.associations.lock();
        let association = associations.get_mut(&webhook_id)?;

        let mut classifications = self.classifications.lock();
        let classified = classifications
            .get(&webhook_id)
            .is_some_and(|classification| now.duration_since(classification.classified_at) <= self.expiration);

        if !classified || now.duration_since(association.last_seen_at) > self.expiration {
            associations.remove(&webhook_id);
            return None;
        }

        association.last_seen_at = now;
        if let Some(classification) = classifications.get_mut(&webhook_id) {
            classification.classified_at = now;
        }
        Some(association.author_id)
    }

    /// Restart the classification window alongside a new association.
    fn refresh_classification(&self, webhook_id: Snowflake, now: Instant) {
        if let Some(classification) = self.classifications.lock().get_mut(&webhook_id) {
            classification.classified_at = now;
        }
    }

    /// First word after our command prefix, lowercased.
    fn command_name(&self, content: &str) -> Option<String> {
        let rest = content.trim_start().strip_prefix(self.command_prefix.as_str())?;
        if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
            return None;
        }
        rest.split_whitespace().next().map(str::to_lowercase)
    }

    fn is_sensitive_command(&self, command: &str) -> bool {
        self.sensitive_commands.iter().any(|sensitive| sensitive == command)
    }

    pub fn association(&self, webhook_id: Snowflake) -> Option<AuthorAssociation> {
        self.associations.lock().get(&webhook_id).cloned()
    }

    /// Drop expired associations and classifications.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expiration = self.expiration;

        let mut associations = self.associations.lock();
        let before = associations.len();
        associations.retain(|_, association| now.duration_since(association.last_seen_at) <= expiration);
        let mut removed = before - associations.len();
        drop(associations);

        let mut classifications = self.classifications.lock();
        let before = classifications.len();
        classifications.retain(|_, classification| now.duration_since(classification.classified_at) <= expiration);
        removed += before - classifications.len();

        removed
    }

    pub fn start_sweeper(self: &Arc<Self>, every: Duration) -> SweepHandle {
        SweepHandle::spawn("proxy", self, every, ProxyClassifier::sweep)
    }

    pub fn association_count(&self) -> usize {
        self.associations.lock().len()
    }

    pub fn classification_count(&self) -> usize {
        self.classifications.lock().len()
    }
}
