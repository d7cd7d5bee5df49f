//! Relay: the inbound and outbound entry points over the core components.
//!
//! Inbound, every message is recorded for correlation and classified before
//! any identity decision is made. Outbound, every reply resolves a webhook
//! credential and then sends through the dispatch queue, one chunk per task.

use crate::config::Config;
use crate::correlation::{CorrelationStore, ObservedMessage};
use crate::dispatch::{DispatchQueue, Jitter, RandomJitter};
use crate::error::{DeliveryError, Result};
use crate::proxy::{ProxyClassifier, ResolvedAuthor};
use crate::sweep::SweepHandle;
use crate::webhooks::{WebhookCache, WebhookCredential, WebhookDirectory, WebhookExecutor, WebhookPayload};
use crate::{Destination, Persona, RelayMessage, Snowflake};

use std::sync::Arc;
use std::time::Duration;

/// Discord rejects webhook messages longer than this.
const MAX_MESSAGE_LENGTH: usize = 2000;

/// Identity decisions for one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundVerdict {
    pub author: ResolvedAuthor,
    pub is_proxy: bool,
    pub bypass_sensitive_check: bool,
    pub identity_verification_allowed: bool,
}

/// Result of delivering a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Discord kept throttling until the retry budget ran out.
    RateLimited,
    /// The send failed for another reason; details are in the logs.
    Failed,
}

impl DeliveryOutcome {
    /// Text to show the end user when a reply didn't make it.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            DeliveryOutcome::Delivered => None,
            DeliveryOutcome::RateLimited => {
                Some("Discord is rate limiting me right now. Please try again in a minute.")
            }
            DeliveryOutcome::Failed => Some("Something went wrong sending that reply."),
        }
    }
}

pub struct Relay {
    queue: DispatchQueue,
    webhooks: Arc<WebhookCache>,
    correlation: Arc<CorrelationStore>,
    classifier: Arc<ProxyClassifier>,
    correlation_sweep_interval: Duration,
    association_sweep_interval: Duration,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("queue", &self.queue)
            .field("webhooks", &self.webhooks)
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Build every component from config. Must be called inside a tokio runtime.
    pub fn new(config: &Config, directory: Arc<dyn WebhookDirectory>) -> Result<Self> {
        Self::with_jitter(config, directory, Arc::new(RandomJitter))
    }

    pub fn with_jitter(config: &Config, directory: Arc<dyn WebhookDirectory>, jitter: Arc<dyn Jitter>) -> Result<Self> {
        config.validate()?;

        let correlation = Arc::new(CorrelationStore::new(config.correlation));
        let classifier = Arc::new(ProxyClassifier::new(&config.proxy, correlation.clone())?);

        Ok(Self {
            queue: DispatchQueue::with_jitter(config.dispatch.clone(), jitter),
            webhooks: Arc::new(WebhookCache::new(directory, config.webhooks.reserved_name.clone())),
            correlation,
            classifier,
            correlation_sweep_interval: config.correlation.sweep_interval,
            association_sweep_interval: config.proxy.association_sweep_interval,
        })
    }

    /// Start the periodic expiry sweeps. Dropping the handles stops them.
    pub fn start_sweepers(&self) -> Vec<SweepHandle> {
        vec![
            self.correlation.start_sweeper(self.correlation_sweep_interval),
            self.classifier.start_sweeper(self.association_sweep_interval),
        ]
    }

    /// Record and classify an inbound message.
    pub fn observe_message(&self, message: &RelayMessage) -> InboundVerdict {
        if !message.is_webhook() {
            self.correlation.store(message.id, ObservedMessage::from(message));
        }

        let author = self.classifier.resolve_real_author(message);
        let verdict = InboundVerdict {
            author,
            is_proxy: self.classifier.is_proxy_message(message),
            bypass_sensitive_check: self.classifier.should_bypass_sensitive_content_check(message),
            identity_verification_allowed: self.classifier.is_identity_verification_allowed(message),
        };

        tracing::debug!(
            message_id = message.id,
            channel_id = message.channel_id,
            author = %verdict.author,
            is_proxy = verdict.is_proxy,
            "inbound message classified"
        );
        verdict
    }

    /// A message was deleted.
    pub fn observe_delete(&self, message_id: Snowflake) {
        self.correlation.mark_deleted(message_id);
    }

    /// A channel or thread was deleted; its webhook credentials are stale.
    pub fn observe_destination_deleted(&self, destination_id: Snowflake) -> usize {
        self.webhooks.invalidate(destination_id)
    }

    /// Forget all webhook credentials, e.g. after a gateway reconnect.
    pub fn reset(&self) -> usize {
        self.webhooks.invalidate_all()
    }

    /// Send `text` to `destination` as `persona`.
    ///
    /// Endpoint resolution failures are returned as errors. Throttling and
    /// send failures come back as a [`DeliveryOutcome`]; long text is split
    /// into chunks and delivery stops at the first chunk that doesn't land.
    pub async fn deliver(
        &self,
        destination: Destination,
        persona: &Persona,
        text: &str,
        executor: Arc<dyn WebhookExecutor>,
    ) -> Result<DeliveryOutcome> {
        if text.trim().is_empty() {
            tracing::debug!(%destination, "nothing to deliver");
            return Ok(DeliveryOutcome::Delivered);
        }

        let credential = self.webhooks.get_or_create(destination).await?;
        let chunks = split_message(text, MAX_MESSAGE_LENGTH);
        let total = chunks.len();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let payload = WebhookPayload::new(persona, chunk);
            let queue = self.queue.clone();
            let webhooks = self.webhooks.clone();
            let executor = executor.clone();
            let credential = credential.clone();
            let identifier = destination.to_string();

            let outcome = self
                .queue
                .enqueue_with_context(format!("{identifier} [{}/{total}]", index + 1), move || async move {
                    match send_with_retries(&queue, executor.as_ref(), &credential, &payload, &identifier).await {
                        Err(DeliveryError::UnknownWebhook) => {
                            webhooks.invalidate(credential.channel_id);
                            Err(anyhow::anyhow!("webhook {} was deleted", credential.webhook_id))
                        }
                        Err(error) => Err(error.into()),
                        Ok(outcome) => Ok(outcome),
                    }
                })
                .await
                .unwrap_or(DeliveryOutcome::Failed);

            if outcome != DeliveryOutcome::Delivered {
                tracing::warn!(%destination, chunk = index + 1, total, ?outcome, "reply not delivered");
                return Ok(outcome);
            }
        }

        Ok(DeliveryOutcome::Delivered)
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn webhooks(&self) -> &Arc<WebhookCache> {
        &self.webhooks
    }

    pub fn correlation(&self) -> &Arc<CorrelationStore> {
        &self.correlation
    }

    pub fn classifier(&self) -> &Arc<ProxyClassifier> {
        &self.classifier
    }
}

/// Send once, retrying through the queue's backoff while Discord throttles.
async fn send_with_retries(
    queue: &DispatchQueue,
    executor: &dyn WebhookExecutor,
    credential: &WebhookCredential,
    payload: &WebhookPayload,
    identifier: &str,
) -> std::result::Result<DeliveryOutcome, DeliveryError> {
    let mut attempt = 0;
    loop {
        match executor.execute(credential, payload).await {
            Ok(()) => {
                queue.report_success();
                return Ok(DeliveryOutcome::Delivered);
            }
            Err(DeliveryError::Throttled { retry_after }) => {
                let next = queue.report_throttled(identifier, retry_after, attempt).await;
                if next == attempt {
                    return Ok(DeliveryOutcome::RateLimited);
                }
                attempt = next;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Split a message into chunks that fit Discord's length limit.
/// Tries to split at newlines, then spaces, then hard-cuts on a char boundary.
/// The separator a chunk ends on is dropped; everything else is kept verbatim.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            if !remaining.trim().is_empty() {
                chunks.push(remaining.to_string());
            }
            break;
        }

        let mut hard_cut = max_len;
        while !remaining.is_char_boundary(hard_cut) {
            hard_cut -= 1;
        }

        let window = &remaining[..hard_cut];
        let separator = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&index| index > 0);

        // Drop only the separator itself so indentation on the next line survives
        let (split_at, resume_at) = match separator {
            Some(index) => (index, index + 1),
            None => (hard_cut, hard_cut),
        };

        let chunk = &remaining[..split_at];
        if !chunk.trim().is_empty() {
            chunks.push(chunk.to_string());
        }
        remaining = &remaining[resume_at..];
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::FixedJitter;
    use crate::error::Error;
    use crate::testing::{user_message, webhook_message};
    use crate::webhooks::ExistingWebhook;
    use crate::webhooks::tests::FakeDirectory;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;
    use tokio::time::Instant;

    const PLURALKIT: Snowflake = 466_378_653_216_014_359;

    /// Replays scripted responses, then succeeds. Records every send.
    #[derive(Default)]
    struct ScriptedExecutor {
        responses: Mutex<VecDeque<std::result::Result<(), DeliveryError>>>,
        sent: Mutex<Vec<(WebhookCredential, WebhookPayload, Instant)>>,
    }

    impl ScriptedExecutor {
        fn with_responses(responses: Vec<std::result::Result<(), DeliveryError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl WebhookExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            credential: &WebhookCredential,
            payload: &WebhookPayload,
        ) -> std::result::Result<(), DeliveryError> {
            self.sent
                .lock()
                .push((credential.clone(), payload.clone(), Instant::now()));
            self.responses.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    fn relay_with(config: Config, directory: Arc<FakeDirectory>) -> Relay {
        Relay::with_jitter(&config, directory, Arc::new(FixedJitter(Duration::ZERO))).unwrap()
    }

    fn relay(directory: Arc<FakeDirectory>) -> Relay {
        relay_with(Config::default(), directory)
    }

    fn reserved(id: Snowflake) -> ExistingWebhook {
        ExistingWebhook {
            webhook_id: id,
            name: Some("Relay".into()),
            token: Some(format!("token-{id}")),
        }
    }

    fn proxy_repost(id: Snowflake, webhook_id: Snowflake, channel_id: Snowflake, content: &str) -> RelayMessage {
        let mut message = webhook_message(id, webhook_id, channel_id, "Alice", content);
        message.application_id = Some(PLURALKIT);
        message
    }

    #[tokio::test(start_paused = true)]
    async fn proxy_repost_is_attributed_to_original_author() {
        let relay = relay(Arc::new(FakeDirectory::default()));

        let original = user_message(1, 100, 5, "hello");
        let verdict = relay.observe_message(&original);
        assert_eq!(verdict.author, ResolvedAuthor::Own(100));
        assert!(verdict.identity_verification_allowed);
        assert_eq!(relay.correlation().pending_len(), 1);

        relay.observe_delete(1);
        tokio::time::advance(Duration::from_millis(1200)).await;

        let repost = proxy_repost(2, 900, 5, "hello");
        let verdict = relay.observe_message(&repost);
        assert_eq!(verdict.author, ResolvedAuthor::Proxied(100));
        assert!(verdict.is_proxy);
        assert!(verdict.bypass_sensitive_check);
        assert!(verdict.identity_verification_allowed);
        // Webhook messages are never recorded for correlation
        assert_eq!(relay.correlation().pending_len(), 0);
        assert_eq!(relay.correlation().deleted_len(), 0);

        // A second message from the same webhook resolves from the association
        let follow_up = proxy_repost(3, 900, 5, "how are you");
        assert_eq!(relay.observe_message(&follow_up).author, ResolvedAuthor::Proxied(100));
    }

    #[tokio::test(start_paused = true)]
    async fn repost_before_delete_notification_fails_closed() {
        let relay = relay(Arc::new(FakeDirectory::default()));
        relay.observe_message(&user_message(1, 100, 5, "hello"));

        let verdict = relay.observe_message(&proxy_repost(2, 900, 5, "hello"));
        assert_eq!(verdict.author, ResolvedAuthor::UnresolvedProxy);
        assert!(!verdict.identity_verification_allowed);

        // The late delete does not retroactively resolve anything
        relay.observe_delete(1);
        assert_eq!(relay.correlation().deleted_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deliver_to_thread_uses_parent_webhook() {
        let directory = Arc::new(FakeDirectory::with_existing(5, reserved(77)));
        let relay = relay(directory.clone());
        let executor = ScriptedExecutor::with_responses(vec![]);
        let persona = Persona::new("Lilith").with_avatar("https://cdn.example/lilith.png");

        let outcome = relay
            .deliver(Destination::Thread { id: 6, parent_id: 5 }, &persona, "hi there", executor.clone())
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);

        let sent = executor.sent.lock();
        let (credential, payload, _) = &sent[0];
        assert_eq!(credential.webhook_id, 77);
        assert_eq!(credential.thread_id, Some(6));
        assert_eq!(payload.username, "Lilith");
        assert_eq!(payload.avatar_url.as_deref(), Some("https://cdn.example/lilith.png"));
        assert_eq!(payload.content, "hi there");
        assert_eq!(directory.lists(), 1);
        assert_eq!(directory.creates(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_send_is_retried_until_it_lands() {
        let relay = relay(Arc::new(FakeDirectory::default()));
        let executor = ScriptedExecutor::with_responses(vec![
            Err(DeliveryError::Throttled { retry_after: Some(1.0) }),
            Err(DeliveryError::Throttled { retry_after: None }),
        ]);

        let outcome = relay
            .deliver(Destination::Channel { id: 5 }, &Persona::new("Bot"), "hello", executor.clone())
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(executor.attempts(), 3);

        let sent = executor.sent.lock();
        assert_eq!(sent[1].2 - sent[0].2, Duration::from_millis(1000));
        assert_eq!(sent[2].2 - sent[1].2, Duration::from_millis(6000));
        assert_eq!(relay.queue().state().consecutive_throttles, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_as_rate_limited() {
        let mut config = Config::default();
        config.dispatch.max_retries = 2;
        config.dispatch.max_consecutive_throttles = 10;
        let relay = relay_with(config, Arc::new(FakeDirectory::default()));
        let executor = ScriptedExecutor::with_responses(vec![
            Err(DeliveryError::Throttled { retry_after: None }),
            Err(DeliveryError::Throttled { retry_after: None }),
            Err(DeliveryError::Throttled { retry_after: None }),
            Err(DeliveryError::Throttled { retry_after: None }),
        ]);

        let outcome = relay
            .deliver(Destination::Channel { id: 5 }, &Persona::new("Bot"), "hello", executor.clone())
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::RateLimited);
        assert!(outcome.user_message().is_some());
        assert_eq!(executor.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn endpoint_failure_is_an_error() {
        let directory = Arc::new(FakeDirectory::default());
        directory.fail.store(true, Ordering::SeqCst);
        let relay = relay(directory);
        let executor = ScriptedExecutor::with_responses(vec![]);

        let result = relay
            .deliver(Destination::Channel { id: 5 }, &Persona::new("Bot"), "hello", executor.clone())
            .await;

        assert!(matches!(result, Err(Error::Webhook(_))));
        assert_eq!(executor.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_is_degraded_to_failed() {
        let relay = relay(Arc::new(FakeDirectory::default()));
        let executor = ScriptedExecutor::with_responses(vec![Err(DeliveryError::Failed("400".into()))]);

        let outcome = relay
            .deliver(Destination::Channel { id: 5 }, &Persona::new("Bot"), "hello", executor.clone())
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Failed);

        // The queue keeps working for the next reply
        let outcome = relay
            .deliver(Destination::Channel { id: 5 }, &Persona::new("Bot"), "again", executor.clone())
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_webhook_drops_cached_credential() {
        let directory = Arc::new(FakeDirectory::default());
        let relay = relay(directory.clone());
        let executor = ScriptedExecutor::with_responses(vec![Err(DeliveryError::UnknownWebhook)]);

        let outcome = relay
            .deliver(Destination::Channel { id: 5 }, &Persona::new("Bot"), "hello", executor.clone())
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Failed);
        assert!(relay.webhooks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn long_replies_are_sent_as_spaced_chunks() {
        let relay = relay(Arc::new(FakeDirectory::default()));
        let executor = ScriptedExecutor::with_responses(vec![]);
        let text = format!("{}\n{}", "a".repeat(1500), "b".repeat(1500));

        let outcome = relay
            .deliver(Destination::Channel { id: 5 }, &Persona::new("Bot"), &text, executor.clone())
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);

        let sent = executor.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1.content, "a".repeat(1500));
        assert_eq!(sent[1].1.content, "b".repeat(1500));
        assert!(sent[1].2 - sent[0].2 >= Duration::from_millis(6000));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_reply_sends_nothing() {
        let directory = Arc::new(FakeDirectory::default());
        let relay = relay(directory.clone());
        let executor = ScriptedExecutor::with_responses(vec![]);

        let outcome = relay
            .deliver(Destination::Channel { id: 5 }, &Persona::new("Bot"), "  \n", executor.clone())
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(executor.attempts(), 0);
        assert_eq!(directory.lists(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn destination_deletion_invalidates_credentials() {
        let directory = Arc::new(FakeDirectory::default());
        let relay = relay(directory.clone());
        let executor = ScriptedExecutor::with_responses(vec![]);
        let destination = Destination::Channel { id: 5 };

        relay.deliver(destination, &Persona::new("Bot"), "one", executor.clone()).await.unwrap();
        assert_eq!(relay.observe_destination_deleted(5), 1);

        relay.deliver(destination, &Persona::new("Bot"), "two", executor.clone()).await.unwrap();
        assert_eq!(directory.lists(), 2);

        assert_eq!(relay.reset(), 1);
        assert!(relay.webhooks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweepers_expire_correlation_entries() {
        let relay = relay(Arc::new(FakeDirectory::default()));
        let _sweepers = relay.start_sweepers();

        relay.observe_message(&user_message(1, 100, 5, "hello"));
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(relay.correlation().pending_len(), 0);
    }

    #[test]
    fn split_short_message_is_untouched() {
        assert_eq!(split_message("hello", 2000), vec!["hello".to_string()]);
    }

    #[test]
    fn split_prefers_newlines_then_spaces() {
        assert_eq!(split_message("aaaa\nbbbb cc", 8), vec!["aaaa", "bbbb cc"]);
        assert_eq!(split_message("aaa bbb ccc", 8), vec!["aaa bbb", "ccc"]);
    }

    #[test]
    fn split_keeps_indentation_of_following_line() {
        let text = "fn main() {\n    let x = 1;\n}";
        let chunks = split_message(text, 15);
        assert_eq!(chunks, vec!["fn main() {", "    let x = 1;", "}"]);
        assert_eq!(chunks.join("\n"), text);
    }

    #[test]
    fn split_skips_blank_chunks() {
        let chunks = split_message("aaaa\n    \nbbbb", 8);
        assert_eq!(chunks, vec!["aaaa", "bbbb"]);
    }

    #[test]
    fn split_hard_cuts_on_char_boundary() {
        let text = "é".repeat(5); // 10 bytes
        let chunks = split_message(&text, 3);
        assert!(chunks.iter().all(|chunk| chunk.len() <= 3));
        assert_eq!(chunks.concat(), text);
    }
}
