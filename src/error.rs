//! Top-level error types for the relay.

use crate::Snowflake;
use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("discord error: {0}")]
    Discord(#[from] serenity::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),
}

/// Failures resolving a delivery endpoint for a destination.
///
/// These are never retried inside the relay; the caller decides whether the
/// end user sees a failure.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("failed to list webhooks in channel {channel_id}: {reason}")]
    List { channel_id: Snowflake, reason: String },

    #[error("failed to create webhook in channel {channel_id}: {reason}")]
    Create { channel_id: Snowflake, reason: String },

    #[error("webhook {webhook_id} has no token")]
    MissingToken { webhook_id: Snowflake },
}

/// Errors returned by a single webhook send attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    /// Discord answered 429. `retry_after` is in seconds when the response
    /// carried one.
    #[error("rate limited by discord")]
    Throttled { retry_after: Option<f64> },

    /// The webhook was deleted out from under us.
    #[error("webhook no longer exists")]
    UnknownWebhook,

    #[error("webhook send failed: {0}")]
    Failed(String),
}
