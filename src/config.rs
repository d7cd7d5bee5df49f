//! Configuration loading and validation.

use crate::Snowflake;
use crate::error::{ConfigError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Relay configuration.
///
/// Every field has a default, so an empty or missing config file is valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bot token. Usually supplied through `DISCORD_TOKEN`.
    pub discord_token: Option<String>,

    /// Outbound rate limiting.
    pub dispatch: DispatchConfig,

    /// Deleted-message correlation window.
    pub correlation: CorrelationConfig,

    /// Proxy-system detection.
    pub proxy: ProxyConfig,

    /// Webhook identity reuse.
    pub webhooks: WebhookConfig,
}

/// Dispatch queue spacing, backoff and cooldown.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Minimum time between the starts of two consecutive sends.
    #[serde(rename = "min_spacing_ms", with = "duration_ms")]
    pub min_spacing: Duration,

    /// Maximum number of sends in flight.
    pub max_concurrent: usize,

    /// Throttle reports without an intervening success before the global cooldown.
    pub max_consecutive_throttles: u32,

    #[serde(rename = "cooldown_ms", with = "duration_ms")]
    pub cooldown: Duration,

    pub max_retries: u32,

    /// Base of the exponential backoff when Discord gives no retry-after.
    #[serde(rename = "base_backoff_ms", with = "duration_ms")]
    pub base_backoff: Duration,

    /// Upper bound of the random jitter added to spacing and backoff.
    #[serde(rename = "max_jitter_ms", with = "duration_ms")]
    pub max_jitter: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_millis(6000),
            max_concurrent: 1,
            max_consecutive_throttles: 3,
            cooldown: Duration::from_millis(60_000),
            max_retries: 5,
            base_backoff: Duration::from_millis(3000),
            max_jitter: Duration::from_millis(500),
        }
    }
}

/// Correlation store expiry.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// How long a pending or deleted message stays matchable.
    #[serde(rename = "expiration_ms", with = "duration_ms")]
    pub expiration: Duration,

    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            expiration: Duration::from_millis(5000),
            sweep_interval: Duration::from_millis(10_000),
        }
    }
}

/// Proxy classification heuristics and cache lifetimes.
///
/// The marker lists are data, not code: deployments tune them without a rebuild.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Lifetime of webhook→author associations and proxy classifications.
    #[serde(rename = "association_expiration_ms", with = "duration_ms")]
    pub association_expiration: Duration,

    #[serde(rename = "association_sweep_interval_ms", with = "duration_ms")]
    pub association_sweep_interval: Duration,

    /// Application ids of known proxy bots.
    pub application_ids: Vec<Snowflake>,

    /// Case-insensitive substrings of a webhook display name that mark a proxy.
    pub name_markers: Vec<String>,

    /// Case-insensitive substrings of embed field names, titles or footers
    /// that mark a proxy system/member card.
    pub embed_markers: Vec<String>,

    /// Regex matched against the raw text for proxy command invocations.
    pub command_marker: String,

    /// Prefix of our own text commands.
    pub command_prefix: String,

    /// Commands that never bypass content checks, proxied or not.
    pub sensitive_commands: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            association_expiration: Duration::from_secs(60 * 60),
            association_sweep_interval: Duration::from_secs(15 * 60),
            // PluralKit, Tupperbox
            application_ids: vec![466_378_653_216_014_359, 431_544_605_209_788_416],
            name_markers: vec!["pluralkit".into(), "tupperbox".into(), "[pk]".into()],
            embed_markers: vec!["system id".into(), "member id".into()],
            command_marker: r"^\s*[A-Za-z]{2,4}[:;!][^\s/]".into(),
            command_prefix: "!relay".into(),
            sensitive_commands: vec![
                "auth".into(),
                "verify".into(),
                "token".into(),
                "reset".into(),
            ],
        }
    }
}

/// Webhook reuse settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Name given to webhooks the relay creates and looks for when reusing one.
    pub reserved_name: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            reserved_name: "Relay".into(),
        }
    }
}

impl Config {
    /// Default config file location: `<config dir>/discord-relay/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("discord-relay"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Load configuration from the default path and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::default_path())
    }

    /// Load from a specific config file path. A missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
                path: path.display().to_string(),
                source: Arc::new(source),
            })?;
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Config::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("DISCORD_TOKEN") {
            self.discord_token = Some(token);
        }
        if let Ok(prefix) = std::env::var("RELAY_COMMAND_PREFIX") {
            self.proxy.command_prefix = prefix;
        }
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.max_concurrent == 0 {
            return Err(ConfigError::Invalid("dispatch.max_concurrent must be at least 1".into()).into());
        }
        if self.dispatch.max_consecutive_throttles == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.max_consecutive_throttles must be at least 1".into(),
            )
            .into());
        }
        if self.correlation.sweep_interval.is_zero() || self.proxy.association_sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("sweep intervals must be non-zero".into()).into());
        }
        if let Err(error) = regex::Regex::new(&self.proxy.command_marker) {
            return Err(ConfigError::Invalid(format!("proxy.command_marker: {error}")).into());
        }
        if self.proxy.command_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("proxy.command_prefix must not be empty".into()).into());
        }
        Ok(())
    }

    /// The bot token, required to connect to the gateway.
    pub fn require_token(&self) -> Result<&str> {
        self.discord_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ConfigError::MissingKey("DISCORD_TOKEN".into()).into())
    }
}

/// Serde helper for durations written as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
