//! Side-effect-free checks deciding whether a webhook message came from a proxy bot.
//!
//! Nothing here caches or looks at time; `ProxyClassifier` layers that on top.

use crate::config::ProxyConfig;
use crate::{RelayMessage, Snowflake};
use regex::Regex;
use std::collections::HashSet;

/// Why a message was taken for a proxy repost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxySignal {
    KnownApplication,
    DisplayNameMarker,
    EmbedMarker,
    CommandMarker,
}

impl std::fmt::Display for ProxySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxySignal::KnownApplication => write!(f, "known_application"),
            ProxySignal::DisplayNameMarker => write!(f, "display_name_marker"),
            ProxySignal::EmbedMarker => write!(f, "embed_marker"),
            ProxySignal::CommandMarker => write!(f, "command_marker"),
        }
    }
}

/// A proxy-detection rule over message fields.
pub trait ProxyHeuristic: Send + Sync + 'static {
    /// The first signal found, or `None` when the message looks ordinary.
    fn detect(&self, message: &RelayMessage) -> Option<ProxySignal>;
}

/// Marker lists from configuration, matched case-insensitively.
#[derive(Debug, Clone)]
pub struct MarkerHeuristic {
    application_ids: HashSet<Snowflake>,
    name_markers: Vec<String>,
    embed_markers: Vec<String>,
    command_marker: Regex,
}

impl MarkerHeuristic {
    pub fn from_config(config: &ProxyConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            application_ids: config.application_ids.iter().copied().collect(),
            name_markers: lowercase_all(&config.name_markers),
            embed_markers: lowercase_all(&config.embed_markers),
            command_marker: Regex::new(&config.command_marker)?,
        })
    }

    fn has_known_application(&self, message: &RelayMessage) -> bool {
        message
            .application_id
            .is_some_and(|id| self.application_ids.contains(&id))
    }

    fn has_name_marker(&self, message: &RelayMessage) -> bool {
        message
            .display_names()
            .any(|name| contains_any(&name.to_lowercase(), &self.name_markers))
    }

    fn has_embed_marker(&self, message: &RelayMessage) -> bool {
        message.embeds.iter().any(|embed| {
            let mut labels = embed
                .fields
                .iter()
                .map(|field| field.name.as_str())
                .chain(embed.title.as_deref())
                .chain(embed.footer.as_deref());
            labels.any(|label| contains_any(&label.to_lowercase(), &self.embed_markers))
        })
    }

    fn has_command_marker(&self, message: &RelayMessage) -> bool {
        self.command_marker.is_match(&message.content)
    }
}

impl ProxyHeuristic for MarkerHeuristic {
    fn detect(&self, message: &RelayMessage) -> Option<ProxySignal> {
        if self.has_known_application(message) {
            Some(ProxySignal::KnownApplication)
        } else if self.has_name_marker(message) {
            Some(ProxySignal::DisplayNameMarker)
        } else if self.has_embed_marker(message) {
            Some(ProxySignal::EmbedMarker)
        } else if self.has_command_marker(message) {
            Some(ProxySignal::CommandMarker)
        } else {
            None
        }
    }
}

fn lowercase_all(markers: &[String]) -> Vec<String> {
    markers
        .iter()
        .map(|marker| marker.to_lowercase())
        .filter(|marker| !marker.is_empty())
        .collect()
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle.as_str()))
}
