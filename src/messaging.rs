//! Messaging adapters.

pub mod discord;

pub use discord::{DiscordHandler, RelayEvent, SerenityWebhooks};
