//! Message builders shared by unit tests.

use crate::{MessageAuthor, RelayMessage, Snowflake};

/// A message typed by a real account.
pub(crate) fn user_message(id: Snowflake, author_id: Snowflake, channel_id: Snowflake, content: &str) -> RelayMessage {
    RelayMessage {
        id,
        channel_id,
        guild_id: Some(1),
        author: MessageAuthor {
            id: author_id,
            username: format!("user{author_id}"),
            global_name: None,
            bot: false,
        },
        member_nick: None,
        webhook_id: None,
        application_id: None,
        content: content.to_string(),
        embeds: Vec::new(),
        timestamp: chrono::Utc::now(),
    }
}

/// A message posted through a webhook. Discord reports the webhook id as the author id.
pub(crate) fn webhook_message(
    id: Snowflake,
    webhook_id: Snowflake,
    channel_id: Snowflake,
    display_name: &str,
    content: &str,
) -> RelayMessage {
    RelayMessage {
        id,
        channel_id,
        guild_id: Some(1),
        author: MessageAuthor {
            id: webhook_id,
            username: display_name.to_string(),
            global_name: None,
            bot: true,
        },
        member_nick: None,
        webhook_id: Some(webhook_id),
        application_id: None,
        content: content.to_string(),
        embeds: Vec::new(),
        timestamp: chrono::Utc::now(),
    }
}
