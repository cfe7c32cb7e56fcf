//! Glue between the Discord client and the pipeline.

use anyhow::Result;
use async_trait::async_trait;
use discord_client::{ApiError, Discord, Message};

use crate::pipeline::{ChatOutbound, InboundMessage};

#[async_trait]
impl ChatOutbound for Discord {
    async fn send_message(&self, channel_id: u64, content: &str) -> Result<()> {
        Discord::send_message(self, channel_id, content).await
    }

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<()> {
        Discord::delete_message(self, channel_id, message_id).await
    }

    fn is_permission_denied(&self, error: &anyhow::Error) -> bool {
        error.downcast_ref::<ApiError>().is_some_and(ApiError::is_forbidden)
    }
}

impl From<Message> for InboundMessage {
    fn from(msg: Message) -> Self {
        Self {
            message_id: msg.id,
            author_id: msg.author.id,
            channel_id: msg.channel_id,
            guild_id: msg.guild_id,
            text: msg.content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use discord_client::{parse_dispatch, GatewayEvent};

    #[test]
    fn gateway_message_becomes_inbound_message() {
        let event = parse_dispatch(
            "MESSAGE_CREATE",
            serde_json::json!({
                "id": "10",
                "channel_id": "20",
                "guild_id": "30",
                "author": { "id": "40" },
                "content": "hello"
            }),
        );
        let Some(GatewayEvent::MessageCreate(msg)) = event else {
            panic!("expected MessageCreate");
        };

        assert_eq!(
            InboundMessage::from(msg),
            InboundMessage {
                message_id: 10,
                author_id: 40,
                channel_id: 20,
                guild_id: Some(30),
                text: "hello".into(),
            }
        );
    }
}
