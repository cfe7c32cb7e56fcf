use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use metrics::counter;

use crate::delivery::{Delivery, DeliveryLog};
use crate::rewrite;
use crate::state::StateCache;

/// What the pipeline needs from the chat platform.
#[async_trait]
pub trait ChatOutbound: Send + Sync {
    async fn send_message(&self, channel_id: u64, content: &str) -> Result<()>;

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<()>;

    /// Whether a failed call was refused for lack of a permission.
    fn is_permission_denied(&self, _error: &anyhow::Error) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: u64,
    pub author_id: u64,
    pub channel_id: u64,
    pub guild_id: Option<u64>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    OwnMessage,
    ChannelDisabled,
    NoEligibleLinks,
    Rewritten { replies: usize, original_deleted: bool },
    /// A reply could not be posted; the original was left in place.
    SendFailed { replies_sent: usize },
}

pub struct MessagePipeline {
    state: Arc<StateCache>,
    outbound: Arc<dyn ChatOutbound>,
    delivery: Arc<DeliveryLog>,
    self_user_id: u64,
}

impl MessagePipeline {
    pub fn new(state: Arc<StateCache>, outbound: Arc<dyn ChatOutbound>, self_user_id: u64) -> Self {
        Self {
            state,
            outbound,
            delivery: Arc::new(DeliveryLog::new()),
            self_user_id,
        }
    }

    /// Send and delete results seen so far, shared with the debug command.
    pub fn delivery_log(&self) -> Arc<DeliveryLog> {
        self.delivery.clone()
    }

    fn classify(&self, error: &anyhow::Error) -> Delivery {
        if self.outbound.is_permission_denied(error) {
            Delivery::Denied
        } else {
            Delivery::Failed(error.to_string())
        }
    }

    /// Rewrite the links in one inbound message. Failures are logged here and
    /// never returned; the outcome says how far processing got.
    pub async fn handle(&self, msg: &InboundMessage) -> PipelineOutcome {
        if msg.author_id == self.self_user_id {
            return PipelineOutcome::OwnMessage;
        }

        if !self.state.is_channel_enabled(msg.channel_id) {
            return PipelineOutcome::ChannelDisabled;
        }

        let services = self.state.enabled_services();
        let actions = rewrite::rewrite_links(&msg.text, true, &services);
        if actions.is_empty() {
            return PipelineOutcome::NoEligibleLinks;
        }

        let mut replies_sent = 0;
        for action in &actions {
            let reply = action.reply_text(msg.author_id);
            if let Err(e) = self.outbound.send_message(msg.channel_id, &reply).await {
                tracing::error!(
                    error = %e,
                    channel_id = msg.channel_id,
                    message_id = msg.message_id,
                    "Failed to send rewritten link"
                );
                counter!("pipeline_send_failures_total").increment(1);
                self.delivery.record_send(msg.channel_id, self.classify(&e));
                return PipelineOutcome::SendFailed { replies_sent };
            }
            replies_sent += 1;
            self.delivery.record_send(msg.channel_id, Delivery::Ok);
            counter!("links_rewritten_total").increment(1);
        }

        let original_deleted = match self.outbound.delete_message(msg.channel_id, msg.message_id).await {
            Ok(()) => {
                self.delivery.record_delete(msg.channel_id, Delivery::Ok);
                true
            }
            Err(e) => {
                let result = self.classify(&e);
                tracing::warn!(
                    error = %e,
                    channel_id = msg.channel_id,
                    message_id = msg.message_id,
                    permission_denied = result == Delivery::Denied,
                    "Failed to delete original message"
                );
                self.delivery.record_delete(msg.channel_id, result);
                false
            }
        };

        tracing::debug!(
            channel_id = msg.channel_id,
            replies = replies_sent,
            original_deleted,
            "Message rewritten"
        );

        PipelineOutcome::Rewritten {
            replies: replies_sent,
            original_deleted,
        }
    }
}
