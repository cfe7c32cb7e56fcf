//! Last observed result of the bot's own writes, per channel.
//!
//! The debug command reads this to tell whether FixEmbed can actually post
//! and clean up in a channel, without computing guild permissions.

use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Ok,
    /// The platform refused the call for lack of a permission.
    Denied,
    Failed(String),
}

/// Latest send and delete results for one channel. `None` means the bot has
/// not tried yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelDelivery {
    pub send: Option<Delivery>,
    pub delete: Option<Delivery>,
}

#[derive(Debug, Default)]
pub struct DeliveryLog {
    channels: DashMap<u64, ChannelDelivery>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_send(&self, channel_id: u64, result: Delivery) {
        self.channels.entry(channel_id).or_default().send = Some(result);
    }

    pub fn record_delete(&self, channel_id: u64, result: Delivery) {
        self.channels.entry(channel_id).or_default().delete = Some(result);
    }

    pub fn get(&self, channel_id: u64) -> ChannelDelivery {
        self.channels
            .get(&channel_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}
