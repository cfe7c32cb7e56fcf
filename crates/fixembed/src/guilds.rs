use dashmap::DashMap;

/// Text channels per guild, as last reported by the gateway.
pub struct GuildDirectory {
    guilds: DashMap<u64, Vec<u64>>,
}

impl Default for GuildDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl GuildDirectory {
    pub fn new() -> Self {
        Self {
            guilds: DashMap::new(),
        }
    }

    /// Replace the channel list for a guild. Called on every guild create.
    pub fn register(&self, guild_id: u64, channel_ids: Vec<u64>) {
        self.guilds.insert(guild_id, channel_ids);
    }

    pub fn remove(&self, guild_id: u64) {
        self.guilds.remove(&guild_id);
    }

    /// Track a channel created after the guild became available. Ignored for
    /// guilds that have not been registered yet; their create event will
    /// carry the channel.
    pub fn add_channel(&self, guild_id: u64, channel_id: u64) -> bool {
        match self.guilds.get_mut(&guild_id) {
            Some(mut channels) if !channels.contains(&channel_id) => {
                channels.push(channel_id);
                true
            }
            _ => false,
        }
    }

    pub fn remove_channel(&self, guild_id: u64, channel_id: u64) {
        if let Some(mut channels) = self.guilds.get_mut(&guild_id) {
            channels.retain(|id| *id != channel_id);
        }
    }

    /// Whether `channel_id` is a known text channel of `guild_id`.
    pub fn has_channel(&self, guild_id: u64, channel_id: u64) -> bool {
        self.guilds
            .get(&guild_id)
            .is_some_and(|channels| channels.contains(&channel_id))
    }

    /// Known text channels of `guild_id`, empty when the guild is unknown.
    pub fn channels(&self, guild_id: u64) -> Vec<u64> {
        self.guilds
            .get(&guild_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, guild_id: u64) -> bool {
        self.guilds.contains_key(&guild_id)
    }

    pub fn guild_count(&self) -> usize {
        self.guilds.len()
    }
}
