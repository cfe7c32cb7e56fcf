use serde::Deserialize;

/// Guild text channel (`GUILD_TEXT`).
pub const CHANNEL_TEXT: u8 = 0;
/// Announcement channel (`GUILD_ANNOUNCEMENT`), also carries ordinary messages.
pub const CHANNEL_ANNOUNCEMENT: u8 = 5;

/// Discord sends snowflakes as decimal strings.
pub(crate) mod snowflake {
    use serde::{Deserialize, Deserializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }

    fn convert<E: Error>(raw: Raw) -> Result<u64, E> {
        match raw {
            Raw::Str(s) => s.parse().map_err(|_| E::custom(format!("invalid snowflake: {s}"))),
            Raw::Num(n) => Ok(n),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        convert(Raw::deserialize(d)?)
    }

    pub fn option<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Option::<Raw>::deserialize(d)?.map(convert).transpose()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    #[serde(with = "snowflake")]
    pub id: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    #[serde(with = "snowflake")]
    pub id: u64,
    #[serde(with = "snowflake")]
    pub channel_id: u64,
    #[serde(default, deserialize_with = "snowflake::option")]
    pub guild_id: Option<u64>,
    pub author: User,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    #[serde(with = "snowflake")]
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: u8,
    /// Absent inside `GUILD_CREATE`, present on channel events.
    #[serde(default, deserialize_with = "snowflake::option")]
    pub guild_id: Option<u64>,
}

impl Channel {
    pub fn is_text(&self) -> bool {
        self.kind == CHANNEL_TEXT || self.kind == CHANNEL_ANNOUNCEMENT
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Guild {
    #[serde(with = "snowflake")]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

impl Guild {
    /// Channels that carry ordinary messages.
    pub fn text_channel_ids(&self) -> Vec<u64> {
        self.channels
            .iter()
            .filter(|c| c.is_text())
            .map(|c| c.id)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct UnavailableGuild {
    #[serde(with = "snowflake")]
    pub id: u64,
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Ready {
    pub user: User,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
}

/// Events forwarded to the application.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    MessageCreate(Message),
    GuildCreate(Guild),
    /// The bot was removed from the guild. Outages are not reported.
    GuildDelete { guild_id: u64 },
    /// A text channel was added to a guild after it became available.
    ChannelCreate { guild_id: u64, channel_id: u64 },
    ChannelDelete { guild_id: u64, channel_id: u64 },
}

/// Turn a dispatch (`op 0`) payload into an event. Unknown or unparseable
/// dispatches yield `None`.
pub fn parse_dispatch(event_name: &str, data: serde_json::Value) -> Option<GatewayEvent> {
    match event_name {
        "MESSAGE_CREATE" => serde_json::from_value(data).ok().map(GatewayEvent::MessageCreate),
        "GUILD_CREATE" => serde_json::from_value(data).ok().map(GatewayEvent::GuildCreate),
        "GUILD_DELETE" => {
            let guild: UnavailableGuild = serde_json::from_value(data).ok()?;
            (!guild.unavailable).then_some(GatewayEvent::GuildDelete { guild_id: guild.id })
        }
        "CHANNEL_CREATE" => {
            let channel: Channel = serde_json::from_value(data).ok()?;
            let guild_id = channel.guild_id?;
            channel.is_text().then_some(GatewayEvent::ChannelCreate {
                guild_id,
                channel_id: channel.id,
            })
        }
        "CHANNEL_DELETE" => {
            let channel: Channel = serde_json::from_value(data).ok()?;
            Some(GatewayEvent::ChannelDelete {
                guild_id: channel.guild_id?,
                channel_id: channel.id,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_create_parses_string_snowflakes() {
        let event = parse_dispatch(
            "MESSAGE_CREATE",
            json!({
                "id": "1100000000000000001",
                "channel_id": "42",
                "guild_id": "7",
                "author": { "id": "9", "username": "alice" },
                "content": "https://twitter.com/alice/status/1"
            }),
        );
        let Some(GatewayEvent::MessageCreate(msg)) = event else {
            panic!("expected MessageCreate, got {event:?}");
        };
        assert_eq!(msg.id, 1_100_000_000_000_000_001);
        assert_eq!(msg.channel_id, 42);
        assert_eq!(msg.guild_id, Some(7));
        assert_eq!(msg.author.id, 9);
        assert!(!msg.author.bot);
    }

    #[test]
    fn direct_message_has_no_guild() {
        let event = parse_dispatch(
            "MESSAGE_CREATE",
            json!({ "id": "1", "channel_id": "2", "author": { "id": "3", "bot": true } }),
        );
        let Some(GatewayEvent::MessageCreate(msg)) = event else {
            panic!("expected MessageCreate");
        };
        assert_eq!(msg.guild_id, None);
        assert!(msg.author.bot);
        assert_eq!(msg.content, "");
    }

    #[test]
    fn guild_create_keeps_only_text_channels() {
        let event = parse_dispatch(
            "GUILD_CREATE",
            json!({
                "id": "100",
                "name": "test",
                "channels": [
                    { "id": "1", "type": 0 },
                    { "id": "2", "type": 2 },
                    { "id": "3", "type": 5 },
                    { "id": "4", "type": 4 }
                ]
            }),
        );
        let Some(GatewayEvent::GuildCreate(guild)) = event else {
            panic!("expected GuildCreate");
        };
        assert_eq!(guild.id, 100);
        assert_eq!(guild.text_channel_ids(), vec![1, 3]);
    }

    #[test]
    fn guild_outage_is_not_a_removal() {
        assert!(parse_dispatch("GUILD_DELETE", json!({ "id": "5", "unavailable": true })).is_none());
        assert!(matches!(
            parse_dispatch("GUILD_DELETE", json!({ "id": "5" })),
            Some(GatewayEvent::GuildDelete { guild_id: 5 })
        ));
    }

    #[test]
    fn channel_create_reports_only_guild_text_channels() {
        assert!(matches!(
            parse_dispatch("CHANNEL_CREATE", json!({ "id": "8", "type": 0, "guild_id": "100" })),
            Some(GatewayEvent::ChannelCreate { guild_id: 100, channel_id: 8 })
        ));
        // voice channel
        assert!(parse_dispatch("CHANNEL_CREATE", json!({ "id": "9", "type": 2, "guild_id": "100" })).is_none());
        // group DM
        assert!(parse_dispatch("CHANNEL_CREATE", json!({ "id": "10", "type": 3 })).is_none());
    }

    #[test]
    fn channel_delete_carries_guild() {
        assert!(matches!(
            parse_dispatch("CHANNEL_DELETE", json!({ "id": "8", "type": 0, "guild_id": "100" })),
            Some(GatewayEvent::ChannelDelete { guild_id: 100, channel_id: 8 })
        ));
    }

    #[test]
    fn message_from_another_bot_is_parsed() {
        let event = parse_dispatch(
            "MESSAGE_CREATE",
            json!({
                "id": "1",
                "channel_id": "2",
                "guild_id": "3",
                "author": { "id": "77", "bot": true },
                "content": "https://twitter.com/a/status/1"
            }),
        );
        assert!(matches!(event, Some(GatewayEvent::MessageCreate(ref m)) if m.author.bot && m.author.id == 77));
    }

    #[test]
    fn unknown_and_malformed_dispatches_are_ignored() {
        assert!(parse_dispatch("TYPING_START", json!({})).is_none());
        assert!(parse_dispatch("MESSAGE_CREATE", json!({ "id": "x" })).is_none());
    }
}
