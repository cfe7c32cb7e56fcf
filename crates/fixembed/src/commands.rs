//! Text commands: `<prefix> <sub-command> [args]`.
//!
//! Commands are consumed here and never reach the rewrite pipeline. Every
//! mutation goes through [`StateCache`], so a command that fails to persist
//! leaves the previous setting in effect and says so in its reply.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use metrics::counter;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::delivery::{Delivery, DeliveryLog};
use crate::error::ServiceSetError;
use crate::guilds::GuildDirectory;
use crate::pipeline::{ChatOutbound, InboundMessage};
use crate::service::{Service, ServiceSet};
use crate::state::StateCache;
use crate::toggle_view::{PressOutcome, ToggleView, ViewState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const SUPPORT_SERVER: &str = "https://discord.gg/QFxTAmtZdn";
const SOURCE_CODE: &str = "https://github.com/kenhendricks00/FixEmbedBot";

pub const VIEW_EXPIRED: &str = "This view has timed out and is no longer interactive.";
pub const GUILD_ONLY: &str = "This command only works in a server.";
pub const FOREIGN_CHANNEL: &str = "⚠️ That channel is not a text channel in this server.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Enable the mentioned channel, or the current one.
    Enable(Option<u64>),
    Disable(Option<u64>),
    Services(ServiceSet),
    Settings,
    Toggle,
    Debug,
    About,
    Help,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Enable(_) => "enable",
            Command::Disable(_) => "disable",
            Command::Services(_) => "services",
            Command::Settings => "settings",
            Command::Toggle => "toggle",
            Command::Debug => "debug",
            Command::About => "about",
            Command::Help => "help",
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    #[error("`{0}` is not a channel")]
    BadChannel(String),

    #[error("pick at least one service")]
    NoServices,

    #[error(transparent)]
    Services(#[from] ServiceSetError),
}

/// Parse `text` as a command addressed with `prefix`.
///
/// Returns `None` when the message is not a command at all, so it can go on
/// to the rewrite pipeline.
pub fn parse_command(prefix: &str, text: &str) -> Option<Result<Command, ParseError>> {
    let rest = text.trim().strip_prefix(prefix)?;
    if !(rest.is_empty() || rest.starts_with(char::is_whitespace)) {
        return None;
    }

    let mut words = rest.split_whitespace();
    let Some(sub) = words.next() else {
        return Some(Ok(Command::Help));
    };

    let parsed = match sub.to_ascii_lowercase().as_str() {
        "enable" => parse_channel(words.next()).map(Command::Enable),
        "disable" => parse_channel(words.next()).map(Command::Disable),
        "services" => parse_services(words),
        "settings" => Ok(Command::Settings),
        "toggle" => Ok(Command::Toggle),
        "debug" => Ok(Command::Debug),
        "about" => Ok(Command::About),
        "help" => Ok(Command::Help),
        other => Err(ParseError::UnknownCommand(other.to_string())),
    };
    Some(parsed)
}

/// Accepts a `<#id>` mention or a bare id.
fn parse_channel(arg: Option<&str>) -> Result<Option<u64>, ParseError> {
    let Some(arg) = arg else {
        return Ok(None);
    };
    let digits = arg
        .strip_prefix("<#")
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(arg);
    digits
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ParseError::BadChannel(arg.to_string()))
}

fn parse_services<'a>(words: impl Iterator<Item = &'a str>) -> Result<Command, ParseError> {
    let names: Vec<&str> = words
        .flat_map(|w| w.split(','))
        .map(str::trim)
        .filter(|w| !w.is_empty())
        .collect();

    if names.iter().any(|n| n.eq_ignore_ascii_case("all")) {
        return Ok(Command::Services(ServiceSet::all()));
    }

    let services = ServiceSet::from_names(names)?;
    if services.is_empty() {
        return Err(ParseError::NoServices);
    }
    Ok(Command::Services(services))
}

pub fn usage(prefix: &str) -> String {
    format!(
        "**Usage:**\n\
         `{prefix} enable [#channel]` enable link fixing\n\
         `{prefix} disable [#channel]` disable link fixing\n\
         `{prefix} services <names...|all>` choose services ({})\n\
         `{prefix} settings` show settings and open the toggle\n\
         `{prefix} toggle` flip FixEmbed for every channel\n\
         `{prefix} debug` show debug information\n\
         `{prefix} about` show information about the bot",
        Service::ALL.map(|s| s.as_str()).join(", ")
    )
}

fn status_dot(on: bool) -> &'static str {
    if on { "🟢" } else { "🔴" }
}

pub fn service_status_list(services: &ServiceSet) -> String {
    Service::ALL
        .iter()
        .map(|s| format!("{} {}", status_dot(services.contains(*s)), s))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One debug line for the last observed result of a send or delete.
pub fn delivery_line(label: &str, last: Option<&Delivery>) -> String {
    match last {
        None => format!("- ⚪ {label} (not used yet)"),
        Some(Delivery::Ok) => format!("- 🟢 {label}"),
        Some(Delivery::Denied) => format!("- 🔴 {label} (missing, last attempt was refused)"),
        Some(Delivery::Failed(reason)) => format!("- 🟠 {label} (last attempt failed: {reason})"),
    }
}

fn guild_status(enabled: bool) -> String {
    format!(
        "**Enable/Disable FixEmbed:**\n{} FixEmbed {}\n\n\
         **NOTE:** May take a few seconds to apply changes to all channels.",
        status_dot(enabled),
        if enabled { "enabled" } else { "disabled" }
    )
}

/// `H:MM:SS`, prefixed with whole days when there are any.
pub fn format_uptime(uptime: TimeDelta) -> String {
    let total = uptime.num_seconds().max(0);
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    let clock = format!("{hours}:{minutes:02}:{seconds:02}");
    match days {
        0 => clock,
        1 => format!("1 day, {clock}"),
        n => format!("{n} days, {clock}"),
    }
}

/// Shard that receives events for `guild_id`, numbered from 1.
pub fn shard_for_guild(guild_id: u64, shard_count: u32) -> u64 {
    (guild_id >> 22) % u64::from(shard_count.max(1)) + 1
}

#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub prefix: String,
    pub view_timeout: Duration,
    pub shard_count: u32,
}

pub struct CommandHandler {
    state: Arc<StateCache>,
    guilds: Arc<GuildDirectory>,
    outbound: Arc<dyn ChatOutbound>,
    delivery: Arc<DeliveryLog>,
    views: DashMap<u64, Arc<Mutex<ToggleView>>>,
    options: CommandOptions,
    started_at: DateTime<Utc>,
}

impl CommandHandler {
    pub fn new(
        state: Arc<StateCache>,
        guilds: Arc<GuildDirectory>,
        outbound: Arc<dyn ChatOutbound>,
        delivery: Arc<DeliveryLog>,
        options: CommandOptions,
    ) -> Self {
        Self {
            state,
            guilds,
            outbound,
            delivery,
            views: DashMap::new(),
            options,
            started_at: Utc::now(),
        }
    }

    /// Handle `msg` if it is a command. Returns false when it is not, so the
    /// caller can pass it on to the rewrite pipeline.
    pub async fn handle(&self, msg: &InboundMessage) -> bool {
        let Some(parsed) = parse_command(&self.options.prefix, &msg.text) else {
            return false;
        };

        let reply = match parsed {
            Ok(command) => {
                counter!("commands_handled_total", "command" => command.name()).increment(1);
                tracing::debug!(
                    command = command.name(),
                    channel_id = msg.channel_id,
                    author_id = msg.author_id,
                    "Handling command"
                );
                self.execute(command, msg).await
            }
            Err(e) => format!("{e}\n\n{}", usage(&self.options.prefix)),
        };

        if let Err(e) = self.outbound.send_message(msg.channel_id, &reply).await {
            tracing::warn!(error = %e, channel_id = msg.channel_id, "Failed to send command reply");
        }
        true
    }

    pub async fn execute(&self, command: Command, msg: &InboundMessage) -> String {
        match command {
            Command::Enable(channel) => match self.target_channel(channel, msg) {
                Some(channel_id) => self.set_channel(channel_id, true).await,
                None => FOREIGN_CHANNEL.to_string(),
            },
            Command::Disable(channel) => match self.target_channel(channel, msg) {
                Some(channel_id) => self.set_channel(channel_id, false).await,
                None => FOREIGN_CHANNEL.to_string(),
            },
            Command::Services(services) => self.set_services(services).await,
            Command::Settings => match msg.guild_id {
                Some(guild_id) => self.open_view(guild_id),
                None => GUILD_ONLY.to_string(),
            },
            Command::Toggle => match msg.guild_id {
                Some(guild_id) => self.press_view(guild_id).await,
                None => GUILD_ONLY.to_string(),
            },
            Command::Debug => match msg.guild_id {
                Some(guild_id) => self.debug_info(guild_id, msg.channel_id),
                None => GUILD_ONLY.to_string(),
            },
            Command::About => about(),
            Command::Help => usage(&self.options.prefix),
        }
    }

    /// The channel an enable/disable applies to. A named channel must belong
    /// to the guild the command came from; outside a guild only the current
    /// channel can be targeted.
    fn target_channel(&self, requested: Option<u64>, msg: &InboundMessage) -> Option<u64> {
        match requested {
            None => Some(msg.channel_id),
            Some(id) if id == msg.channel_id => Some(id),
            Some(id) => {
                let guild_id = msg.guild_id?;
                self.guilds.has_channel(guild_id, id).then_some(id)
            }
        }
    }

    async fn set_channel(&self, channel_id: u64, enabled: bool) -> String {
        match self.state.set_channel_enabled(channel_id, enabled).await {
            Ok(()) if enabled => format!("✅ Enabled for <#{channel_id}>!"),
            Ok(()) => format!("❎ Disabled for <#{channel_id}>!"),
            Err(e) => {
                tracing::error!(error = %e, channel_id, enabled, "Failed to save channel state");
                format!("⚠️ Could not save the setting for <#{channel_id}>, it is unchanged. Please try again.")
            }
        }
    }

    async fn set_services(&self, services: ServiceSet) -> String {
        match self.state.set_enabled_services(services).await {
            Ok(()) => format!(
                "**Service Settings**\n**Enabled services:**\n{}",
                service_status_list(&self.state.enabled_services())
            ),
            Err(e) => {
                tracing::error!(error = %e, "Failed to save enabled services");
                "⚠️ Could not save the service settings, they are unchanged. Please try again.".to_string()
            }
        }
    }

    fn guild_enabled(&self, guild_id: u64) -> bool {
        self.state.all_enabled(&self.guilds.channels(guild_id))
    }

    /// Open a fresh toggle view for the guild, replacing any previous one.
    fn open_view(&self, guild_id: u64) -> String {
        let enabled = self.guild_enabled(guild_id);
        self.views.insert(
            guild_id,
            Arc::new(Mutex::new(ToggleView::new(enabled, self.options.view_timeout))),
        );

        format!(
            "**FixEmbed Settings**\n{}\n\n**Enabled services:**\n{}\n\n\
             Use `{} toggle` to flip FixEmbed for every channel. \
             This expires after {} seconds without use.",
            guild_status(enabled),
            service_status_list(&self.state.enabled_services()),
            self.options.prefix,
            self.options.view_timeout.as_secs()
        )
    }

    async fn press_view(&self, guild_id: u64) -> String {
        // Clone out of the map so no shard lock is held across the await.
        let view = self.views.get(&guild_id).map(|v| Arc::clone(v.value()));
        let Some(view) = view else {
            return VIEW_EXPIRED.to_string();
        };

        let channel_ids = self.guilds.channels(guild_id);
        let outcome = view.lock().await.press(&self.state, &channel_ids).await;
        match outcome {
            PressOutcome::Toggled { enabled, channels } => {
                tracing::info!(guild_id, enabled, channels, "Guild toggled");
                format!("**FixEmbed Settings**\n{}", guild_status(enabled))
            }
            PressOutcome::Expired => {
                self.views.remove_if(&guild_id, |_, v| {
                    v.try_lock().map(|mut v| v.state() == ViewState::Expired).unwrap_or(false)
                });
                VIEW_EXPIRED.to_string()
            }
            PressOutcome::Failed(partial) => {
                tracing::error!(
                    error = %partial.error,
                    guild_id,
                    committed = partial.committed,
                    failed_channel = partial.failed_channel,
                    "Guild toggle stopped partway"
                );
                format!(
                    "⚠️ Could not save every channel ({} of {} updated). Please try again.",
                    partial.committed,
                    channel_ids.len()
                )
            }
        }
    }

    fn debug_info(&self, guild_id: u64, channel_id: u64) -> String {
        let working = self.state.is_channel_enabled(channel_id);
        let guild_enabled = self.guild_enabled(guild_id);
        let uptime = format_uptime(Utc::now() - self.started_at);
        let delivery = self.delivery.get(channel_id);

        format!(
            "**Debug Information**\n\
             For more help, join the [support server]({SUPPORT_SERVER})\n\n\
             {} **FixEmbed {} in** <#{channel_id}>\n\
             - {} FixEmbed {}\n\
             {}\n\
             {}\n\n\
             **Enabled services:**\n{}\n\n\
             ```\nStatus: {}\nShard: {}\nUptime: {uptime}\nVersion: {VERSION}\n```",
            status_dot(working),
            if working { "working" } else { "not working" },
            status_dot(working),
            if working { "enabled" } else { "disabled" },
            delivery_line("Send message permission", delivery.send.as_ref()),
            delivery_line("Manage messages permission", delivery.delete.as_ref()),
            service_status_list(&self.state.enabled_services()),
            if guild_enabled { "Enabled" } else { "Disabled" },
            shard_for_guild(guild_id, self.options.shard_count),
        )
    }
}

fn about() -> String {
    format!(
        "**About**\nThis bot fixes the lack of embed support in Discord.\n\n\
         **Links**\n\
         - [Source code]({SOURCE_CODE})\n\
         - [Support server]({SUPPORT_SERVER})\n\n\
         FixEmbed v{VERSION}"
    )
}
