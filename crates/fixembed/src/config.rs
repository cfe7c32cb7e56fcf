use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::database::DatabaseOptions;
use crate::retry::RetryPolicy;

pub const ENV_PREFIX: &str = "FIXEMBED";

/// Token variable read by earlier releases; used when the prefixed one is unset.
const LEGACY_TOKEN_VAR: &str = "BOT_TOKEN";

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Bot token, the only required value
    pub discord_token: String,

    #[serde(default = "default_discord_api_base")]
    pub discord_api_base: String,
    #[serde(default = "default_discord_gateway_url")]
    pub discord_gateway_url: String,
    /// Number of gateway shards to run in this process
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    /// SQLite file holding channel toggles and settings
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_database_pool_size")]
    pub database_pool_size: u32,
    /// How long SQLite waits on a lock before reporting busy. Kept short so
    /// the store retry policy bounds how long a contended write can take.
    #[serde(default = "default_database_busy_timeout_ms")]
    pub database_busy_timeout_ms: u64,

    /// Attempts per store write while the database reports busy/locked
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,
    #[serde(default = "default_store_retry_delay_ms")]
    pub store_retry_delay_ms: u64,

    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    /// Inactivity timeout for the guild-wide toggle view
    #[serde(default = "default_toggle_view_timeout_secs")]
    pub toggle_view_timeout_secs: u64,

    /// Address for /health and /metrics
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_discord_api_base() -> String { "https://discord.com/api/v10".into() }
fn default_discord_gateway_url() -> String { "wss://gateway.discord.gg/?v=10&encoding=json".into() }
fn default_shard_count() -> u32 { 1 }
fn default_database_path() -> String { "fixembed_data.db".into() }
fn default_database_pool_size() -> u32 { 5 }
fn default_database_busy_timeout_ms() -> u64 { 100 }
fn default_store_retry_attempts() -> u32 { 5 }
fn default_store_retry_delay_ms() -> u64 { 100 }
fn default_command_prefix() -> String { "!fixembed".into() }
fn default_toggle_view_timeout_secs() -> u64 { 180 }
fn default_listen_addr() -> String { "0.0.0.0:8000".into() }

impl Settings {
    /// Read settings from `FIXEMBED_*` environment variables.
    pub fn load() -> Result<Self> {
        Self::from_env(
            config::Environment::with_prefix(ENV_PREFIX),
            std::env::var(LEGACY_TOKEN_VAR).ok(),
        )
    }

    pub fn from_env(env: config::Environment, fallback_token: Option<String>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(token) = fallback_token {
            builder = builder.set_default("discord_token", token)?;
        }

        let settings: Settings = builder
            .add_source(env)
            .build()
            .context("Failed to build config")?
            .try_deserialize()
            .context("Failed to deserialize config (is FIXEMBED_DISCORD_TOKEN set?)")?;

        if settings.discord_token.trim().is_empty() {
            anyhow::bail!("FIXEMBED_DISCORD_TOKEN is empty");
        }
        if settings.shard_count == 0 {
            anyhow::bail!("FIXEMBED_SHARD_COUNT must be at least 1");
        }
        Ok(settings)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.store_retry_attempts,
            Duration::from_millis(self.store_retry_delay_ms),
        )
    }

    pub fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            path: self.database_path.clone(),
            pool_size: self.database_pool_size,
            busy_timeout: Duration::from_millis(self.database_busy_timeout_ms),
            retry: self.retry_policy(),
        }
    }

    pub fn toggle_view_timeout(&self) -> Duration {
        Duration::from_secs(self.toggle_view_timeout_secs)
    }
}
