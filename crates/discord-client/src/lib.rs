use std::fmt;

use anyhow::{Context, Result};
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;

mod gateway;
mod model;

pub use gateway::FatalClose;
pub use model::{
    parse_dispatch, Channel, GatewayEvent, Guild, Message, User, CHANNEL_ANNOUNCEMENT, CHANNEL_TEXT,
};

/// Gateway intents: GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT
pub const INTENTS: u64 = (1 << 0) | (1 << 9) | (1 << 15);

/// A REST call answered with a non-success status.
#[derive(Debug)]
pub struct ApiError {
    pub action: &'static str,
    pub status: StatusCode,
    pub body: String,
}

impl ApiError {
    /// Discord answers 403 when the bot lacks a channel permission.
    pub fn is_forbidden(&self) -> bool {
        self.status == StatusCode::FORBIDDEN
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to {}: {} {}", self.action, self.status, self.body)
    }
}

impl std::error::Error for ApiError {}

#[derive(Clone)]
pub struct Discord {
    client: Client,
    api_base: String,
    gateway_url: String,
    token: String,
    pub bot_user_id: u64,
}

#[derive(Serialize)]
struct CreateMessage<'a> {
    content: &'a str,
}

impl Discord {
    /// Build a client and resolve the bot's own user id.
    pub async fn new(api_base: &str, gateway_url: &str, token: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("DiscordBot (fixembed, ", env!("CARGO_PKG_VERSION"), ")"))
            .build()?;
        let api_base = api_base.trim_end_matches('/').to_string();

        let resp = client
            .get(format!("{}/users/@me", api_base))
            .header("Authorization", format!("Bot {}", token))
            .send()
            .await
            .context("Failed to reach Discord API")?;
        let me: User = check(resp, "fetch bot user").await?.json().await?;

        tracing::info!(user_id = me.id, username = %me.username, "Authenticated with Discord");

        Ok(Self {
            client,
            api_base,
            gateway_url: gateway_url.to_string(),
            token: token.to_string(),
            bot_user_id: me.id,
        })
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.token)
    }

    /// Post a plain-text message to a channel.
    pub async fn send_message(&self, channel_id: u64, content: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/channels/{}/messages", self.api_base, channel_id))
            .header("Authorization", self.auth_header())
            .json(&CreateMessage { content })
            .send()
            .await?;

        check(resp, "send message").await?;
        Ok(())
    }

    pub async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<()> {
        let resp = self
            .client
            .delete(format!(
                "{}/channels/{}/messages/{}",
                self.api_base, channel_id, message_id
            ))
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        check(resp, "delete message").await?;
        Ok(())
    }
}

async fn check(resp: Response, action: &'static str) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError { action, status, body }.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intents_cover_guilds_messages_and_content() {
        assert_eq!(INTENTS, 33281);
    }

    #[test]
    fn missing_permission_is_reported_as_forbidden() {
        let err: anyhow::Error = ApiError {
            action: "delete message",
            status: StatusCode::FORBIDDEN,
            body: r#"{"message": "Missing Permissions", "code": 50013}"#.into(),
        }
        .into();

        let api = err.downcast_ref::<ApiError>().unwrap();
        assert!(api.is_forbidden());
        assert!(err.to_string().starts_with("Failed to delete message: 403 Forbidden"));

        let not_found = ApiError { action: "delete message", status: StatusCode::NOT_FOUND, body: String::new() };
        assert!(!not_found.is_forbidden());
    }
}
