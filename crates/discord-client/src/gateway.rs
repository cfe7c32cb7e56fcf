use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite};
use tungstenite::Message as WsMessage;

use crate::model::{parse_dispatch, GatewayEvent, Ready};
use crate::{Discord, INTENTS};

/// Exponential backoff configuration
const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;
const BACKOFF_MULTIPLIER: u64 = 2;

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

/// Close codes after which reconnecting cannot help: bad token, bad shard
/// config, bad API version, bad or disallowed intents.
const FATAL_CLOSE_CODES: &[u16] = &[4004, 4010, 4011, 4012, 4013, 4014];

/// The gateway closed with a code that rules out reconnecting.
#[derive(Debug)]
pub struct FatalClose {
    pub code: u16,
    pub reason: String,
}

impl fmt::Display for FatalClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gateway closed with fatal code {}: {}", self.code, self.reason)
    }
}

impl std::error::Error for FatalClose {}

#[derive(Deserialize)]
struct Payload {
    op: u8,
    #[serde(default)]
    d: serde_json::Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

fn heartbeat_frame(seq: Option<u64>) -> WsMessage {
    let payload = serde_json::json!({ "op": OP_HEARTBEAT, "d": seq });
    WsMessage::Text(payload.to_string().into())
}

impl Discord {
    /// Run one gateway shard with automatic reconnection on disconnect.
    /// Uses exponential backoff with jitter to prevent thundering herd.
    /// Returns when the receiver is dropped or the gateway closes fatally.
    pub async fn listen(
        &self,
        shard_id: u32,
        shard_count: u32,
        tx: mpsc::Sender<GatewayEvent>,
    ) -> Result<()> {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        let mut consecutive_failures = 0u32;

        loop {
            match self.connect_and_listen(shard_id, shard_count, &tx).await {
                Ok(true) => {
                    // Session was healthy, reset backoff
                    backoff_secs = INITIAL_BACKOFF_SECS;
                    consecutive_failures = 0;
                    tracing::info!(shard_id, "Gateway session ended, reconnecting immediately");
                }
                Ok(false) => {
                    tracing::info!(shard_id, "Event receiver closed, stopping gateway shard");
                    break Ok(());
                }
                Err(e) if e.is::<FatalClose>() => {
                    tracing::error!(error = %e, shard_id, "Gateway rejected the connection");
                    break Err(e);
                }
                Err(e) => {
                    consecutive_failures += 1;

                    // Add jitter (0-25% of backoff time)
                    let jitter_ms = backoff_secs * 250;
                    let jitter = if jitter_ms > 0 {
                        (std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_millis() as u64)
                            % jitter_ms
                    } else {
                        0
                    };

                    let delay = Duration::from_secs(backoff_secs) + Duration::from_millis(jitter);

                    tracing::warn!(
                        error = %e,
                        shard_id,
                        backoff_secs,
                        jitter_ms = jitter,
                        consecutive_failures,
                        "Gateway disconnected, reconnecting after backoff"
                    );

                    tokio::time::sleep(delay).await;

                    backoff_secs = (backoff_secs * BACKOFF_MULTIPLIER).min(MAX_BACKOFF_SECS);
                }
            }
        }
    }

    /// One gateway session.
    /// Returns Ok(true) when the session was ready and ended in a way that
    /// allows an immediate reconnect, Ok(false) when the event receiver is
    /// gone, and Err for connection failures.
    async fn connect_and_listen(
        &self,
        shard_id: u32,
        shard_count: u32,
        tx: &mpsc::Sender<GatewayEvent>,
    ) -> Result<bool> {
        tracing::info!(shard_id, shard_count, "Connecting to Discord gateway");
        let (ws, _) = connect_async(&self.gateway_url).await?;
        let (mut write, mut read) = ws.split();

        let hello = next_payload(&mut read).await?;
        if hello.op != OP_HELLO {
            return Err(anyhow!("Expected hello, got op {}", hello.op));
        }
        let interval_ms = hello.d["heartbeat_interval"]
            .as_u64()
            .ok_or_else(|| anyhow!("Hello without heartbeat_interval"))?;
        let period = Duration::from_millis(interval_ms);
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let identify = serde_json::json!({
            "op": OP_IDENTIFY,
            "d": {
                "token": self.token,
                "intents": INTENTS,
                "shard": [shard_id, shard_count],
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "fixembed",
                    "device": "fixembed"
                }
            }
        });
        write.send(WsMessage::Text(identify.to_string().into())).await?;

        let mut seq: Option<u64> = None;
        let mut acked = true;
        let mut ready = false;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if !acked {
                        return Err(anyhow!("Heartbeat not acknowledged, connection is stale"));
                    }
                    acked = false;
                    write.send(heartbeat_frame(seq)).await?;
                }
                frame = read.next() => {
                    let Some(frame) = frame else {
                        return session_end(ready, "Gateway stream ended");
                    };
                    let text = match frame? {
                        WsMessage::Text(text) => text,
                        WsMessage::Close(Some(close)) => {
                            let code = u16::from(close.code);
                            if FATAL_CLOSE_CODES.contains(&code) {
                                return Err(FatalClose { code, reason: close.reason.to_string() }.into());
                            }
                            return session_end(ready, "Gateway closed the connection");
                        }
                        WsMessage::Close(None) => return session_end(ready, "Gateway closed the connection"),
                        _ => continue,
                    };
                    let Ok(payload) = serde_json::from_str::<Payload>(&text) else { continue };

                    match payload.op {
                        OP_DISPATCH => {
                            if payload.s.is_some() {
                                seq = payload.s;
                            }
                            let Some(name) = payload.t.as_deref() else { continue };
                            if name == "READY" {
                                ready = true;
                                if let Ok(r) = serde_json::from_value::<Ready>(payload.d) {
                                    tracing::info!(
                                        shard_id,
                                        user_id = r.user.id,
                                        guilds = r.guilds.len(),
                                        "Gateway session ready"
                                    );
                                }
                                continue;
                            }
                            // Bot and webhook messages are forwarded too; the app
                            // skips only its own.
                            let Some(event) = parse_dispatch(name, payload.d) else { continue };
                            match tx.try_send(event) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    tracing::warn!(shard_id, "Event channel full, dropping event to prevent backpressure");
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => return Ok(false),
                            }
                        }
                        OP_HEARTBEAT => write.send(heartbeat_frame(seq)).await?,
                        OP_HEARTBEAT_ACK => acked = true,
                        OP_RECONNECT => {
                            tracing::info!(shard_id, "Gateway requested reconnect");
                            return Ok(true);
                        }
                        OP_INVALID_SESSION => return Err(anyhow!("Gateway invalidated the session")),
                        _ => {}
                    }
                }
            }
        }
    }
}

fn session_end(ready: bool, what: &str) -> Result<bool> {
    if ready {
        Ok(true)
    } else {
        Err(anyhow!("{what} before the session was ready"))
    }
}

async fn next_payload<S>(read: &mut S) -> Result<Payload>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = read.next().await {
        if let WsMessage::Text(text) = frame? {
            return Ok(serde_json::from_str(&text)?);
        }
    }
    Err(anyhow!("Gateway closed before hello"))
}
