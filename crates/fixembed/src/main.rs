use anyhow::Result;
use axum::{extract::State, routing::get, Router};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use discord_client::{Discord, GatewayEvent};
use fixembed::commands::{CommandHandler, CommandOptions};
use fixembed::config::Settings;
use fixembed::database::Database;
use fixembed::guilds::GuildDirectory;
use fixembed::pipeline::{ChatOutbound, InboundMessage, MessagePipeline};
use fixembed::state::StateCache;

/// Bound on gateway events waiting for the handler across all shards.
const EVENT_QUEUE_SIZE: usize = 1000;

struct AppState {
    db: Database,
    state: Arc<StateCache>,
    guilds: Arc<GuildDirectory>,
    pipeline: MessagePipeline,
    commands: CommandHandler,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (dev only, non-fatal in production)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    let settings = Settings::load()?;

    let db = Database::connect(&settings.database_options()).await?;
    let state = Arc::new(StateCache::load(Arc::new(db.clone())).await?);

    let discord = Arc::new(
        Discord::new(
            &settings.discord_api_base,
            &settings.discord_gateway_url,
            &settings.discord_token,
        )
        .await?,
    );
    let outbound: Arc<dyn ChatOutbound> = discord.clone();
    let guilds = Arc::new(GuildDirectory::new());

    let pipeline = MessagePipeline::new(state.clone(), outbound.clone(), discord.bot_user_id);
    let delivery = pipeline.delivery_log();

    let app = Arc::new(AppState {
        db,
        state: state.clone(),
        guilds: guilds.clone(),
        pipeline,
        commands: CommandHandler::new(
            state,
            guilds,
            outbound,
            delivery,
            CommandOptions {
                prefix: settings.command_prefix.clone(),
                view_timeout: settings.toggle_view_timeout(),
                shard_count: settings.shard_count,
            },
        ),
    });

    // Create cancellation token for graceful shutdown of background tasks
    let cancel_token = CancellationToken::new();

    // One gateway listener per shard, all feeding the same handler
    let (event_tx, event_rx) = mpsc::channel::<GatewayEvent>(EVENT_QUEUE_SIZE);
    let mut shard_handles = Vec::new();
    for shard_id in 0..settings.shard_count {
        let discord = discord.clone();
        let tx = event_tx.clone();
        let cancel_clone = cancel_token.clone();
        let shard_count = settings.shard_count;
        shard_handles.push(tokio::spawn(async move {
            tokio::select! {
                result = discord.listen(shard_id, shard_count, tx) => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, shard_id, "Gateway listener error");
                    }
                }
                _ = cancel_clone.cancelled() => {
                    tracing::info!(shard_id, "Gateway listener cancelled");
                }
            }
        }));
    }
    // The handler sees a closed channel once every shard has stopped
    drop(event_tx);

    let app_clone = app.clone();
    let cancel_clone = cancel_token.clone();
    let handler_handle = tokio::spawn(async move {
        handle_events(app_clone, event_rx, cancel_clone).await;
    });

    let router = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }))
        .with_state(app);

    let listener = tokio::net::TcpListener::bind(&settings.listen_addr).await?;
    tracing::info!("Listening on {}", settings.listen_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(cancel_token.clone()))
        .await?;

    // Cancel background tasks and wait for them to complete
    tracing::info!("Cancelling background tasks...");
    cancel_token.cancel();

    let shutdown_timeout = std::time::Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        for handle in shard_handles {
            let _ = handle.await;
        }
        let _ = handler_handle.await;
    })
    .await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Health check endpoint.
/// Verifies database connectivity and returns 503 if it is down.
async fn health_check(
    State(app): State<Arc<AppState>>,
) -> (axum::http::StatusCode, &'static str) {
    match app.db.health_check().await {
        Ok(()) => (axum::http::StatusCode::OK, "OK"),
        Err(_) => (axum::http::StatusCode::SERVICE_UNAVAILABLE, "Database unavailable"),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal(cancel_token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = cancel_token.cancelled() => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

async fn handle_events(
    app: Arc<AppState>,
    mut rx: mpsc::Receiver<GatewayEvent>,
    cancel_token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(e) => e,
                    None => {
                        tracing::error!("All gateway shards stopped, shutting down");
                        cancel_token.cancel();
                        break;
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                tracing::info!("Event handler cancelled");
                break;
            }
        };

        match event {
            GatewayEvent::GuildCreate(guild) => {
                let channels = guild.text_channel_ids();
                let seeded = app.state.seed_channels(channels.iter().copied());
                tracing::info!(
                    guild_id = guild.id,
                    name = %guild.name,
                    channels = channels.len(),
                    seeded,
                    "Guild available"
                );
                app.guilds.register(guild.id, channels);
                gauge!("guilds").set(app.guilds.guild_count() as f64);
            }
            GatewayEvent::GuildDelete { guild_id } => {
                tracing::info!(guild_id, "Removed from guild");
                app.guilds.remove(guild_id);
                gauge!("guilds").set(app.guilds.guild_count() as f64);
            }
            GatewayEvent::ChannelCreate { guild_id, channel_id } => {
                if app.guilds.add_channel(guild_id, channel_id) {
                    app.state.seed_channels([channel_id]);
                    tracing::debug!(guild_id, channel_id, "Channel created");
                }
            }
            GatewayEvent::ChannelDelete { guild_id, channel_id } => {
                app.guilds.remove_channel(guild_id, channel_id);
                tracing::debug!(guild_id, channel_id, "Channel deleted");
            }
            GatewayEvent::MessageCreate(msg) => {
                counter!("messages_received_total").increment(1);
                let app = app.clone();
                // Each message is independent; no ordering between them
                tokio::spawn(async move {
                    let start = Instant::now();
                    let inbound = InboundMessage::from(msg);
                    if !app.commands.handle(&inbound).await {
                        let outcome = app.pipeline.handle(&inbound).await;
                        tracing::trace!(message_id = inbound.message_id, ?outcome, "Message handled");
                    }
                    histogram!("message_handling_seconds").record(start.elapsed().as_secs_f64());
                });
            }
        }
    }
}
