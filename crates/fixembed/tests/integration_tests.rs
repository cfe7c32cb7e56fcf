//! Integration tests for fixembed
//!
//! These drive the message pipeline and the command handler against a real
//! SQLite store and a recording stand-in for the chat platform.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use fixembed::commands::{
    CommandHandler, CommandOptions, FOREIGN_CHANNEL, GUILD_ONLY, VERSION, VIEW_EXPIRED,
};
use fixembed::database::{Database, DatabaseOptions};
use fixembed::delivery::{Delivery, DeliveryLog};
use fixembed::guilds::GuildDirectory;
use fixembed::pipeline::{ChatOutbound, InboundMessage, MessagePipeline, PipelineOutcome};
use fixembed::retry::RetryPolicy;
use fixembed::service::{Service, ServiceSet};
use fixembed::state::StateCache;

const BOT_ID: u64 = 1;
const AUTHOR_ID: u64 = 42;
const GUILD_ID: u64 = 500;
const CHANNEL_ID: u64 = 20;

/// Records every outbound call. Sends fail once `fail_sends_after` replies
/// have gone out; deletes fail while `fail_delete` is set.
struct RecordingOutbound {
    sent: Mutex<Vec<(u64, String)>>,
    deleted: Mutex<Vec<(u64, u64)>>,
    fail_sends_after: AtomicUsize,
    fail_delete: AtomicBool,
}

impl RecordingOutbound {
    fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            fail_sends_after: AtomicUsize::new(usize::MAX),
            fail_delete: AtomicBool::new(false),
        }
    }

    fn sent(&self) -> Vec<(u64, String)> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, text)| text).collect()
    }

    fn last_reply(&self) -> String {
        self.sent_texts().pop().expect("no message was sent")
    }

    fn deleted(&self) -> Vec<(u64, u64)> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatOutbound for RecordingOutbound {
    async fn send_message(&self, channel_id: u64, content: &str) -> Result<()> {
        let mut sent = self.sent.lock().unwrap();
        if sent.len() >= self.fail_sends_after.load(Ordering::SeqCst) {
            return Err(anyhow!("Failed to send message: 403 Forbidden"));
        }
        sent.push((channel_id, content.to_string()));
        Ok(())
    }

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(anyhow!("Failed to delete message: 403 Forbidden"));
        }
        self.deleted.lock().unwrap().push((channel_id, message_id));
        Ok(())
    }

    fn is_permission_denied(&self, error: &anyhow::Error) -> bool {
        error.to_string().contains("403")
    }
}

struct Harness {
    _dir: TempDir,
    db_path: String,
    state: Arc<StateCache>,
    guilds: Arc<GuildDirectory>,
    outbound: Arc<RecordingOutbound>,
    delivery: Arc<DeliveryLog>,
    pipeline: MessagePipeline,
    commands: CommandHandler,
}

async fn harness_with_timeout(view_timeout: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fixembed_data.db").to_string_lossy().into_owned();
    let db = Database::connect(&DatabaseOptions {
        path: db_path.clone(),
        pool_size: 2,
        busy_timeout: Duration::from_secs(1),
        retry: RetryPolicy::default(),
    })
    .await
    .unwrap();

    let state = Arc::new(StateCache::load(Arc::new(db)).await.unwrap());
    let guilds = Arc::new(GuildDirectory::new());
    guilds.register(GUILD_ID, vec![CHANNEL_ID, 21, 22]);
    state.seed_channels([CHANNEL_ID, 21, 22]);

    let outbound = Arc::new(RecordingOutbound::new());
    let pipeline = MessagePipeline::new(state.clone(), outbound.clone(), BOT_ID);
    let delivery = pipeline.delivery_log();
    let commands = CommandHandler::new(
        state.clone(),
        guilds.clone(),
        outbound.clone(),
        delivery.clone(),
        CommandOptions {
            prefix: "!fixembed".into(),
            view_timeout,
            shard_count: 1,
        },
    );

    Harness {
        _dir: dir,
        db_path,
        state,
        guilds,
        outbound,
        delivery,
        pipeline,
        commands,
    }
}

async fn harness() -> Harness {
    harness_with_timeout(Duration::from_secs(180)).await
}

fn message(text: &str) -> InboundMessage {
    InboundMessage {
        message_id: 9000,
        author_id: AUTHOR_ID,
        channel_id: CHANNEL_ID,
        guild_id: Some(GUILD_ID),
        text: text.to_string(),
    }
}

mod pipeline {
    use super::*;

    #[tokio::test]
    async fn test_links_are_replaced_and_original_deleted() {
        let h = harness().await;
        let msg = message(
            "look https://twitter.com/alice/status/123 and https://www.reddit.com/r/rust/comments/abc/title",
        );

        let outcome = h.pipeline.handle(&msg).await;

        assert_eq!(
            outcome,
            PipelineOutcome::Rewritten {
                replies: 2,
                original_deleted: true
            }
        );
        assert_eq!(
            h.outbound.sent(),
            vec![
                (
                    CHANNEL_ID,
                    "[Twitter • alice](https://fxtwitter.com/alice/status/123) | Sent by <@42>".to_string()
                ),
                (
                    CHANNEL_ID,
                    "[Reddit • rust](https://rxddit.com/r/rust/comments/abc/title) | Sent by <@42>".to_string()
                ),
            ]
        );
        assert_eq!(h.outbound.deleted(), vec![(CHANNEL_ID, 9000)]);
    }

    #[tokio::test]
    async fn test_message_without_links_is_left_alone() {
        let h = harness().await;

        let outcome = h.pipeline.handle(&message("just chatting, twitter.com is down")).await;

        assert_eq!(outcome, PipelineOutcome::NoEligibleLinks);
        assert!(h.outbound.sent().is_empty());
        assert!(h.outbound.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_channel_is_skipped() {
        let h = harness().await;
        h.state.set_channel_enabled(CHANNEL_ID, false).await.unwrap();

        let outcome = h.pipeline.handle(&message("https://twitter.com/alice/status/1")).await;

        assert_eq!(outcome, PipelineOutcome::ChannelDisabled);
        assert!(h.outbound.sent().is_empty());
        assert!(h.outbound.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_service_is_skipped() {
        let h = harness().await;
        h.state
            .set_enabled_services([Service::Reddit].into_iter().collect())
            .await
            .unwrap();

        let outcome = h.pipeline.handle(&message("https://twitter.com/alice/status/1")).await;

        assert_eq!(outcome, PipelineOutcome::NoEligibleLinks);
        assert!(h.outbound.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_own_messages_are_ignored() {
        let h = harness().await;
        let mut msg = message("[Twitter • a](https://twitter.com/a/status/1) | Sent by <@42>");
        msg.author_id = BOT_ID;

        assert_eq!(h.pipeline.handle(&msg).await, PipelineOutcome::OwnMessage);
        assert!(h.outbound.sent().is_empty());
    }

    #[tokio::test]
    async fn test_message_from_another_bot_is_rewritten() {
        let h = harness().await;
        let mut msg = message("https://twitter.com/alice/status/5");
        msg.author_id = 77;

        let outcome = h.pipeline.handle(&msg).await;

        assert_eq!(
            outcome,
            PipelineOutcome::Rewritten {
                replies: 1,
                original_deleted: true
            }
        );
        assert_eq!(
            h.outbound.sent_texts(),
            vec!["[Twitter • alice](https://fxtwitter.com/alice/status/5) | Sent by <@77>".to_string()]
        );
    }

    #[tokio::test]
    async fn test_send_failure_keeps_original() {
        let h = harness().await;
        h.outbound.fail_sends_after.store(0, Ordering::SeqCst);

        let outcome = h.pipeline.handle(&message("https://twitter.com/alice/status/1")).await;

        assert_eq!(outcome, PipelineOutcome::SendFailed { replies_sent: 0 });
        assert!(h.outbound.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_midway_stops_processing() {
        let h = harness().await;
        h.outbound.fail_sends_after.store(1, Ordering::SeqCst);

        let outcome = h
            .pipeline
            .handle(&message(
                "https://twitter.com/a/status/1 https://instagram.com/p/xyz https://tiktok.com/t/abc",
            ))
            .await;

        assert_eq!(outcome, PipelineOutcome::SendFailed { replies_sent: 1 });
        assert_eq!(h.outbound.sent().len(), 1);
        assert!(h.outbound.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_delete_failure_is_tolerated() {
        let h = harness().await;
        h.outbound.fail_delete.store(true, Ordering::SeqCst);

        let outcome = h.pipeline.handle(&message("https://x.com/bob/status/7")).await;

        assert_eq!(
            outcome,
            PipelineOutcome::Rewritten {
                replies: 1,
                original_deleted: false
            }
        );
        assert_eq!(
            h.outbound.sent_texts(),
            vec!["[Twitter • bob](https://fixupx.com/bob/status/7) | Sent by <@42>".to_string()]
        );
        assert_eq!(h.delivery.get(CHANNEL_ID).send, Some(Delivery::Ok));
        assert_eq!(h.delivery.get(CHANNEL_ID).delete, Some(Delivery::Denied));
    }

    #[tokio::test]
    async fn test_refused_send_is_recorded_per_channel() {
        let h = harness().await;
        h.outbound.fail_sends_after.store(0, Ordering::SeqCst);

        h.pipeline.handle(&message("https://twitter.com/alice/status/1")).await;

        assert_eq!(h.delivery.get(CHANNEL_ID).send, Some(Delivery::Denied));
        assert_eq!(h.delivery.get(CHANNEL_ID).delete, None);
        assert_eq!(h.delivery.get(21).send, None);
    }

    #[tokio::test]
    async fn test_concurrent_messages_are_independent() {
        let h = Arc::new(harness().await);
        let mut handles = Vec::new();
        for i in 0..10u64 {
            let h = h.clone();
            handles.push(tokio::spawn(async move {
                let mut msg = message(&format!("https://twitter.com/user{i}/status/{i}"));
                msg.message_id = i;
                h.pipeline.handle(&msg).await
            }));
        }
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                PipelineOutcome::Rewritten { replies: 1, original_deleted: true }
            ));
        }
        assert_eq!(h.outbound.sent().len(), 10);
        assert_eq!(h.outbound.deleted().len(), 10);
    }
}

mod commands {
    use super::*;

    #[tokio::test]
    async fn test_plain_messages_are_not_consumed() {
        let h = harness().await;
        assert!(!h.commands.handle(&message("https://twitter.com/a/status/1")).await);
        assert!(h.outbound.sent().is_empty());
    }

    #[tokio::test]
    async fn test_disable_then_enable_current_channel() {
        let h = harness().await;

        assert!(h.commands.handle(&message("!fixembed disable")).await);
        assert_eq!(h.outbound.last_reply(), format!("❎ Disabled for <#{CHANNEL_ID}>!"));
        assert!(!h.state.is_channel_enabled(CHANNEL_ID));
        assert_eq!(
            h.pipeline.handle(&message("https://twitter.com/a/status/1")).await,
            PipelineOutcome::ChannelDisabled
        );

        assert!(h.commands.handle(&message("!fixembed enable")).await);
        assert_eq!(h.outbound.last_reply(), format!("✅ Enabled for <#{CHANNEL_ID}>!"));
        assert!(h.state.is_channel_enabled(CHANNEL_ID));
    }

    #[tokio::test]
    async fn test_disable_mentioned_channel_persists() {
        let h = harness().await;

        h.commands.handle(&message("!fixembed disable <#21>")).await;

        assert_eq!(h.outbound.last_reply(), "❎ Disabled for <#21>!");
        assert!(h.state.is_channel_enabled(CHANNEL_ID));

        // A fresh cache over the same file sees the change
        let db = Database::connect(&DatabaseOptions {
            path: h.db_path.clone(),
            pool_size: 1,
            busy_timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        })
        .await
        .unwrap();
        let reloaded = StateCache::load(Arc::new(db)).await.unwrap();
        assert!(!reloaded.is_channel_enabled(21));
    }

    #[tokio::test]
    async fn test_channel_of_another_guild_is_rejected() {
        let h = harness().await;
        h.guilds.register(9999, vec![777]);
        h.state.seed_channels([777]);

        h.commands.handle(&message("!fixembed disable 777")).await;

        assert_eq!(h.outbound.last_reply(), FOREIGN_CHANNEL);
        assert!(h.state.is_channel_enabled(777));

        h.commands.handle(&message("!fixembed enable <#12345>")).await;
        assert_eq!(h.outbound.last_reply(), FOREIGN_CHANNEL);
    }

    #[tokio::test]
    async fn test_direct_message_can_only_target_itself() {
        let h = harness().await;
        let mut msg = message("!fixembed disable <#21>");
        msg.channel_id = 600;
        msg.guild_id = None;

        h.commands.handle(&msg).await;
        assert_eq!(h.outbound.last_reply(), FOREIGN_CHANNEL);
        assert!(h.state.is_channel_enabled(21));

        msg.text = "!fixembed disable".into();
        h.commands.handle(&msg).await;
        assert_eq!(h.outbound.last_reply(), "❎ Disabled for <#600>!");
        assert!(!h.state.is_channel_enabled(600));
    }

    #[tokio::test]
    async fn test_channel_created_later_joins_guild_toggle() {
        let h = harness().await;
        assert!(h.guilds.add_channel(GUILD_ID, 23));

        h.commands.handle(&message("!fixembed disable <#23>")).await;
        assert_eq!(h.outbound.last_reply(), "❎ Disabled for <#23>!");

        h.commands.handle(&message("!fixembed settings")).await;
        h.commands.handle(&message("!fixembed toggle")).await;
        assert!(h.state.all_enabled(&h.guilds.channels(GUILD_ID)));
        assert!(h.state.is_channel_enabled(23));

        h.guilds.remove_channel(GUILD_ID, 23);
        h.commands.handle(&message("!fixembed enable <#23>")).await;
        assert_eq!(h.outbound.last_reply(), FOREIGN_CHANNEL);
    }

    #[tokio::test]
    async fn test_services_command_filters_rewrites() {
        let h = harness().await;

        h.commands.handle(&message("!fixembed services reddit")).await;

        let reply = h.outbound.last_reply();
        assert!(reply.contains("🔴 Twitter"), "{reply}");
        assert!(reply.contains("🟢 Reddit"), "{reply}");
        assert_eq!(
            h.state.enabled_services(),
            [Service::Reddit].into_iter().collect::<ServiceSet>()
        );
        assert_eq!(
            h.pipeline.handle(&message("https://twitter.com/a/status/1")).await,
            PipelineOutcome::NoEligibleLinks
        );

        h.commands.handle(&message("!fixembed services all")).await;
        assert_eq!(h.state.enabled_services(), ServiceSet::all());
    }

    #[tokio::test]
    async fn test_bad_services_leave_setting_unchanged() {
        let h = harness().await;

        h.commands.handle(&message("!fixembed services twitter myspace")).await;

        let reply = h.outbound.last_reply();
        assert!(reply.contains("unknown service"), "{reply}");
        assert_eq!(h.state.enabled_services(), ServiceSet::all());
    }

    #[tokio::test]
    async fn test_settings_then_toggle_flips_guild() {
        let h = harness().await;

        h.commands.handle(&message("!fixembed settings")).await;
        assert!(h.outbound.last_reply().contains("🟢 FixEmbed enabled"));

        h.commands.handle(&message("!fixembed toggle")).await;
        assert!(h.outbound.last_reply().contains("🔴 FixEmbed disabled"));
        for channel in h.guilds.channels(GUILD_ID) {
            assert!(!h.state.is_channel_enabled(channel));
        }

        h.commands.handle(&message("!fixembed toggle")).await;
        assert!(h.outbound.last_reply().contains("🟢 FixEmbed enabled"));
        assert!(h.state.all_enabled(&h.guilds.channels(GUILD_ID)));
    }

    #[tokio::test]
    async fn test_toggle_without_view_reports_expiry() {
        let h = harness().await;

        h.commands.handle(&message("!fixembed toggle")).await;

        assert_eq!(h.outbound.last_reply(), VIEW_EXPIRED);
        assert!(h.state.all_enabled(&h.guilds.channels(GUILD_ID)));
    }

    #[tokio::test]
    async fn test_expired_view_does_not_mutate() {
        let h = harness_with_timeout(Duration::ZERO).await;

        h.commands.handle(&message("!fixembed settings")).await;
        h.commands.handle(&message("!fixembed toggle")).await;

        assert_eq!(h.outbound.last_reply(), VIEW_EXPIRED);
        assert!(h.state.all_enabled(&h.guilds.channels(GUILD_ID)));

        // Direct toggles still work after the view is gone
        h.commands.handle(&message("!fixembed disable")).await;
        assert!(!h.state.is_channel_enabled(CHANNEL_ID));
    }

    #[tokio::test]
    async fn test_guild_commands_outside_guild() {
        let h = harness().await;
        let mut msg = message("!fixembed settings");
        msg.guild_id = None;

        h.commands.handle(&msg).await;

        assert_eq!(h.outbound.last_reply(), GUILD_ONLY);
    }

    #[tokio::test]
    async fn test_debug_reports_status_and_version() {
        let h = harness().await;
        h.state.set_channel_enabled(22, false).await.unwrap();

        h.commands.handle(&message("!fixembed debug")).await;

        let reply = h.outbound.last_reply();
        assert!(reply.contains(&format!("🟢 **FixEmbed working in** <#{CHANNEL_ID}>")), "{reply}");
        assert!(reply.contains("Status: Disabled"), "{reply}");
        assert!(reply.contains("Shard: 1"), "{reply}");
        assert!(reply.contains(&format!("Version: {VERSION}")), "{reply}");
        assert!(reply.contains("⚪ Manage messages permission"), "{reply}");
    }

    #[tokio::test]
    async fn test_debug_reports_refused_delete() {
        let h = harness().await;
        h.outbound.fail_delete.store(true, Ordering::SeqCst);
        h.pipeline.handle(&message("https://twitter.com/alice/status/1")).await;

        h.commands.handle(&message("!fixembed debug")).await;

        let reply = h.outbound.last_reply();
        assert!(reply.contains("🟢 Send message permission"), "{reply}");
        assert!(
            reply.contains("🔴 Manage messages permission (missing, last attempt was refused)"),
            "{reply}"
        );
    }

    #[tokio::test]
    async fn test_unknown_command_shows_usage() {
        let h = harness().await;

        assert!(h.commands.handle(&message("!fixembed frobnicate")).await);

        let reply = h.outbound.last_reply();
        assert!(reply.contains("unknown command `frobnicate`"), "{reply}");
        assert!(reply.contains("**Usage:**"), "{reply}");
    }

    #[tokio::test]
    async fn test_about() {
        let h = harness().await;

        h.commands.handle(&message("!fixembed about")).await;

        assert!(h.outbound.last_reply().contains("fixes the lack of embed support"));
    }
}
