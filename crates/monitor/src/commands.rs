//! Chat command parsing and handling. Every reply is MarkdownV2.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::db::{ChatId, Db, SubscribeOutcome, UnsubscribeOutcome};
use crate::error::{FetchError, ValidationError};
use crate::notify::Notifier;
use crate::reconciler::check_for_subscriber;
use crate::render::{escape_code, escape_markdown, minutes_phrase};
use crate::source::DataSource;
use crate::status::ThresholdMinutes;

/// How many gateways `/stats` lists.
const TOP_GATEWAYS: usize = 5;

const WELCOME: &str = "👋 *Welcome to Srcful Monitor\\!*\n\n\
I help you track gateway status and send notifications\\.\n\n\
*Quick Start:*\n\
• /status \\- Check gateways\n\
• /subscribe \\- Add gateway\n\
• /help \\- More info\n\n\
Start by using /subscribe with your gateway ID\\!";

const HELP: &str = "📚 *Srcful Gateway Monitor Help*\n\n\
*Commands:*\n\
• /status \\- Shows gateway status\n\
• /subscribe \\- Monitor a gateway\n\
• /unsubscribe \\- Stop monitoring\n\
• /threshold \\- Show or set your offline threshold\n\
• /stats \\- Show bot statistics\n\
• /help \\- Show this help\n\n\
*Status Information:*\n\
• 🟢 Online \\- Recent data available\n\
• 🔴 Offline \\- No recent data\n\n\
*Example:*\n\
To monitor a gateway:\n\
`/subscribe 01233d032a7c838bee`";

const NOT_UNDERSTOOD: &str = "I'm not sure what you mean\\. \
You can ask me about gateway status or your subscriptions\\.";

const NO_SUBSCRIPTIONS: &str = "❗️ You haven't subscribed to any gateways yet\\.\n\
Use /subscribe with a gateway ID to start monitoring\\.";

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Status,
    Subscribe(Option<String>),
    Unsubscribe(Option<String>),
    Threshold(Option<String>),
    Stats,
    /// Unknown slash command.
    Unknown(String),
    /// Free text that matched no keyword.
    Unrecognized,
}

/// Parse a message. Slash commands take at most one argument; a
/// `/cmd@botname` suffix is ignored. Free text is matched on keywords.
pub fn parse(text: &str) -> Command {
    let text = text.trim();
    let Some(rest) = text.strip_prefix('/') else {
        return parse_intent(text);
    };

    let mut parts = rest.split_whitespace();
    let name = parts
        .next()
        .unwrap_or_default()
        .split('@')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let arg = parts.next().map(str::to_string);

    match name.as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "status" => Command::Status,
        "subscribe" => Command::Subscribe(arg),
        "unsubscribe" => Command::Unsubscribe(arg),
        "threshold" => Command::Threshold(arg),
        "stats" => Command::Stats,
        _ => Command::Unknown(name),
    }
}

fn parse_intent(text: &str) -> Command {
    let lower = text.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if has(&["status", "online", "offline", "working"]) {
        Command::Status
    } else if has(&["subscription", "subscribed", "my gateways", "following"]) {
        Command::Unsubscribe(None)
    } else if has(&["help", "hello", "commands"]) || lower == "hi" {
        Command::Help
    } else {
        Command::Unrecognized
    }
}

// ---------------------------------------------------------------------------
// Handling
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CommandRouter {
    db: Db,
    source: Arc<dyn DataSource>,
    fetch_timeout: Duration,
}

impl CommandRouter {
    pub fn new(db: Db, source: Arc<dyn DataSource>, fetch_timeout: Duration) -> Self {
        Self {
            db,
            source,
            fetch_timeout,
        }
    }

    /// Handle one inbound message from `chat_id`, replying through `reply`.
    pub async fn handle(&self, chat_id: ChatId, text: &str, reply: &dyn Notifier) -> Result<()> {
        self.db.ensure_user(chat_id).await?;

        let command = parse(text);
        info!(chat_id, ?command, "command received");

        match command {
            Command::Start => reply.send(chat_id, WELCOME).await,
            Command::Help => reply.send(chat_id, HELP).await,
            Command::Status => self.status(chat_id, reply).await,
            Command::Subscribe(arg) => self.subscribe(chat_id, arg.as_deref(), reply).await,
            Command::Unsubscribe(arg) => self.unsubscribe(chat_id, arg.as_deref(), reply).await,
            Command::Threshold(arg) => self.threshold(chat_id, arg.as_deref(), reply).await,
            Command::Stats => self.stats(chat_id, reply).await,
            Command::Unknown(_) => reply.send(chat_id, HELP).await,
            Command::Unrecognized => {
                reply
                    .send(chat_id, &format!("{NOT_UNDERSTOOD}\n\n{HELP}"))
                    .await
            }
        }
    }

    async fn status(&self, chat_id: ChatId, reply: &dyn Notifier) -> Result<()> {
        let gateways = self.db.list_subscriptions(chat_id).await?;
        if gateways.is_empty() {
            return reply.send(chat_id, NO_SUBSCRIPTIONS).await;
        }

        reply
            .send(chat_id, "🔍 Fetching gateway status\\.\\.\\.")
            .await?;

        for gateway_id in &gateways {
            let message = match check_for_subscriber(
                &self.db,
                self.source.as_ref(),
                chat_id,
                gateway_id,
                self.fetch_timeout,
            )
            .await?
            {
                Ok(status) => status.message(),
                Err(e) => {
                    warn!(gateway = %gateway_id, chat_id, "status: fetch failed: {e}");
                    format!(
                        "❌ Failed to fetch status for gateway `{}`",
                        escape_code(gateway_id)
                    )
                }
            };
            reply.send(chat_id, &message).await?;
        }
        Ok(())
    }

    async fn subscribe(&self, chat_id: ChatId, arg: Option<&str>, reply: &dyn Notifier) -> Result<()> {
        let Some(gateway_id) = arg else {
            return reply
                .send(
                    chat_id,
                    "❗️ Please provide a gateway ID\\.\nExample: `/subscribe 01233d032a7c838bee`",
                )
                .await;
        };

        let lookup = tokio::time::timeout(self.fetch_timeout, self.source.fetch_gateway(gateway_id))
            .await
            .unwrap_or(Err(FetchError::Timeout(self.fetch_timeout)));

        let gateway = match lookup {
            Ok(Some(gw)) => gw,
            Ok(None) | Err(FetchError::NotFound(_)) | Err(FetchError::Api(_)) => {
                return reply
                    .send(
                        chat_id,
                        "❌ Invalid gateway ID or gateway not found\\.\n\
                         Please check the ID and try again\\.",
                    )
                    .await;
            }
            Err(e) => {
                warn!(gateway = %gateway_id, chat_id, "subscribe: lookup failed: {e}");
                return reply
                    .send(
                        chat_id,
                        "⚠️ Could not reach the data source right now\\. Please try again later\\.",
                    )
                    .await;
            }
        };

        let text = match self.db.add_subscription(chat_id, gateway_id).await? {
            SubscribeOutcome::Added => {
                info!(gateway = %gateway_id, chat_id, "subscription added");
                format!(
                    "✅ Successfully subscribed to gateway:\n\
                     Name: {}\n\
                     ID: `{}`\n\n\
                     You'll receive notifications when status changes\\.\n\
                     Use /status to check current status\\.",
                    escape_markdown(&gateway.name),
                    escape_code(gateway_id)
                )
            }
            SubscribeOutcome::AlreadyExists => "You're already subscribed to this gateway\\.\n\
                 Use /status to check current status\\."
                .to_string(),
        };
        reply.send(chat_id, &text).await
    }

    async fn unsubscribe(&self, chat_id: ChatId, arg: Option<&str>, reply: &dyn Notifier) -> Result<()> {
        let Some(gateway_id) = arg else {
            return self.list_subscriptions(chat_id, reply).await;
        };

        let text = match self.db.remove_subscription(chat_id, gateway_id).await? {
            UnsubscribeOutcome::Removed => {
                info!(gateway = %gateway_id, chat_id, "subscription removed");
                "✅ Successfully unsubscribed from the gateway\\.\n\
                 You'll no longer receive notifications about its status\\."
            }
            UnsubscribeOutcome::NotFound => "❌ You were not subscribed to this gateway\\.",
        };
        reply.send(chat_id, text).await
    }

    async fn list_subscriptions(&self, chat_id: ChatId, reply: &dyn Notifier) -> Result<()> {
        let gateways = self.db.list_subscriptions(chat_id).await?;
        if gateways.is_empty() {
            return reply
                .send(
                    chat_id,
                    "❗️ You're not subscribed to any gateways\\.\n\
                     Use `/subscribe <gateway_id>` to start monitoring a gateway\\.",
                )
                .await;
        }

        let mut text = String::from("Your subscribed gateways:\n\n");
        for gateway_id in &gateways {
            let name = match self.db.get_gateway_status(gateway_id).await? {
                Some(rec) => escape_markdown(&rec.name),
                None => "_not checked yet_".to_string(),
            };
            text.push_str(&format!("• {name}\n  ID: `{}`\n\n", escape_code(gateway_id)));
        }
        text.push_str("To unsubscribe, use:\n`/unsubscribe <gateway_id>`");
        reply.send(chat_id, &text).await
    }

    async fn threshold(&self, chat_id: ChatId, arg: Option<&str>, reply: &dyn Notifier) -> Result<()> {
        let Some(raw) = arg else {
            let current = self.db.get_threshold(chat_id).await?;
            return reply
                .send(
                    chat_id,
                    &format!(
                        "⏱ Your offline threshold is {}\\.\n\
                         Use `/threshold <{}-{}>` to change it\\.",
                        minutes_phrase(current),
                        ThresholdMinutes::MIN,
                        ThresholdMinutes::MAX
                    ),
                )
                .await;
        };

        let out_of_range = format!(
            "❗️ Please provide a whole number of minutes between {} and {}\\.",
            ThresholdMinutes::MIN,
            ThresholdMinutes::MAX
        );
        let Ok(minutes) = raw.parse::<i64>() else {
            return reply.send(chat_id, &out_of_range).await;
        };

        match self.db.set_threshold(chat_id, minutes).await {
            Ok(threshold) => {
                info!(chat_id, minutes = threshold.minutes(), "threshold updated");
                reply
                    .send(
                        chat_id,
                        &format!("✅ Offline threshold set to {}\\.", minutes_phrase(threshold)),
                    )
                    .await
            }
            Err(e) if e.downcast_ref::<ValidationError>().is_some() => {
                reply.send(chat_id, &out_of_range).await
            }
            Err(e) => Err(e),
        }
    }

    async fn stats(&self, chat_id: ChatId, reply: &dyn Notifier) -> Result<()> {
        let total_users = self.db.count_users().await?;
        let gateways = self.db.subscription_stats().await?;

        let mut parts = vec![
            "*Sourceful Bot Statistics*".to_string(),
            format!("Total Users: `{total_users}`"),
            format!("Monitored Gateways: `{}`", gateways.len()),
            String::new(),
            "*Most Monitored Gateways:*".to_string(),
        ];
        for gw in gateways.iter().take(TOP_GATEWAYS) {
            let name = escape_markdown(gw.name.as_deref().unwrap_or(&gw.gateway_id));
            parts.push(format!("• {name}\n  Subscribers: `{}`", gw.subscriber_count));
        }
        reply.send(chat_id, &parts.join("\n")).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use crate::notify::tests::RecordingNotifier;
    use crate::source::tests::FakeSource;
    use crate::timestamp::{format_instant, RawTimestamp};
    use time::OffsetDateTime;

    fn minutes_ago(m: i64) -> RawTimestamp {
        RawTimestamp::Text(format_instant(OffsetDateTime::now_utc() - time::Duration::minutes(m)).unwrap())
    }

    async fn router(source: FakeSource) -> (CommandRouter, Db, Arc<FakeSource>) {
        let db = test_db().await;
        let source = Arc::new(source);
        let router = CommandRouter::new(db.clone(), source.clone(), Duration::from_secs(1));
        (router, db, source)
    }

    fn replies(notifier: &RecordingNotifier) -> Vec<String> {
        notifier
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parses_slash_commands() {
        assert_eq!(parse("/start"), Command::Start);
        assert_eq!(parse("  /HELP  "), Command::Help);
        assert_eq!(parse("/status@SrcfulBot"), Command::Status);
        assert_eq!(
            parse("/subscribe 0123abc extra"),
            Command::Subscribe(Some("0123abc".into()))
        );
        assert_eq!(parse("/unsubscribe"), Command::Unsubscribe(None));
        assert_eq!(parse("/threshold 15"), Command::Threshold(Some("15".into())));
        assert_eq!(parse("/stats"), Command::Stats);
        assert_eq!(parse("/frobnicate"), Command::Unknown("frobnicate".into()));
    }

    #[test]
    fn parses_free_text_intents() {
        assert_eq!(parse("is my gateway online?"), Command::Status);
        assert_eq!(parse("Show my subscriptions"), Command::Unsubscribe(None));
        assert_eq!(parse("hi"), Command::Help);
        assert_eq!(parse("what can you do, help"), Command::Help);
        assert_eq!(parse("banana"), Command::Unrecognized);
    }

    // -- Handling ---------------------------------------------------------

    #[tokio::test]
    async fn every_interaction_creates_settings_row() {
        let (router, db, _) = router(FakeSource::default()).await;
        let out = RecordingNotifier::default();
        router.handle(5, "/start", &out).await.unwrap();

        assert_eq!(db.count_users().await.unwrap(), 1);
        assert!(replies(&out)[0].contains("Welcome"));
    }

    #[tokio::test]
    async fn subscribe_verifies_gateway_exists() {
        let (router, db, _) = router(FakeSource::default().with_gateway("gw1", "Roof.1", &["a"])).await;
        let out = RecordingNotifier::default();

        router.handle(5, "/subscribe nope", &out).await.unwrap();
        assert!(db.list_subscriptions(5).await.unwrap().is_empty());

        router.handle(5, "/subscribe gw1", &out).await.unwrap();
        router.handle(5, "/subscribe gw1", &out).await.unwrap();
        assert_eq!(db.list_subscriptions(5).await.unwrap(), vec!["gw1"]);

        let r = replies(&out);
        assert!(r[0].contains("not found"));
        assert!(r[1].contains("Successfully subscribed"));
        assert!(r[1].contains("Name: Roof\\.1"));
        assert!(r[2].contains("already subscribed"));
    }

    #[tokio::test]
    async fn subscribe_without_argument_prompts() {
        let (router, db, _) = router(FakeSource::default()).await;
        let out = RecordingNotifier::default();
        router.handle(5, "/subscribe", &out).await.unwrap();
        assert!(replies(&out)[0].contains("Please provide a gateway ID"));
        assert!(db.subscribed_gateway_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribe_reports_unreachable_source() {
        let source = FakeSource::default().with_gateway("gw1", "Roof", &["a"]);
        source.fail("gw1");
        let (router, db, _) = router(source).await;
        let out = RecordingNotifier::default();

        router.handle(5, "/subscribe gw1", &out).await.unwrap();
        assert!(db.list_subscriptions(5).await.unwrap().is_empty());
        assert!(!replies(&out)[0].contains("Successfully"));
    }

    #[tokio::test]
    async fn unsubscribe_flow() {
        let (router, db, _) = router(FakeSource::default()).await;
        let out = RecordingNotifier::default();
        db.add_subscription(5, "gw1").await.unwrap();

        router.handle(5, "/unsubscribe", &out).await.unwrap();
        router.handle(5, "/unsubscribe gw1", &out).await.unwrap();
        router.handle(5, "/unsubscribe gw1", &out).await.unwrap();
        router.handle(5, "/unsubscribe", &out).await.unwrap();

        let r = replies(&out);
        assert!(r[0].contains("Your subscribed gateways"));
        assert!(r[0].contains("`gw1`"));
        assert!(r[1].contains("Successfully unsubscribed"));
        assert!(r[2].contains("not subscribed to this gateway"));
        assert!(r[3].contains("not subscribed to any gateways"));
        assert!(db.list_subscribers("gw1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_without_subscriptions() {
        let (router, _, _) = router(FakeSource::default()).await;
        let out = RecordingNotifier::default();
        router.handle(5, "/status", &out).await.unwrap();
        assert_eq!(replies(&out), vec![NO_SUBSCRIPTIONS.to_string()]);
    }

    #[tokio::test]
    async fn status_uses_callers_threshold() {
        let (router, db, source) = router(
            FakeSource::default()
                .with_gateway("gw1", "Roof", &["a"])
                .with_gateway("gw2", "Barn", &["b"]),
        )
        .await;
        source.set_reading("a", minutes_ago(2), 100.0);
        source.fail("gw2");
        db.add_subscription(5, "gw1").await.unwrap();
        db.add_subscription(5, "gw2").await.unwrap();
        db.add_subscription(6, "gw1").await.unwrap();
        db.set_threshold(6, 1).await.unwrap();

        let out5 = RecordingNotifier::default();
        router.handle(5, "/status", &out5).await.unwrap();
        let r = replies(&out5);
        assert_eq!(r.len(), 3);
        assert!(r[0].contains("Fetching"));
        assert!(r[1].contains("Status: ONLINE"));
        assert!(r[2].contains("Failed to fetch status for gateway `gw2`"));

        let out6 = RecordingNotifier::default();
        router.handle(6, "how is my gateway status", &out6).await.unwrap();
        assert!(replies(&out6)[1].contains("Status: OFFLINE"));
    }

    #[tokio::test]
    async fn threshold_show_and_set() {
        let (router, db, _) = router(FakeSource::default()).await;
        let out = RecordingNotifier::default();

        router.handle(5, "/threshold", &out).await.unwrap();
        router.handle(5, "/threshold 15", &out).await.unwrap();
        router.handle(5, "/threshold 0", &out).await.unwrap();
        router.handle(5, "/threshold soon", &out).await.unwrap();

        let r = replies(&out);
        assert!(r[0].contains("threshold is 5 minutes"));
        assert!(r[1].contains("set to 15 minutes"));
        assert!(r[2].contains("between 1 and 60"));
        assert!(r[3].contains("between 1 and 60"));
        assert_eq!(db.get_threshold(5).await.unwrap().minutes(), 15);
    }

    #[tokio::test]
    async fn one_minute_threshold_is_singular() {
        let (router, _, _) = router(FakeSource::default()).await;
        let out = RecordingNotifier::default();

        router.handle(5, "/threshold 1", &out).await.unwrap();
        router.handle(5, "/threshold", &out).await.unwrap();

        let r = replies(&out);
        assert!(r[0].contains("set to 1 minute\\."), "got: {}", r[0]);
        assert!(r[1].contains("threshold is 1 minute\\."), "got: {}", r[1]);
    }

    #[tokio::test]
    async fn stats_lists_top_gateways() {
        let (router, db, _) = router(FakeSource::default()).await;
        db.add_subscription(1, "gw_a").await.unwrap();
        db.add_subscription(2, "gw_a").await.unwrap();
        db.add_subscription(2, "gw_b").await.unwrap();

        let out = RecordingNotifier::default();
        router.handle(3, "/stats", &out).await.unwrap();

        let text = &replies(&out)[0];
        assert!(text.contains("Total Users: `3`"));
        assert!(text.contains("Monitored Gateways: `2`"));
        let a = text.find("gw\\_a").unwrap();
        let b = text.find("gw\\_b").unwrap();
        assert!(a < b);
    }

    #[tokio::test]
    async fn unknown_input_gets_help() {
        let (router, _, _) = router(FakeSource::default()).await;
        let out = RecordingNotifier::default();
        router.handle(5, "/bogus", &out).await.unwrap();
        router.handle(5, "pineapple", &out).await.unwrap();
        let r = replies(&out);
        assert_eq!(r[0], HELP);
        assert!(r[1].starts_with("I'm not sure"));
    }
}
