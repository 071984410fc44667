//! Inbound message loop: long-polls Telegram for updates and hands each text
//! message to the command router.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::commands::CommandRouter;
use crate::state::SharedState;
use crate::telegram::{TelegramClient, Update};

/// Pause after a failed `getUpdates` call before trying again.
const RETRY_DELAY: Duration = Duration::from_secs(2);

const INTERNAL_ERROR: &str = "Sorry, something went wrong\\. Please try again later\\.";

/// Run until `shutdown` flips to `true`. Intended to be `tokio::spawn`-ed
/// from main.
pub async fn run(
    client: Arc<TelegramClient>,
    router: CommandRouter,
    shared: SharedState,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("bot polling started");
    let mut offset: i64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let updates = tokio::select! {
            res = client.get_updates(offset) => res,
            _ = shutdown.changed() => break,
        };

        match updates {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    handle_update(&client, &router, &shared, update).await;
                }
            }
            Err(e) => {
                warn!("bot: getUpdates failed: {e:#}. retrying...");
                shared
                    .write()
                    .await
                    .record_error(format!("telegram polling failed: {e}"));
                sleep(RETRY_DELAY).await;
            }
        }
    }

    info!("bot polling stopped");
}

async fn handle_update(
    client: &TelegramClient,
    router: &CommandRouter,
    shared: &SharedState,
    update: Update,
) {
    let Some(message) = update.message else {
        return;
    };
    let Some(text) = message.text else {
        return;
    };
    let chat_id = message.chat.id;

    if let Err(e) = router.handle(chat_id, &text, client).await {
        error!(chat_id, "bot: command failed: {e:#}");
        shared
            .write()
            .await
            .record_error(format!("chat {chat_id}: command failed: {e}"));
        if let Err(e) = client.send_message(chat_id, INTERNAL_ERROR).await {
            warn!(chat_id, "bot: could not report failure: {e:#}");
        }
    }
}
