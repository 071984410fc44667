//! Notification fan-out to the subscribers of a gateway.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::db::{ChatId, Db};
use crate::state::SharedState;

/// Delivery capability of the messaging transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `text` (MarkdownV2) to one recipient.
    async fn send(&self, chat_id: ChatId, text: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: Vec<ChatId>,
    pub failed: Vec<ChatId>,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    db: Db,
    notifier: Arc<dyn Notifier>,
    shared: SharedState,
}

impl NotificationDispatcher {
    pub fn new(db: Db, notifier: Arc<dyn Notifier>, shared: SharedState) -> Self {
        Self { db, notifier, shared }
    }

    /// Send `message` to everyone subscribed to `gateway_id` right now.
    /// Failures are logged per recipient and never stop the others.
    pub async fn fan_out(&self, gateway_id: &str, message: &str) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        let subscribers = match self.db.list_subscribers(gateway_id).await {
            Ok(s) => s,
            Err(e) => {
                error!(gateway = %gateway_id, "notify: list_subscribers failed: {e:#}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("{gateway_id}: subscriber lookup failed: {e}"));
                return report;
            }
        };

        for chat_id in subscribers {
            match self.notifier.send(chat_id, message).await {
                Ok(()) => report.delivered.push(chat_id),
                Err(e) => {
                    warn!(gateway = %gateway_id, chat_id, "notify: delivery failed: {e:#}");
                    self.shared
                        .write()
                        .await
                        .record_delivery_failure(chat_id, &e.to_string());
                    report.failed.push(chat_id);
                }
            }
        }

        info!(
            gateway = %gateway_id,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "notifications dispatched"
        );
        report
    }
}

// ===========================================================================
// Tests
// ===========================================================================
