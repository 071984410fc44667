//! Reconciliation loop: polls every subscribed gateway, evaluates it against
//! the default threshold, persists the result, and notifies subscribers when
//! the verdict flips.
//!
//! ## Per-gateway state machine
//!
//! ```text
//! Unobserved ──[first evaluation]──▶ Observed(online) ◀──[flip]──▶ Observed(offline)
//!                 (no notification)                  (notify subscribers)
//! ```
//!
//! The observed verdicts live only in memory, so every restart begins with
//! all gateways unobserved. A first observation is persisted but never
//! announced, and nothing is announced until the first full sweep has
//! completed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::db::{ChatId, Db, GatewayStateRecord};
use crate::error::FetchError;
use crate::notify::{DeliveryReport, NotificationDispatcher};
use crate::render;
use crate::source::{fetch_snapshot, DataSource, GatewaySnapshot};
use crate::state::{CycleSummary, SharedState};
use crate::status::{self, Evaluation, ThresholdMinutes};

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    /// Threshold used for the loop's own verdicts and persistence.
    pub default_threshold: ThresholdMinutes,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(10),
            default_threshold: ThresholdMinutes::DEFAULT,
        }
    }
}

/// What happened to one gateway in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayOutcome {
    /// Fetch failed or timed out; nothing was changed.
    Skipped,
    /// First observation in this process; persisted, not announced.
    FirstObservation { online: bool },
    Unchanged { online: bool },
    /// Verdict flipped. `report` is `None` while the initial poll suppresses
    /// notifications.
    Transition {
        online: bool,
        report: Option<DeliveryReport>,
    },
}

pub struct Reconciler {
    db: Db,
    source: Arc<dyn DataSource>,
    dispatcher: NotificationDispatcher,
    shared: SharedState,
    settings: ReconcilerSettings,
    /// Verdict per gateway as of the previous cycle.
    last_verdicts: HashMap<String, bool>,
    /// True until the first full sweep completes.
    initial_poll: bool,
}

impl Reconciler {
    pub fn new(
        db: Db,
        source: Arc<dyn DataSource>,
        dispatcher: NotificationDispatcher,
        shared: SharedState,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            db,
            source,
            dispatcher,
            shared,
            settings,
            last_verdicts: HashMap::new(),
            initial_poll: true,
        }
    }

    /// Start in the given initial-poll state instead of the default
    /// (suppressed until the first sweep).
    #[cfg(test)]
    pub fn with_initial_poll(mut self, initial_poll: bool) -> Self {
        self.initial_poll = initial_poll;
        self
    }

    #[cfg(test)]
    pub fn is_initial_poll(&self) -> bool {
        self.initial_poll
    }

    #[cfg(test)]
    pub fn last_verdict(&self, gateway_id: &str) -> Option<bool> {
        self.last_verdicts.get(gateway_id).copied()
    }

    /// Run until `shutdown` flips to `true`. Intended to be `tokio::spawn`-ed
    /// from main.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_sec = self.settings.poll_interval.as_secs(),
            fetch_timeout_sec = self.settings.fetch_timeout.as_secs(),
            default_threshold_min = self.settings.default_threshold.minutes(),
            "reconciler started"
        );
        self.shared
            .write()
            .await
            .record_system("reconciler started".to_string());

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.sweep(Some(&shutdown)).await;

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    // A dropped sender means nobody can ask us to stop anymore.
                    if changed.is_err() {
                        warn!("reconciler: shutdown channel closed, stopping");
                        break;
                    }
                }
            }
        }

        info!("reconciler stopped");
    }

    /// One full pass over all subscribed gateways.
    #[cfg(test)]
    pub async fn run_cycle(&mut self) -> CycleSummary {
        self.sweep(None).await
    }

    async fn sweep(&mut self, shutdown: Option<&watch::Receiver<bool>>) -> CycleSummary {
        let mut summary = CycleSummary::default();

        let gateway_ids = match self.db.subscribed_gateway_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                error!("reconciler: subscribed_gateway_ids failed: {e:#}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("subscription lookup failed: {e}"));
                return summary;
            }
        };

        // A gateway that lost all subscribers starts over as unobserved.
        self.last_verdicts
            .retain(|id, _| gateway_ids.iter().any(|g| g == id));

        for gateway_id in &gateway_ids {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                info!("reconciler: stop requested mid-cycle");
                return summary;
            }

            summary.gateways += 1;
            match self.reconcile_gateway(gateway_id).await {
                GatewayOutcome::Skipped => summary.fetch_failures += 1,
                GatewayOutcome::Transition { report, .. } => {
                    summary.transitions += 1;
                    if let Some(report) = report {
                        summary.notifications_sent += report.delivered.len();
                        summary.notifications_failed += report.failed.len();
                    }
                }
                GatewayOutcome::FirstObservation { .. } | GatewayOutcome::Unchanged { .. } => {}
            }
        }

        if self.initial_poll {
            info!(gateways = gateway_ids.len(), "initial poll complete");
            self.initial_poll = false;
        }

        summary.finished_at = Some(OffsetDateTime::now_utc());
        self.shared.write().await.record_cycle(summary.clone());
        summary
    }

    /// Fetch, evaluate, maybe notify, then persist a single gateway.
    pub async fn reconcile_gateway(&mut self, gateway_id: &str) -> GatewayOutcome {
        let snapshot =
            match fetch_snapshot(self.source.as_ref(), gateway_id, self.settings.fetch_timeout).await {
                Ok(s) => s,
                Err(e) => {
                    self.log_fetch_failure(gateway_id, &e).await;
                    return GatewayOutcome::Skipped;
                }
            };

        let now = OffsetDateTime::now_utc();
        let eval = status::evaluate_at(
            &snapshot.gateway.devices,
            &snapshot.readings,
            self.settings.default_threshold,
            now,
        );

        let previous = self.last_verdicts.insert(gateway_id.to_string(), eval.online);
        let outcome = match previous {
            None => GatewayOutcome::FirstObservation { online: eval.online },
            Some(prev) if prev == eval.online => GatewayOutcome::Unchanged { online: eval.online },
            Some(_) => {
                info!(
                    gateway = %gateway_id,
                    online = eval.online,
                    suppressed = self.initial_poll,
                    "gateway status changed"
                );
                self.shared
                    .write()
                    .await
                    .record_transition(gateway_id, eval.online);

                let report = if self.initial_poll {
                    None
                } else {
                    let message = render::status_message(
                        &snapshot,
                        &eval,
                        self.settings.default_threshold,
                        now,
                    );
                    Some(self.dispatcher.fan_out(gateway_id, &message).await)
                };
                GatewayOutcome::Transition {
                    online: eval.online,
                    report,
                }
            }
        };

        self.persist(gateway_id, &snapshot, &eval, now).await;
        outcome
    }

    async fn persist(
        &self,
        gateway_id: &str,
        snapshot: &GatewaySnapshot,
        eval: &Evaluation,
        now: OffsetDateTime,
    ) {
        let record = GatewayStateRecord {
            gateway_id: gateway_id.to_string(),
            name: snapshot.gateway.name.clone(),
            online: eval.online,
            last_seen: eval.last_seen.unwrap_or(now),
            status_factors: status::status_factors(snapshot),
            last_updated: OffsetDateTime::now_utc(),
        };

        if let Err(e) = self.db.upsert_gateway_status(&record).await {
            error!(gateway = %gateway_id, "reconciler: upsert_gateway_status failed: {e:#}");
            self.shared
                .write()
                .await
                .record_error(format!("{gateway_id}: persist failed: {e}"));
        }
    }

    async fn log_fetch_failure(&self, gateway_id: &str, e: &FetchError) {
        warn!(gateway = %gateway_id, "reconciler: fetch failed, skipping this cycle: {e}");
        self.shared
            .write()
            .await
            .record_fetch_failure(gateway_id, &e.to_string());
    }
}

// ---------------------------------------------------------------------------
// On-demand status
// ---------------------------------------------------------------------------

/// Freshly fetched status of one gateway, evaluated with a specific
/// subscriber's threshold.
#[derive(Debug, Clone)]
pub struct SubscriberStatus {
    pub snapshot: GatewaySnapshot,
    pub evaluation: Evaluation,
    pub threshold: ThresholdMinutes,
    pub evaluated_at: OffsetDateTime,
}

impl SubscriberStatus {
    pub fn message(&self) -> String {
        render::status_message(&self.snapshot, &self.evaluation, self.threshold, self.evaluated_at)
    }
}

/// Re-fetch and re-evaluate a gateway for one subscriber. Never reads or
/// writes the persisted default-threshold verdict.
pub async fn check_for_subscriber(
    db: &Db,
    source: &dyn DataSource,
    chat_id: ChatId,
    gateway_id: &str,
    fetch_timeout: Duration,
) -> anyhow::Result<Result<SubscriberStatus, FetchError>> {
    let threshold = db.get_threshold(chat_id).await?;
    let snapshot = match fetch_snapshot(source, gateway_id, fetch_timeout).await {
        Ok(s) => s,
        Err(e) => return Ok(Err(e)),
    };

    let evaluation = status::evaluate(&snapshot.gateway.devices, &snapshot.readings, threshold);
    Ok(Ok(SubscriberStatus {
        snapshot,
        evaluation,
        threshold,
        evaluated_at: OffsetDateTime::now_utc(),
    }))
}

// ===========================================================================
// Tests
// ===========================================================================
