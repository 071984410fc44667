use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<MonitorState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Ephemeral process state surfaced through the status API. Nothing in here
/// feeds back into reconciliation decisions.
pub struct MonitorState {
    pub started_at: Instant,
    pub cycles_completed: u64,
    pub last_cycle: Option<CycleSummary>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub gateways: usize,
    pub fetch_failures: usize,
    pub transitions: usize,
    pub notifications_sent: usize,
    pub notifications_failed: usize,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Transition,
    Fetch,
    Delivery,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub cycles_completed: u64,
    pub last_cycle: Option<CycleSummary>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl MonitorState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            cycles_completed: 0,
            last_cycle: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a completed reconciliation cycle.
    pub fn record_cycle(&mut self, summary: CycleSummary) {
        self.cycles_completed += 1;
        self.last_cycle = Some(summary);
    }

    /// Record an online/offline transition of a gateway.
    pub fn record_transition(&mut self, gateway_id: &str, online: bool) {
        let state_str = if online { "ONLINE" } else { "OFFLINE" };
        self.push_event(EventKind::Transition, format!("{gateway_id} is {state_str}"));
    }

    pub fn record_fetch_failure(&mut self, gateway_id: &str, detail: &str) {
        self.push_event(EventKind::Fetch, format!("{gateway_id}: {detail}"));
    }

    pub fn record_delivery_failure(&mut self, chat_id: i64, detail: &str) {
        self.push_event(EventKind::Delivery, format!("chat {chat_id}: {detail}"));
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            cycles_completed: self.cycles_completed,
            last_cycle: self.last_cycle.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for MonitorState {
    fn default() -> Self {
        Self::new()
    }
}
