use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::status::{StatusFactor, ThresholdMinutes};
use crate::timestamp::{format_instant, parse_instant};

/// Subscriber identity (a chat id on the messaging transport).
pub type ChatId = i64;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Last known state of a gateway, one row per gateway id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayStateRecord {
    pub gateway_id: String,
    pub name: String,
    pub online: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub status_factors: BTreeMap<String, StatusFactor>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Added,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    Removed,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewaySubscriptionStats {
    pub gateway_id: String,
    /// Persisted name, if the gateway has been evaluated at least once.
    pub name: Option<String>,
    pub subscriber_count: i64,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/gateway-monitor/monitor.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Gateway state
    // ----------------------------

    /// Insert or refresh a gateway's state. `last_updated` never moves
    /// backwards: an older write keeps the stored value.
    pub async fn upsert_gateway_status(&self, rec: &GatewayStateRecord) -> Result<()> {
        let factors =
            serde_json::to_string(&rec.status_factors).context("serialize status_factors")?;
        sqlx::query(
            r#"
            INSERT INTO gateway_status (
              gateway_id, name, is_online, last_seen, status_factors, last_updated
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(gateway_id) DO UPDATE SET
              name=excluded.name,
              is_online=excluded.is_online,
              last_seen=excluded.last_seen,
              status_factors=excluded.status_factors,
              last_updated=MAX(gateway_status.last_updated, excluded.last_updated)
            "#,
        )
        .bind(&rec.gateway_id)
        .bind(&rec.name)
        .bind(rec.online)
        .bind(format_instant(rec.last_seen)?)
        .bind(factors)
        .bind(format_instant(rec.last_updated)?)
        .execute(&self.pool)
        .await
        .context("upsert_gateway_status failed")?;
        Ok(())
    }

    pub async fn get_gateway_status(&self, gateway_id: &str) -> Result<Option<GatewayStateRecord>> {
        let row = sqlx::query(
            r#"
            SELECT gateway_id, name, is_online, last_seen, status_factors, last_updated
            FROM gateway_status
            WHERE gateway_id = ?
            "#,
        )
        .bind(gateway_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_gateway_status failed")?;

        row.map(|r| gateway_record(&r)).transpose()
    }

    pub async fn load_gateway_statuses(&self) -> Result<Vec<GatewayStateRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT gateway_id, name, is_online, last_seen, status_factors, last_updated
            FROM gateway_status
            ORDER BY gateway_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_gateway_statuses failed")?;

        rows.iter().map(gateway_record).collect()
    }

    // ----------------------------
    // Subscriptions
    // ----------------------------

    pub async fn add_subscription(&self, chat_id: ChatId, gateway_id: &str) -> Result<SubscribeOutcome> {
        let now = format_instant(OffsetDateTime::now_utc())?;
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (chat_id, gateway_id, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(chat_id, gateway_id) DO NOTHING
            "#,
        )
        .bind(chat_id)
        .bind(gateway_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("add_subscription failed")?;

        Ok(if result.rows_affected() > 0 {
            SubscribeOutcome::Added
        } else {
            SubscribeOutcome::AlreadyExists
        })
    }

    pub async fn remove_subscription(&self, chat_id: ChatId, gateway_id: &str) -> Result<UnsubscribeOutcome> {
        let result = sqlx::query(
            r#"
            DELETE FROM subscriptions
            WHERE chat_id = ? AND gateway_id = ?
            "#,
        )
        .bind(chat_id)
        .bind(gateway_id)
        .execute(&self.pool)
        .await
        .context("remove_subscription failed")?;

        Ok(if result.rows_affected() > 0 {
            UnsubscribeOutcome::Removed
        } else {
            UnsubscribeOutcome::NotFound
        })
    }

    /// Gateways a subscriber follows, oldest subscription first.
    pub async fn list_subscriptions(&self, chat_id: ChatId) -> Result<Vec<String>> {
        sqlx::query_scalar(
            r#"
            SELECT gateway_id
            FROM subscriptions
            WHERE chat_id = ?
            ORDER BY created_at, rowid
            "#,
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await
        .context("list_subscriptions failed")
    }

    pub async fn list_subscribers(&self, gateway_id: &str) -> Result<Vec<ChatId>> {
        sqlx::query_scalar(
            r#"
            SELECT chat_id
            FROM subscriptions
            WHERE gateway_id = ?
            ORDER BY chat_id
            "#,
        )
        .bind(gateway_id)
        .fetch_all(&self.pool)
        .await
        .context("list_subscribers failed")
    }

    /// Every gateway with at least one subscriber. Nothing else is polled.
    pub async fn subscribed_gateway_ids(&self) -> Result<Vec<String>> {
        sqlx::query_scalar(
            r#"
            SELECT DISTINCT gateway_id
            FROM subscriptions
            ORDER BY gateway_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("subscribed_gateway_ids failed")
    }

    // ----------------------------
    // Subscriber settings
    // ----------------------------

    /// Create the settings row with defaults if the subscriber has none.
    pub async fn ensure_user(&self, chat_id: ChatId) -> Result<()> {
        let now = format_instant(OffsetDateTime::now_utc())?;
        sqlx::query(
            r#"
            INSERT INTO user_settings (chat_id, threshold_minutes, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chat_id) DO NOTHING
            "#,
        )
        .bind(chat_id)
        .bind(ThresholdMinutes::DEFAULT.minutes())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("ensure_user failed")?;
        Ok(())
    }

    /// The subscriber's threshold, or the default when none is stored.
    pub async fn get_threshold(&self, chat_id: ChatId) -> Result<ThresholdMinutes> {
        let stored: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT threshold_minutes
            FROM user_settings
            WHERE chat_id = ?
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_threshold failed")?;

        // Rows written outside this process could hold anything.
        Ok(stored
            .and_then(|m| ThresholdMinutes::new(m).ok())
            .unwrap_or_default())
    }

    /// Validate and store a subscriber's threshold. Out-of-range values fail
    /// with a [`crate::error::ValidationError`] and leave the row untouched.
    pub async fn set_threshold(&self, chat_id: ChatId, minutes: i64) -> Result<ThresholdMinutes> {
        let threshold = ThresholdMinutes::new(minutes)?;
        let now = format_instant(OffsetDateTime::now_utc())?;
        sqlx::query(
            r#"
            INSERT INTO user_settings (chat_id, threshold_minutes, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chat_id) DO UPDATE SET
              threshold_minutes=excluded.threshold_minutes,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(chat_id)
        .bind(threshold.minutes())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("set_threshold failed")?;
        Ok(threshold)
    }

    // ----------------------------
    // Statistics
    // ----------------------------

    /// Distinct users known through either a subscription or a settings row.
    pub async fn count_users(&self) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM (
              SELECT chat_id FROM subscriptions
              UNION
              SELECT chat_id FROM user_settings
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("count_users failed")
    }

    /// Subscriber counts per gateway, most followed first.
    pub async fn subscription_stats(&self) -> Result<Vec<GatewaySubscriptionStats>> {
        let rows = sqlx::query(
            r#"
            SELECT s.gateway_id AS gateway_id, g.name AS name, COUNT(s.chat_id) AS subscriber_count
            FROM subscriptions s
            LEFT JOIN gateway_status g ON g.gateway_id = s.gateway_id
            GROUP BY s.gateway_id
            ORDER BY subscriber_count DESC, s.gateway_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("subscription_stats failed")?;

        rows.iter()
            .map(|r| -> Result<GatewaySubscriptionStats> {
                Ok(GatewaySubscriptionStats {
                    gateway_id: r.try_get("gateway_id")?,
                    name: r.try_get("name")?,
                    subscriber_count: r.try_get("subscriber_count")?,
                })
            })
            .collect()
    }
}

fn gateway_record(r: &sqlx::sqlite::SqliteRow) -> Result<GatewayStateRecord> {
    let factors: String = r.try_get("status_factors")?;
    let last_seen: String = r.try_get("last_seen")?;
    let last_updated: String = r.try_get("last_updated")?;
    Ok(GatewayStateRecord {
        gateway_id: r.try_get("gateway_id")?,
        name: r.try_get("name")?,
        online: r.try_get("is_online")?,
        last_seen: parse_instant(&last_seen)?,
        status_factors: serde_json::from_str(&factors).context("invalid status_factors json")?,
        last_updated: parse_instant(&last_updated)?,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
