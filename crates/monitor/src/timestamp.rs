//! Timestamp normalisation for readings reported by the data source.
//!
//! Readings arrive either as epoch milliseconds or as ISO-8601 text with a
//! variable number of fractional digits. Everything is folded into a UTC
//! `OffsetDateTime`; anything illegible becomes `None` and is simply ignored
//! by the status evaluation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::warn;

/// A reading timestamp exactly as the data source reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Millis(i64),
    FractionalMillis(f64),
    Text(String),
}

impl From<i64> for RawTimestamp {
    fn from(ms: i64) -> Self {
        RawTimestamp::Millis(ms)
    }
}

impl From<&str> for RawTimestamp {
    fn from(s: &str) -> Self {
        RawTimestamp::Text(s.to_string())
    }
}

/// Parse a raw reading timestamp into a UTC instant. Returns `None` when the
/// value cannot be interpreted.
pub fn normalize(raw: &RawTimestamp) -> Option<OffsetDateTime> {
    let parsed = match raw {
        RawTimestamp::Millis(ms) => from_millis(*ms as i128 * 1_000_000),
        RawTimestamp::FractionalMillis(ms) if ms.is_finite() => {
            from_millis((*ms * 1_000_000.0) as i128)
        }
        RawTimestamp::FractionalMillis(_) => None,
        RawTimestamp::Text(s) => parse_iso(s),
    };

    if parsed.is_none() {
        warn!(raw = ?raw, "unparseable reading timestamp");
    }
    parsed
}

fn from_millis(nanos: i128) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

fn parse_iso(raw: &str) -> Option<OffsetDateTime> {
    let s = raw.trim();
    let s = s
        .strip_suffix('Z')
        .or_else(|| s.strip_suffix('z'))
        .or_else(|| s.strip_suffix("+00:00"))
        .unwrap_or(s);

    if let Some((whole, frac)) = s.split_once('.') {
        // Exactly six fractional digits: truncate nanoseconds, pad millis.
        let micros: String = frac.chars().chain(std::iter::repeat('0')).take(6).collect();
        let candidate = format!("{whole}.{micros}");
        if let Ok(dt) = PrimitiveDateTime::parse(
            &candidate,
            format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]"),
        ) {
            return Some(dt.assume_utc());
        }
    }

    PrimitiveDateTime::parse(
        s,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    )
    .ok()
    .map(PrimitiveDateTime::assume_utc)
}

// ---------------------------------------------------------------------------
// Storage format
// ---------------------------------------------------------------------------

/// Render an instant in the fixed-width form used in the database, so that
/// text ordering matches time ordering.
pub fn format_instant(at: OffsetDateTime) -> Result<String> {
    at.to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .context("failed to format instant")
}

/// Inverse of [`format_instant`].
pub fn parse_instant(s: &str) -> Result<OffsetDateTime> {
    PrimitiveDateTime::parse(
        s,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"),
    )
    .map(PrimitiveDateTime::assume_utc)
    .with_context(|| format!("invalid stored instant: {s}"))
}

// ===========================================================================
// Tests
// ===========================================================================
