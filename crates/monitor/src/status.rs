//! Online/offline evaluation of a gateway from its devices' latest readings.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use time::{Duration, OffsetDateTime};

use crate::error::ValidationError;
use crate::source::{Device, GatewaySnapshot, Reading};
use crate::timestamp::{self, normalize};

/// Staleness threshold in minutes, always within `[MIN, MAX]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ThresholdMinutes(i64);

impl ThresholdMinutes {
    pub const MIN: i64 = 1;
    pub const MAX: i64 = 60;
    pub const DEFAULT: ThresholdMinutes = ThresholdMinutes(5);

    /// Rejects values outside `[1, 60]` rather than clamping them.
    pub fn new(minutes: i64) -> Result<Self, ValidationError> {
        if (Self::MIN..=Self::MAX).contains(&minutes) {
            Ok(Self(minutes))
        } else {
            Err(ValidationError::ThresholdOutOfRange {
                got: minutes,
                min: Self::MIN,
                max: Self::MAX,
            })
        }
    }

    pub fn minutes(self) -> i64 {
        self.0
    }

    pub fn as_duration(self) -> Duration {
        Duration::minutes(self.0)
    }
}

impl Default for ThresholdMinutes {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ThresholdMinutes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub online: bool,
    /// Most recent legible reading across all devices.
    pub last_seen: Option<OffsetDateTime>,
}

/// Evaluate against the current wall clock.
pub fn evaluate(
    devices: &[Device],
    readings: &HashMap<String, Reading>,
    threshold: ThresholdMinutes,
) -> Evaluation {
    evaluate_at(devices, readings, threshold, OffsetDateTime::now_utc())
}

/// Evaluate as of `now`. A gateway with no legible reading is offline; an
/// age exactly equal to the threshold still counts as online.
pub fn evaluate_at(
    devices: &[Device],
    readings: &HashMap<String, Reading>,
    threshold: ThresholdMinutes,
    now: OffsetDateTime,
) -> Evaluation {
    let last_seen = devices
        .iter()
        .filter_map(|d| d.serial.as_deref())
        .filter_map(|sn| readings.get(sn))
        .filter_map(|r| r.ts.as_ref())
        .filter_map(normalize)
        .max();

    match last_seen {
        Some(ts) => Evaluation {
            online: now - ts <= threshold.as_duration(),
            last_seen: Some(ts),
        },
        None => Evaluation {
            online: false,
            last_seen: None,
        },
    }
}

// ---------------------------------------------------------------------------
// Status factors
// ---------------------------------------------------------------------------

/// Per-device detail persisted alongside a gateway's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusFactor {
    pub power: Option<f64>,
    pub timestamp: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub der_type: Option<String>,
}

/// Status factors for every device that reported a reading with a
/// timestamp, keyed by serial. Unparseable timestamps are kept as `None`.
pub fn status_factors(snapshot: &GatewaySnapshot) -> BTreeMap<String, StatusFactor> {
    let mut factors = BTreeMap::new();
    for device in &snapshot.gateway.devices {
        let Some(sn) = device.serial.as_deref() else {
            continue;
        };
        let Some(reading) = snapshot.readings.get(sn) else {
            continue;
        };
        let Some(raw_ts) = reading.ts.as_ref() else {
            continue;
        };

        let timestamp = normalize(raw_ts).and_then(|ts| timestamp::format_instant(ts).ok());
        factors.insert(
            sn.to_string(),
            StatusFactor {
                power: reading.power,
                timestamp,
                name: device.name.clone(),
                der_type: device.der_type.clone(),
            },
        );
    }
    factors
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::gateway;
    use crate::timestamp::RawTimestamp;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00:00 UTC);

    fn reading(ts: &str) -> Reading {
        Reading {
            ts: Some(ts.into()),
            power: Some(100.0),
        }
    }

    fn readings(pairs: &[(&str, Reading)]) -> HashMap<String, Reading> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn threshold(m: i64) -> ThresholdMinutes {
        ThresholdMinutes::new(m).unwrap()
    }

    // -- ThresholdMinutes ---------------------------------------------------

    #[test]
    fn threshold_bounds_inclusive() {
        assert!(ThresholdMinutes::new(1).is_ok());
        assert!(ThresholdMinutes::new(60).is_ok());
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        assert_eq!(
            ThresholdMinutes::new(0),
            Err(ValidationError::ThresholdOutOfRange { got: 0, min: 1, max: 60 })
        );
        assert!(ThresholdMinutes::new(61).is_err());
        assert!(ThresholdMinutes::new(-5).is_err());
    }

    #[test]
    fn threshold_default_is_five() {
        assert_eq!(ThresholdMinutes::default().minutes(), 5);
    }

    // -- evaluate_at --------------------------------------------------------

    #[test]
    fn fresh_reading_is_online() {
        let gw = gateway("g", "G", &["a"]);
        let r = readings(&[("a", reading("2024-06-01T11:58:00Z"))]);
        let eval = evaluate_at(&gw.devices, &r, threshold(5), NOW);
        assert!(eval.online);
        assert_eq!(eval.last_seen, Some(datetime!(2024-06-01 11:58:00 UTC)));
    }

    #[test]
    fn age_equal_to_threshold_is_online() {
        let gw = gateway("g", "G", &["a"]);
        let r = readings(&[("a", reading("2024-06-01T11:55:00Z"))]);
        assert!(evaluate_at(&gw.devices, &r, threshold(5), NOW).online);
    }

    #[test]
    fn age_just_past_threshold_is_offline() {
        let gw = gateway("g", "G", &["a"]);
        let r = readings(&[("a", reading("2024-06-01T11:54:59.999999Z"))]);
        let eval = evaluate_at(&gw.devices, &r, threshold(5), NOW);
        assert!(!eval.online);
        assert!(eval.last_seen.is_some());
    }

    #[test]
    fn most_recent_device_wins() {
        let gw = gateway("g", "G", &["old", "new"]);
        let r = readings(&[
            ("old", reading("2024-06-01T10:00:00Z")),
            ("new", reading("2024-06-01T11:59:00Z")),
        ]);
        let eval = evaluate_at(&gw.devices, &r, threshold(5), NOW);
        assert!(eval.online);
        assert_eq!(eval.last_seen, Some(datetime!(2024-06-01 11:59:00 UTC)));
    }

    #[test]
    fn unparseable_readings_are_skipped() {
        let gw = gateway("g", "G", &["bad", "good"]);
        let r = readings(&[
            ("bad", reading("not-a-date")),
            ("good", reading("2024-06-01T11:59:30Z")),
        ]);
        let eval = evaluate_at(&gw.devices, &r, threshold(1), NOW);
        assert!(eval.online);
    }

    #[test]
    fn no_devices_is_offline() {
        let eval = evaluate_at(&[], &HashMap::new(), threshold(5), NOW);
        assert_eq!(eval, Evaluation { online: false, last_seen: None });
    }

    #[test]
    fn all_unparseable_is_offline() {
        let gw = gateway("g", "G", &["a", "b"]);
        let r = readings(&[("a", reading("garbage")), ("b", reading(""))]);
        let eval = evaluate_at(&gw.devices, &r, threshold(60), NOW);
        assert_eq!(eval, Evaluation { online: false, last_seen: None });
    }

    #[test]
    fn readings_for_unknown_serials_ignored() {
        let gw = gateway("g", "G", &["a"]);
        let r = readings(&[("other", reading("2024-06-01T11:59:00Z"))]);
        assert!(!evaluate_at(&gw.devices, &r, threshold(5), NOW).online);
    }

    #[test]
    fn threshold_changes_verdict() {
        let gw = gateway("g", "G", &["a"]);
        let r = readings(&[("a", reading("2024-06-01T11:58:00Z"))]);
        assert!(evaluate_at(&gw.devices, &r, threshold(5), NOW).online);
        assert!(!evaluate_at(&gw.devices, &r, threshold(1), NOW).online);
    }

    #[test]
    fn millisecond_readings_evaluate() {
        let gw = gateway("g", "G", &["a"]);
        let ms = (NOW - Duration::seconds(30)).unix_timestamp() * 1000;
        let r = readings(&[(
            "a",
            Reading {
                ts: Some(RawTimestamp::Millis(ms)),
                power: None,
            },
        )]);
        assert!(evaluate_at(&gw.devices, &r, threshold(1), NOW).online);
    }

    // -- status_factors -----------------------------------------------------

    #[test]
    fn factors_keyed_by_serial() {
        let snapshot = GatewaySnapshot {
            gateway: gateway("g", "G", &["a", "b", "c"]),
            readings: readings(&[
                ("a", reading("2024-06-01T11:58:00Z")),
                ("b", reading("garbage")),
                (
                    "c",
                    Reading {
                        ts: None,
                        power: Some(1.0),
                    },
                ),
            ]),
        };
        let factors = status_factors(&snapshot);
        assert_eq!(factors.len(), 2);
        assert_eq!(
            factors["a"].timestamp.as_deref(),
            Some("2024-06-01T11:58:00.000000Z")
        );
        assert_eq!(factors["a"].power, Some(100.0));
        assert_eq!(factors["a"].der_type.as_deref(), Some("solar"));
        assert!(factors["b"].timestamp.is_none());
    }
}
