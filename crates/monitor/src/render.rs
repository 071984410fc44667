//! Status message rendering for the messaging transport (Telegram MarkdownV2).

use time::OffsetDateTime;

use crate::source::GatewaySnapshot;
use crate::status::{Evaluation, ThresholdMinutes};

/// Characters with structural meaning in MarkdownV2 text.
const MARKDOWN_SPECIAL: &[char] = &[
    '\\', '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Escape free text for interpolation into a MarkdownV2 message.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_SPECIAL.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape text placed inside an inline code span.
pub fn escape_code(text: &str) -> String {
    text.replace('\\', "\\\\").replace('`', "\\`")
}

pub fn format_power(watts: f64) -> String {
    escape_markdown(&format!("{watts}W"))
}

/// Coarse "how long ago" phrasing, e.g. "2 minutes ago".
pub fn humanize_age(then: OffsetDateTime, now: OffsetDateTime) -> String {
    let secs = (now - then).whole_seconds();
    if secs < 1 {
        return "just now".to_string();
    }

    let (n, unit) = match secs {
        s if s < 60 => (s, "second"),
        s if s < 3_600 => (s / 60, "minute"),
        s if s < 86_400 => (s / 3_600, "hour"),
        s => (s / 86_400, "day"),
    };

    match (n, unit) {
        (1, "hour") => "an hour ago".to_string(),
        (1, unit) => format!("a {unit} ago"),
        (n, unit) => format!("{n} {unit}s ago"),
    }
}

/// "1 minute", "5 minutes".
pub fn minutes_phrase(threshold: ThresholdMinutes) -> String {
    match threshold.minutes() {
        1 => "1 minute".to_string(),
        n => format!("{n} minutes"),
    }
}

/// Full status message for one gateway.
pub fn status_message(
    snapshot: &GatewaySnapshot,
    eval: &Evaluation,
    threshold: ThresholdMinutes,
    now: OffsetDateTime,
) -> String {
    let gw = &snapshot.gateway;
    let (icon, status_text) = if eval.online {
        ("🟢", "ONLINE")
    } else {
        ("🔴", "OFFLINE")
    };

    let mut lines = vec![
        format!("{icon} *Gateway: {}*", escape_markdown(&gw.name)),
        format!("ID: `{}`", escape_code(&gw.id)),
        format!("Status: {status_text}"),
    ];

    if let Some(last_seen) = eval.last_seen {
        lines.push(format!(
            "Last data point: {}",
            escape_markdown(&humanize_age(last_seen, now))
        ));
        if !eval.online {
            lines.push(format!(
                "⚠️ *Gateway has not reported data in over {}\\!*",
                minutes_phrase(threshold)
            ));
        }
    }

    lines.push(String::new());

    if !gw.devices.is_empty() {
        lines.push("*DER Information:*".to_string());
        for device in &gw.devices {
            let name = device.name.as_deref().unwrap_or("unnamed");
            lines.push(format!("• Name: {}", escape_markdown(name)));

            if let Some(meta) = &device.meta {
                if let Some(make) = meta.make.as_deref() {
                    lines.push(format!("• Make: {}", escape_markdown(make)));
                }
                if let Some(nominal) = meta.nominal_power {
                    lines.push(format!("• Nominal Power: {}", format_power(nominal)));
                }
            }

            let current = device
                .serial
                .as_deref()
                .and_then(|sn| snapshot.readings.get(sn))
                .and_then(|r| r.power);
            if let Some(power) = current {
                lines.push(format!("• Current Power: {}", format_power(power)));
            }
            lines.push(String::new());
        }
    }

    lines.join("\n")
}

// ===========================================================================
// Tests
// ===========================================================================
