//! TOML config file loading and validation, plus the environment variables
//! that carry secrets and deployment overrides.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::reconciler::ReconcilerSettings;
use crate::status::ThresholdMinutes;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub data_source: DataSourceSection,
    #[serde(default)]
    pub web: WebSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub poll_interval_secs: u64,
    pub default_threshold_minutes: i64,
    pub fetch_timeout_secs: u64,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            default_threshold_minutes: ThresholdMinutes::DEFAULT.minutes(),
            fetch_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DataSourceSection {
    pub api_url: String,
}

impl Default for DataSourceSection {
    fn default() -> Self {
        Self {
            api_url: "https://api.srcful.dev/".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all settings. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        let m = &self.monitor;
        if m.poll_interval_secs == 0 {
            errors.push("monitor.poll_interval_secs must be positive".to_string());
        }
        if m.fetch_timeout_secs == 0 {
            errors.push("monitor.fetch_timeout_secs must be positive".to_string());
        }
        if m.poll_interval_secs > 0 && m.fetch_timeout_secs > m.poll_interval_secs {
            errors.push(format!(
                "monitor.fetch_timeout_secs ({}) exceeds poll_interval_secs ({})",
                m.fetch_timeout_secs, m.poll_interval_secs
            ));
        }
        if let Err(e) = ThresholdMinutes::new(m.default_threshold_minutes) {
            errors.push(format!("monitor.default_threshold_minutes: {e}"));
        }

        let url = self.data_source.api_url.trim();
        if url.is_empty() {
            errors.push("data_source.api_url is empty".to_string());
        } else if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(format!(
                "data_source.api_url '{url}' must start with http:// or https://"
            ));
        }

        if self.web.port == 0 {
            errors.push("web.port must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    pub fn reconciler_settings(&self) -> Result<ReconcilerSettings> {
        Ok(ReconcilerSettings {
            poll_interval: Duration::from_secs(self.monitor.poll_interval_secs),
            fetch_timeout: Duration::from_secs(self.monitor.fetch_timeout_secs),
            default_threshold: ThresholdMinutes::new(self.monitor.default_threshold_minutes)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults.
pub fn load(path: &str) -> Result<Config> {
    let config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "config file not found, using defaults");
        Config::default()
    };
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Secrets and deployment settings that never live in the config file.
#[derive(Debug, Clone)]
pub struct Env {
    pub telegram_token: String,
    pub auth_token: String,
    pub db_url: String,
    pub config_path: String,
    pub web_port: Option<u16>,
    /// Directory for the rolling log file.
    pub log_dir: String,
}

impl Env {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Every missing required
    /// variable is reported at once.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &'static str, missing: &mut Vec<&'static str>| {
            match lookup(key).filter(|v| !v.trim().is_empty()) {
                Some(v) => v,
                None => {
                    missing.push(key);
                    String::new()
                }
            }
        };

        let mut missing = Vec::new();
        let telegram_token = required("TELEGRAM_TOKEN", &mut missing);
        let auth_token = required("AUTH_TOKEN", &mut missing);
        if !missing.is_empty() {
            bail!("missing required environment variable(s): {}", missing.join(", "));
        }

        let web_port = match lookup("WEB_PORT") {
            Some(raw) => Some(
                raw.parse::<u16>()
                    .with_context(|| format!("WEB_PORT '{raw}' is not a valid port"))?,
            ),
            None => None,
        };

        Ok(Self {
            telegram_token,
            auth_token,
            db_url: lookup("DB_URL")
                .unwrap_or_else(|| "sqlite:gateway-monitor.db?mode=rwc".to_string()),
            config_path: lookup("CONFIG_PATH").unwrap_or_else(|| "monitor.toml".to_string()),
            web_port,
            log_dir: lookup("LOG_DIR")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "logs".to_string()),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.monitor.poll_interval_secs, 60);
        assert_eq!(config.monitor.default_threshold_minutes, 5);
        assert_eq!(config.monitor.fetch_timeout_secs, 10);
        assert_eq!(config.data_source.api_url, "https://api.srcful.dev/");
        assert_eq!(config.web.port, 8080);
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_config() {
        let toml_str = r#"
[monitor]
poll_interval_secs = 120

[web]
port = 9000
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.monitor.poll_interval_secs, 120);
        assert_eq!(config.monitor.fetch_timeout_secs, 10);
        assert_eq!(config.web.port, 9000);

        let settings = config.reconciler_settings().unwrap();
        assert_eq!(settings.poll_interval, Duration::from_secs(120));
        assert_eq!(settings.default_threshold.minutes(), 5);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load("/nonexistent/monitor.toml").unwrap();
        assert_eq!(config.monitor.poll_interval_secs, 60);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn rejects_zero_interval() {
        let mut cfg = Config::default();
        cfg.monitor.poll_interval_secs = 0;
        assert_validation_err(&cfg, "poll_interval_secs must be positive");
    }

    #[test]
    fn rejects_timeout_longer_than_interval() {
        let mut cfg = Config::default();
        cfg.monitor.fetch_timeout_secs = 90;
        assert_validation_err(&cfg, "exceeds poll_interval_secs");
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        let mut cfg = Config::default();
        cfg.monitor.default_threshold_minutes = 61;
        assert_validation_err(&cfg, "default_threshold_minutes");
    }

    #[test]
    fn rejects_bad_url() {
        let mut cfg = Config::default();
        cfg.data_source.api_url = "ftp://example".into();
        assert_validation_err(&cfg, "must start with http");
    }

    #[test]
    fn collects_all_errors() {
        let mut cfg = Config::default();
        cfg.monitor.poll_interval_secs = 0;
        cfg.monitor.default_threshold_minutes = 0;
        cfg.data_source.api_url = "".into();
        cfg.web.port = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("(4 errors)"), "got: {msg}");
    }

    // -- Environment ------------------------------------------------------

    #[test]
    fn env_requires_both_tokens() {
        let err = Env::from_lookup(lookup(&[("AUTH_TOKEN", "a")])).unwrap_err();
        assert!(err.to_string().contains("TELEGRAM_TOKEN"));
        assert!(!err.to_string().contains("AUTH_TOKEN"));

        let err = Env::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("TELEGRAM_TOKEN, AUTH_TOKEN"));
    }

    #[test]
    fn env_defaults() {
        let env = Env::from_lookup(lookup(&[("TELEGRAM_TOKEN", "t"), ("AUTH_TOKEN", "a")])).unwrap();
        assert_eq!(env.telegram_token, "t");
        assert_eq!(env.db_url, "sqlite:gateway-monitor.db?mode=rwc");
        assert_eq!(env.config_path, "monitor.toml");
        assert_eq!(env.web_port, None);
        assert_eq!(env.log_dir, "logs");
    }

    #[test]
    fn env_log_dir_override() {
        let env = Env::from_lookup(lookup(&[
            ("TELEGRAM_TOKEN", "t"),
            ("AUTH_TOKEN", "a"),
            ("LOG_DIR", "/var/log/monitor"),
        ]))
        .unwrap();
        assert_eq!(env.log_dir, "/var/log/monitor");
    }

    #[test]
    fn env_rejects_bad_port() {
        let err = Env::from_lookup(lookup(&[
            ("TELEGRAM_TOKEN", "t"),
            ("AUTH_TOKEN", "a"),
            ("WEB_PORT", "http"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("WEB_PORT"));
    }
}
